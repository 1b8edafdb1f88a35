//! Integration tests for rule matching using the bundled rule set.

use std::net::IpAddr;
use std::sync::Arc;

use bypass_engine_r::{
    parse_rules, parse_rules_from_file, Category, Decision, Mark, RuleMapper, StaticResolver,
    DEFAULT_RULES,
};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_cidr_block_rule() {
    let mapper = RuleMapper::new(64);
    mapper.insert("10.0.0.0/8", Mark::Block).unwrap();

    assert_eq!(
        mapper.search("10.1.2.3").await,
        Decision::new(Some(Mark::Block), Category::Ip)
    );
    assert!(!mapper.search("11.1.2.3").await.is_match());
}

#[tokio::test]
async fn test_exact_and_wildcard_domains() {
    let mapper = RuleMapper::new(64);
    mapper.insert("example.com", Mark::Direct).unwrap();
    mapper.insert("*.example.com", Mark::Proxy).unwrap();

    assert_eq!(mapper.search("example.com").await.mark, Some(Mark::Direct));
    assert_eq!(
        mapper.search("api.example.com").await.mark,
        Some(Mark::Proxy)
    );
    assert!(!mapper.search("example.org").await.is_match());
}

#[tokio::test]
async fn test_ipv6_rules() {
    let mapper = RuleMapper::new(64);
    mapper.load_rules("fc00::/7 direct\n2001:db8::1 block\n");

    assert_eq!(mapper.search("fd12::1").await.mark, Some(Mark::Direct));
    assert_eq!(mapper.search("2001:db8::1").await.mark, Some(Mark::Block));
    assert!(!mapper.search("2001:db8::2").await.is_match());
}

#[tokio::test]
async fn test_covering_cidr_inserted_last_wins() {
    let mapper = RuleMapper::new(64);
    mapper.insert("10.1.0.0/16", Mark::Block).unwrap();
    mapper.insert("10.0.0.0/8", Mark::Direct).unwrap();

    // The shorter prefix replaces everything below it.
    assert_eq!(mapper.search("10.1.2.3").await.mark, Some(Mark::Direct));
}

#[tokio::test]
async fn test_unmatched_domain_falls_back_to_resolved_address() {
    let resolver = StaticResolver::new()
        .with_mapping("printer.lan", vec![ip("192.168.1.20")])
        .with_mapping("cdn.test", vec![ip("8.8.4.4"), ip("192.168.1.30")]);
    let mapper = RuleMapper::new(64).with_resolver(Arc::new(resolver));
    mapper.insert("192.168.0.0/16", Mark::Direct).unwrap();

    assert_eq!(
        mapper.search("printer.lan").await,
        Decision::new(Some(Mark::Direct), Category::Domain)
    );
    // Only the first answer is consulted.
    assert!(!mapper.search("cdn.test").await.is_match());
    // Unknown names resolve to nothing and stay unmatched.
    assert!(!mapper.search("nowhere.test").await.is_match());
}

#[tokio::test]
async fn test_bundled_rules() {
    let mapper = RuleMapper::new(1024);
    let loaded = mapper.load_rules(DEFAULT_RULES);
    assert_eq!(loaded, parse_rules(DEFAULT_RULES).len());
    assert!(loaded > 0);

    assert_eq!(mapper.search("192.168.1.1").await.mark, Some(Mark::Direct));
    assert_eq!(mapper.search("127.0.0.1").await.mark, Some(Mark::Direct));
}

#[tokio::test]
async fn test_rule_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.conf");
    std::fs::write(
        &path,
        "# comment\r\n172.16.0.0/12 direct\r\nnot a rule at all\r\nads.test block\r\n",
    )
    .unwrap();

    let rules = parse_rules_from_file(&path).unwrap();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].pattern, "172.16.0.0/12");
    assert_eq!(rules[1].mark, Mark::Block);

    let mapper = RuleMapper::new(64);
    assert_eq!(mapper.load_file(&path).unwrap(), 2);
    assert_eq!(mapper.search("ADS.test").await.mark, Some(Mark::Block));
}

#[tokio::test]
async fn test_concurrent_search_during_reload() {
    let mapper = Arc::new(RuleMapper::new(128));
    mapper.load_rules("10.0.0.0/8 direct\n");

    let mut tasks = Vec::new();
    for i in 0..8 {
        let mapper = mapper.clone();
        tasks.push(tokio::spawn(async move {
            for j in 0..200 {
                let decision = mapper.search(&format!("10.{}.{}.1", i, j % 250)).await;
                // Either table is a valid answer; a torn one is not.
                assert!(matches!(decision.mark, Some(Mark::Direct) | Some(Mark::Block)));
                tokio::task::yield_now().await;
            }
        }));
    }
    for n in 0..50 {
        let mode = if n % 2 == 0 { "block" } else { "direct" };
        mapper.load_rules(&format!("10.0.0.0/8 {}\n", mode));
        tokio::task::yield_now().await;
    }
    for task in tasks {
        task.await.unwrap();
    }
}
