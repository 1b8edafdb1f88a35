//! Rule mapper.
//!
//! Composes the CIDR and domain matchers behind one lookup with a bounded
//! decision cache. Domains without a rule of their own are resolved and the
//! first address is matched against the CIDR rules.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::matcher::{parse_net, CidrMatcher, DomainMatcher};
use crate::parser::{ensure_rules_file, parse_rules, parse_rules_from_file};
use crate::resolver::Resolver;
use crate::types::{Category, Decision, Mark, TextRule};

/// Rule table published as a unit.
struct RuleTable {
    cidr: CidrMatcher,
    domain: DomainMatcher,
    cache: Mutex<LruCache<String, Decision>>,
}

impl RuleTable {
    fn new(cache_size: NonZeroUsize) -> Self {
        Self {
            cidr: CidrMatcher::new(),
            domain: DomainMatcher::new(),
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    fn insert(&mut self, pattern: &str, mark: Mark) -> Result<()> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Ok(());
        }
        match parse_net(pattern) {
            Ok(net) => self.cidr.insert_net(net, mark),
            Err(e) if pattern.contains('/') => return Err(e),
            Err(_) => self.domain.insert(pattern, mark),
        }
        Ok(())
    }

    /// Build a table from parsed rules, skipping the ones that fail.
    fn from_rules(rules: &[TextRule], cache_size: NonZeroUsize) -> Self {
        let mut table = Self::new(cache_size);
        for rule in rules {
            if let Err(e) = table.insert(&rule.pattern, rule.mark) {
                warn!(line = rule.line_num, pattern = %rule.pattern, error = %e, "skipping bypass rule");
            }
        }
        table
    }

    fn rule_count(&self) -> usize {
        self.cidr.len() + self.domain.len()
    }
}

impl Clone for RuleTable {
    /// Copies the matchers; the copy starts with an empty cache.
    fn clone(&self) -> Self {
        Self {
            cidr: self.cidr.clone(),
            domain: self.domain.clone(),
            cache: Mutex::new(LruCache::new(self.cache.lock().cap())),
        }
    }
}

/// Maps hosts to routing decisions.
///
/// Lookups clone the current table out of the lock, so a concurrent
/// [`clear`](Self::clear) or reload never blocks on an in-flight DNS query.
pub struct RuleMapper {
    table: RwLock<Arc<RuleTable>>,
    resolver: RwLock<Option<Arc<dyn Resolver>>>,
    cache_size: NonZeroUsize,
}

impl RuleMapper {
    /// Create an empty mapper with a decision cache of `cache_size` entries.
    pub fn new(cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            table: RwLock::new(Arc::new(RuleTable::new(cache_size))),
            resolver: RwLock::new(None),
            cache_size,
        }
    }

    /// Resolve unmatched domains with `resolver`.
    pub fn with_resolver(self, resolver: Arc<dyn Resolver>) -> Self {
        *self.resolver.write() = Some(resolver);
        self
    }

    /// Add one rule. Patterns that parse as a CIDR or IP go to the CIDR
    /// matcher, everything else to the domain matcher.
    pub fn insert(&self, pattern: &str, mark: Mark) -> Result<()> {
        let mut guard = self.table.write();
        let table = Arc::make_mut(&mut *guard);
        table.insert(pattern, mark)?;
        table.cache.get_mut().clear();
        Ok(())
    }

    /// Decide for a domain or IP literal.
    pub async fn search(&self, key: &str) -> Decision {
        let key = key.trim().to_ascii_lowercase();
        let table = self.table.read().clone();

        if let Some(decision) = table.cache.lock().get(&key) {
            return *decision;
        }

        let decision = match key.parse::<IpAddr>() {
            Ok(ip) => Decision::new(table.cidr.search_ip(ip), Category::Ip),
            Err(_) => {
                let mark = match table.domain.search(&key) {
                    Some(mark) => Some(mark),
                    None => self.search_resolved(&table, &key).await,
                };
                Decision::new(mark, Category::Domain)
            }
        };

        table.cache.lock().put(key, decision);
        decision
    }

    async fn search_resolved(&self, table: &RuleTable, domain: &str) -> Option<Mark> {
        let resolver = self.resolver.read().clone()?;
        match resolver.resolve(domain).await {
            Ok(ips) => ips.first().and_then(|ip| table.cidr.search_ip(*ip)),
            Err(e) => {
                debug!(domain, error = %e, "rule lookup resolution failed");
                None
            }
        }
    }

    /// Cached decision for `key`, without matching or resolving.
    pub fn search_cached(&self, key: &str) -> Option<Decision> {
        let key = key.trim().to_ascii_lowercase();
        let table = self.table.read().clone();
        let decision = table.cache.lock().get(&key).copied();
        decision
    }

    /// Drop every rule and cached decision.
    pub fn clear(&self) {
        self.publish(RuleTable::new(self.cache_size));
    }

    /// Replace the rules with the ones parsed from `text`.
    ///
    /// Returns the number of rules loaded.
    pub fn load_rules(&self, text: &str) -> usize {
        self.publish_rules(&parse_rules(text))
    }

    /// Replace the rules with the contents of a rule file.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let rules = parse_rules_from_file(path.as_ref())?;
        let count = self.publish_rules(&rules);
        info!(path = %path.as_ref().display(), count, "loaded bypass rules");
        Ok(count)
    }

    /// Create the rule file if missing (from `url`, else the bundled rules),
    /// then load it. Blocking.
    pub fn reload_file(&self, path: impl AsRef<Path>, url: Option<&str>) -> Result<usize> {
        ensure_rules_file(path.as_ref(), url)?;
        self.load_file(path)
    }

    fn publish_rules(&self, rules: &[TextRule]) -> usize {
        let table = RuleTable::from_rules(rules, self.cache_size);
        let count = table.rule_count();
        self.publish(table);
        count
    }

    fn publish(&self, table: RuleTable) {
        *self.table.write() = Arc::new(table);
    }

    /// Swap the resolver used for unmatched domains. Clears cached decisions.
    pub fn set_resolver(&self, resolver: Option<Arc<dyn Resolver>>) {
        *self.resolver.write() = resolver;
        let table = self.table.read().clone();
        table.cache.lock().clear();
    }

    /// Number of cached decisions.
    pub fn cache_len(&self) -> usize {
        let table = self.table.read().clone();
        let len = table.cache.lock().len();
        len
    }

    /// Number of rules in the current table.
    pub fn rule_count(&self) -> usize {
        self.table.read().rule_count()
    }
}

impl Default for RuleMapper {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_DECISION_CACHE_SIZE)
    }
}

impl std::fmt::Debug for RuleMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleMapper")
            .field("rules", &self.rule_count())
            .field("cached", &self.cache_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BypassError;
    use crate::resolver::StaticResolver;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
        answer: Vec<IpAddr>,
    }

    #[async_trait]
    impl Resolver for CountingResolver {
        async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.clone())
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl Resolver for FailingResolver {
        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
            Err(BypassError::ResolveError(format!("no answer for {}", host)))
        }
    }

    #[tokio::test]
    async fn test_ip_and_cidr_rules() {
        let mapper = RuleMapper::new(64);
        mapper.insert("10.0.0.0/8", Mark::Direct).unwrap();
        mapper.insert("1.2.3.4", Mark::Block).unwrap();

        assert_eq!(
            mapper.search("10.1.2.3").await,
            Decision::new(Some(Mark::Direct), Category::Ip)
        );
        assert_eq!(
            mapper.search("1.2.3.4").await,
            Decision::new(Some(Mark::Block), Category::Ip)
        );
        assert_eq!(
            mapper.search("8.8.8.8").await,
            Decision::new(None, Category::Ip)
        );
    }

    #[tokio::test]
    async fn test_domain_rules() {
        let mapper = RuleMapper::new(64);
        mapper.insert("*.google.com", Mark::Proxy).unwrap();
        mapper.insert("example.com", Mark::Direct).unwrap();

        let decision = mapper.search("WWW.Google.com").await;
        assert_eq!(decision, Decision::new(Some(Mark::Proxy), Category::Domain));
        assert_eq!(
            mapper.search("example.com").await.mark,
            Some(Mark::Direct)
        );
        assert!(!mapper.search("www.example.com").await.is_match());
    }

    #[tokio::test]
    async fn test_invalid_cidr_is_rejected() {
        let mapper = RuleMapper::new(64);
        assert!(matches!(
            mapper.insert("10.0.0.0/33", Mark::Direct),
            Err(BypassError::InvalidCidr(_))
        ));
        assert_eq!(mapper.rule_count(), 0);
        assert!(mapper.insert("", Mark::Direct).is_ok());
        assert_eq!(mapper.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_dns_fallback_uses_first_address() {
        let resolver = StaticResolver::new().with_mapping(
            "intranet.test",
            vec!["192.168.1.10".parse().unwrap(), "8.8.8.8".parse().unwrap()],
        );
        let mapper = RuleMapper::new(64).with_resolver(Arc::new(resolver));
        mapper.insert("192.168.0.0/16", Mark::Direct).unwrap();
        mapper.insert("8.8.8.0/24", Mark::Block).unwrap();

        let decision = mapper.search("intranet.test").await;
        assert_eq!(decision, Decision::new(Some(Mark::Direct), Category::Domain));
    }

    #[tokio::test]
    async fn test_resolution_failure_is_no_match() {
        let mapper = RuleMapper::new(64).with_resolver(Arc::new(FailingResolver));
        mapper.insert("0.0.0.0/1", Mark::Direct).unwrap();

        let decision = mapper.search("nowhere.test").await;
        assert_eq!(decision, Decision::new(None, Category::Domain));
        assert_eq!(mapper.search_cached("nowhere.test"), Some(decision));
    }

    #[tokio::test]
    async fn test_decision_is_cached() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            answer: vec!["1.1.1.1".parse().unwrap()],
        });
        let mapper = RuleMapper::new(64).with_resolver(resolver.clone());
        mapper.insert("1.1.1.0/24", Mark::Proxy).unwrap();

        let first = mapper.search("one.test").await;
        let second = mapper.search("ONE.test").await;
        assert_eq!(first, second);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(mapper.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_insert_invalidates_cached_decisions() {
        let mapper = RuleMapper::new(64);
        assert!(!mapper.search("example.com").await.is_match());
        assert!(mapper.search_cached("example.com").is_some());

        mapper.insert("example.com", Mark::Block).unwrap();
        assert!(mapper.search_cached("example.com").is_none());
        assert_eq!(mapper.search("example.com").await.mark, Some(Mark::Block));
    }

    #[tokio::test]
    async fn test_clear_drops_rules_and_cache() {
        let mapper = RuleMapper::new(64);
        mapper.insert("example.com", Mark::Direct).unwrap();
        mapper.search("example.com").await;

        mapper.clear();
        assert_eq!(mapper.rule_count(), 0);
        assert_eq!(mapper.cache_len(), 0);
        assert!(!mapper.search("example.com").await.is_match());
    }

    #[tokio::test]
    async fn test_load_rules_replaces_table() {
        let mapper = RuleMapper::new(64);
        mapper.insert("old.test", Mark::Proxy).unwrap();

        let count = mapper.load_rules(
            "# comment\nexample.com direct\n10.0.0.0/8 block\n10.0.0.0/99 direct\nbad line here\n",
        );
        assert_eq!(count, 2);
        assert_eq!(mapper.rule_count(), 2);
        assert!(!mapper.search("old.test").await.is_match());
        assert_eq!(mapper.search("10.9.9.9").await.mark, Some(Mark::Block));
    }

    #[tokio::test]
    async fn test_set_resolver_clears_cache() {
        let mapper = RuleMapper::new(64);
        mapper.insert("192.168.0.0/16", Mark::Direct).unwrap();
        assert!(!mapper.search("nas.test").await.is_match());

        let resolver =
            StaticResolver::new().with_mapping("nas.test", vec!["192.168.1.2".parse().unwrap()]);
        mapper.set_resolver(Some(Arc::new(resolver)));
        assert_eq!(mapper.cache_len(), 0);
        assert_eq!(mapper.search("nas.test").await.mark, Some(Mark::Direct));
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let mapper = RuleMapper::new(2);
        mapper.search("a.test").await;
        mapper.search("b.test").await;
        mapper.search("c.test").await;
        assert_eq!(mapper.cache_len(), 2);
        assert!(mapper.search_cached("a.test").is_none());
    }
}
