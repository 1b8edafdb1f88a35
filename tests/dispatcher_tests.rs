//! End-to-end dispatching: rule file, block, direct, upstream and accounting.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bypass_engine_r::{
    relay, Addr, BufferPool, DialFuture, DirectOptions, Dispatcher, DispatcherOptions,
    FnOutbound, Mark, Outbound, TcpConn,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const RULES: &str = "\
# intranet
10.2.0.0/16 direct
127.0.0.0/8 direct
block.example.com block
";

/// Upstream that counts dials and answers with an in-memory pipe.
fn counting_upstream() -> (Arc<dyn Outbound>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let outbound = FnOutbound::new(move |_addr: Addr| -> DialFuture {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let (conn, _remote) = tokio::io::duplex(64);
            Ok(Box::new(conn) as Box<dyn TcpConn>)
        })
    });
    (Arc::new(outbound), calls)
}

fn dispatcher_with_rules(dir: &tempfile::TempDir) -> Dispatcher {
    let path = dir.path().join("bypass.conf");
    std::fs::write(&path, RULES).unwrap();

    let options = DispatcherOptions::new()
        .with_rules_path(&path)
        .with_direct(DirectOptions {
            timeout: Some(Duration::from_millis(300)),
            ..Default::default()
        });
    let dispatcher = Dispatcher::new(options).unwrap();
    // Unmatched domains stay unmatched instead of reaching a real DNS server.
    dispatcher.mapper().set_resolver(None);
    dispatcher
}

async fn echo_listener() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_rule_file_block_and_direct() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher_with_rules(&dir);
    assert_eq!(dispatcher.mapper().rule_count(), 3);

    let (upstream, calls) = counting_upstream();
    dispatcher.set_proxy(Some(upstream), "node-a").unwrap();

    let err = dispatcher
        .forward("block.example.com:443")
        .await
        .err()
        .unwrap();
    assert!(err.is_blocked());
    assert!(err.to_string().contains("block.example.com:443"));

    assert_eq!(dispatcher.decide("10.2.5.5").await, Some(Mark::Direct));
    // The address is unlikely to answer here; what matters is that the
    // request never reaches the upstream.
    let _ = dispatcher.forward("10.2.5.5:80").await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_direct_rule_connects_without_upstream() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher_with_rules(&dir);
    let (upstream, calls) = counting_upstream();
    dispatcher.set_proxy(Some(upstream), "node-a").unwrap();

    let echo = echo_listener().await;
    let mut conn = dispatcher.forward(&echo.to_string()).await.unwrap();
    assert_eq!(conn.mark(), Some(Mark::Direct));
    assert_eq!(conn.peer_addr().unwrap(), echo);

    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_bypass_disabled_always_uses_upstream() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher_with_rules(&dir);
    let (upstream, calls) = counting_upstream();
    dispatcher.set_proxy(Some(upstream), "node-a").unwrap();
    dispatcher.set_bypass_enabled(false);

    let conn = dispatcher.forward("10.2.5.5:80").await.unwrap();
    assert_eq!(conn.mark(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    dispatcher.forward("block.example.com:443").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unmatched_domain_goes_upstream() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher_with_rules(&dir);
    let (upstream, calls) = counting_upstream();
    dispatcher.set_proxy(Some(upstream), "node-a").unwrap();

    let conn = dispatcher.forward("www.example.org:443").await.unwrap();
    assert_eq!(conn.destination(), "www.example.org:443");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_relay_accounting_through_dispatcher() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher_with_rules(&dir);

    // Remote: read the whole request, answer with 2000 bytes, close.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = listener.local_addr().unwrap();
    let remote = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        stream.read_to_end(&mut request).await.unwrap();
        stream.write_all(&[7u8; 2000]).await.unwrap();
        stream.shutdown().await.unwrap();
        request.len()
    });

    let upstream_conn = dispatcher.forward(&remote_addr.to_string()).await.unwrap();
    let (client_side, mut client) = tokio::io::duplex(4096);

    let pool = BufferPool::default();
    let (stats, response) = tokio::join!(relay(client_side, upstream_conn, &pool), async {
        client.write_all(&[1u8; 1000]).await.unwrap();
        client.shutdown().await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        response
    });

    assert_eq!(remote.await.unwrap(), 1000);
    assert_eq!(response.len(), 2000);
    assert_eq!((stats.a_to_b, stats.b_to_a), (1000, 2000));

    let statistics = dispatcher.statistics();
    statistics.settle().await;
    assert_eq!(statistics.upload(), 1000);
    assert_eq!(statistics.download(), 2000);
    assert_eq!(statistics.connection_count(), 0);
}

#[tokio::test]
async fn test_rules_reload_picks_up_file_changes() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher_with_rules(&dir);
    assert_eq!(
        dispatcher.decide("block.example.com").await,
        Some(Mark::Block)
    );

    std::fs::write(dir.path().join("bypass.conf"), "block.example.com proxy\n").unwrap();
    assert_eq!(dispatcher.reload_rules().await.unwrap(), 1);
    assert_eq!(
        dispatcher.decide("block.example.com").await,
        Some(Mark::Proxy)
    );
    assert_eq!(dispatcher.decide("10.2.5.5").await, None);
}

#[tokio::test]
async fn test_rule_file_with_latin1_comment_still_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bypass.conf");
    std::fs::write(&path, b"# r\xe8gles locales\n10.0.0.0/8 direct\nads.test block\n").unwrap();

    let dispatcher = Dispatcher::new(DispatcherOptions::new().with_rules_path(&path)).unwrap();
    dispatcher.mapper().set_resolver(None);
    assert_eq!(dispatcher.mapper().rule_count(), 2);
    assert_eq!(dispatcher.decide("10.9.9.9").await, Some(Mark::Direct));
    assert_eq!(dispatcher.decide("ads.test").await, Some(Mark::Block));
}
