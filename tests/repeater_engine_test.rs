//! Integration tests for the repeater engine

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};

use nrelay::config::{RepeaterConfig, ServerConfig};
use nrelay::metrics::Metrics;
use nrelay::repeater::GREETING;
use nrelay::repeater::MAX_SESSION_LIFETIME;
use nrelay::{EndpointConfig, Engine, EventHub, RelayError, RepeaterEngine};

const WAIT: Duration = Duration::from_secs(5);

/// Repeater on an ephemeral loopback port whose fallback target refuses connections
fn endpoint() -> EndpointConfig {
    EndpointConfig::new(Ipv4Addr::LOCALHOST.into(), 0, Ipv4Addr::LOCALHOST.into(), 9)
}

fn engine_with_metrics(repeater: RepeaterConfig) -> (RepeaterEngine, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new().unwrap());
    let engine = RepeaterEngine::with_settings(
        endpoint(),
        ServerConfig::default(),
        repeater,
        EventHub::default(),
    )
    .unwrap()
    .with_metrics(metrics.clone());
    (engine, metrics)
}

async fn read_greeting(client: &mut TcpStream) {
    let mut buf = [0u8; GREETING.len()];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, GREETING);
}

/// Read until EOF or reset; returns the bytes seen before the close
async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match timeout(WAIT, stream.read(&mut buf)).await.expect("connection was not closed") {
            Ok(0) | Err(_) => return received,
            Ok(n) => received.extend_from_slice(&buf[..n]),
        }
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Connect, answer the greeting with `target` and return both relay ends
async fn negotiate(repeater: SocketAddr, target: &TcpListener) -> (TcpStream, TcpStream) {
    let mut client = TcpStream::connect(repeater).await.unwrap();
    read_greeting(&mut client).await;

    let reply = format!("{}\n", target.local_addr().unwrap());
    client.write_all(reply.as_bytes()).await.unwrap();

    let (upstream, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();
    (client, upstream)
}

#[tokio::test]
async fn test_negotiated_session_relays_to_target() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (engine, _metrics) = engine_with_metrics(RepeaterConfig::default());
    let repeater_addr = engine.start().await.unwrap();

    let (mut client, mut upstream) = negotiate(repeater_addr, &target).await;

    let session = engine.registry().get(&repeater_addr).unwrap();
    assert!(session.authenticated);
    assert_eq!(session.remote_endpoint, target.local_addr().unwrap());

    client.write_all(b"client hello").await.unwrap();
    let mut buf = [0u8; 12];
    timeout(WAIT, upstream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"client hello");

    upstream.write_all(b"server hello").await.unwrap();
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"server hello");

    // Pump termination deregisters the session
    drop(client);
    assert!(read_until_closed(&mut upstream).await.is_empty());
    let registry = Arc::clone(engine.registry());
    wait_for(move || registry.is_empty()).await;

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_garbage_replies_fail_without_dialing() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (engine, metrics) = engine_with_metrics(RepeaterConfig::default());
    let repeater_addr = engine.start().await.unwrap();

    let mut client = TcpStream::connect(repeater_addr).await.unwrap();
    read_greeting(&mut client).await;

    for attempt in 1..=10 {
        client.write_all(b"garbage").await.unwrap();
        if attempt < 10 {
            read_greeting(&mut client).await;
        }
    }

    // No further greeting, just the close
    assert!(read_until_closed(&mut client).await.is_empty());
    assert!(timeout(Duration::from_millis(300), target.accept()).await.is_err());

    let registry = Arc::clone(engine.registry());
    wait_for(move || registry.is_empty()).await;
    assert_eq!(metrics.handshake_failures(), 1);
    assert_eq!(metrics.dial_failures(), 0);
    assert!(engine.is_running());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_second_connection_on_same_endpoint_is_rejected() {
    let (engine, metrics) = engine_with_metrics(RepeaterConfig::default());
    let repeater_addr = engine.start().await.unwrap();

    let mut first = TcpStream::connect(repeater_addr).await.unwrap();
    read_greeting(&mut first).await;
    assert!(engine.registry().contains(&repeater_addr));

    let mut second = TcpStream::connect(repeater_addr).await.unwrap();
    assert!(read_until_closed(&mut second).await.is_empty());
    assert_eq!(metrics.registration_conflicts(), 1);

    // The first session was left untouched
    assert_eq!(engine.registry().len(), 1);
    first.write_all(b"not an address").await.unwrap();
    read_greeting(&mut first).await;

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_endpoint_is_reusable_after_session_ends() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (engine, _metrics) = engine_with_metrics(RepeaterConfig::default());
    let repeater_addr = engine.start().await.unwrap();

    let (client, _upstream) = negotiate(repeater_addr, &target).await;
    drop(client);

    let registry = Arc::clone(engine.registry());
    wait_for(move || registry.is_empty()).await;

    let mut next = TcpStream::connect(repeater_addr).await.unwrap();
    read_greeting(&mut next).await;

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_session_expires_at_its_deadline() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (engine, metrics) = engine_with_metrics(RepeaterConfig {
        session_lifetime: Duration::from_millis(500),
        // The sweep must not wait for the interval when a deadline is nearer
        sweep_interval: Duration::from_secs(60),
        ..RepeaterConfig::default()
    });
    let repeater_addr = engine.start().await.unwrap();

    let started = Instant::now();
    let (mut client, mut upstream) = negotiate(repeater_addr, &target).await;

    // Keep the session busy; expiry does not depend on activity
    client.write_all(b"keepalive").await.unwrap();
    let mut buf = [0u8; 9];
    timeout(WAIT, upstream.read_exact(&mut buf)).await.unwrap().unwrap();

    assert!(read_until_closed(&mut client).await.is_empty());
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(engine.registry().is_empty());
    let counted = metrics.clone();
    wait_for(move || counted.expired_sessions() == 1).await;
    assert!(engine.is_running());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_silent_client_expires_before_negotiating() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (engine, metrics) = engine_with_metrics(RepeaterConfig {
        session_lifetime: Duration::from_millis(300),
        ..RepeaterConfig::default()
    });
    let repeater_addr = engine.start().await.unwrap();

    let mut client = TcpStream::connect(repeater_addr).await.unwrap();
    read_greeting(&mut client).await;

    // Never answer the greeting
    assert!(read_until_closed(&mut client).await.is_empty());
    assert!(engine.registry().is_empty());
    let counted = metrics.clone();
    wait_for(move || counted.expired_sessions() == 1).await;

    assert!(timeout(Duration::from_millis(300), target.accept()).await.is_err());
    assert_eq!(metrics.dial_failures(), 0);

    // The endpoint accepts a new session afterwards
    let mut next = TcpStream::connect(repeater_addr).await.unwrap();
    read_greeting(&mut next).await;

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_unrepresentable_durations_are_rejected() {
    let lifetimes = [Duration::ZERO, Duration::from_secs(u64::MAX / 2)];
    for session_lifetime in lifetimes {
        let result = RepeaterEngine::with_settings(
            endpoint(),
            ServerConfig::default(),
            RepeaterConfig {
                session_lifetime,
                ..RepeaterConfig::default()
            },
            EventHub::default(),
        );
        assert!(matches!(result, Err(RelayError::InvalidConfig(_))));
    }

    let result = RepeaterEngine::with_settings(
        endpoint(),
        ServerConfig::default(),
        RepeaterConfig {
            sweep_interval: Duration::MAX,
            ..RepeaterConfig::default()
        },
        EventHub::default(),
    );
    assert!(matches!(result, Err(RelayError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_longest_lifetime_keeps_accepting() {
    let (engine, _metrics) = engine_with_metrics(RepeaterConfig {
        session_lifetime: MAX_SESSION_LIFETIME,
        ..RepeaterConfig::default()
    });
    let repeater_addr = engine.start().await.unwrap();

    for _ in 0..2 {
        let mut client = TcpStream::connect(repeater_addr).await.unwrap();
        read_greeting(&mut client).await;
        drop(client);

        let registry = Arc::clone(engine.registry());
        wait_for(move || registry.is_empty()).await;
    }
    assert!(engine.is_running());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_sessions_and_restarts() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (engine, _metrics) = engine_with_metrics(RepeaterConfig::default());
    let repeater_addr = engine.start().await.unwrap();

    let (mut negotiated, mut upstream) = negotiate(repeater_addr, &target).await;

    timeout(WAIT, engine.stop()).await.unwrap().unwrap();
    assert!(!engine.is_running());
    assert!(engine.registry().is_empty());
    assert_eq!(engine.active_sessions(), 0);

    assert!(read_until_closed(&mut negotiated).await.is_empty());
    assert!(read_until_closed(&mut upstream).await.is_empty());

    engine.start().await.unwrap();
    assert!(engine.is_running());
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_interrupts_pending_handshake() {
    let (engine, _metrics) = engine_with_metrics(RepeaterConfig::default());
    let repeater_addr = engine.start().await.unwrap();

    let mut client = TcpStream::connect(repeater_addr).await.unwrap();
    read_greeting(&mut client).await;

    timeout(WAIT, engine.stop()).await.unwrap().unwrap();
    assert!(read_until_closed(&mut client).await.is_empty());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_peer_on_other_address_uses_configured_target() {
    use tokio::net::TcpSocket;

    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    let endpoint = EndpointConfig::new(
        Ipv4Addr::LOCALHOST.into(),
        0,
        target_addr.ip(),
        target_addr.port(),
    );
    let engine = RepeaterEngine::new(endpoint, EventHub::default()).unwrap();
    let repeater_addr = engine.start().await.unwrap();

    // 127.0.0.2 is still loopback but differs from the relay's own address
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.2:0".parse().unwrap()).unwrap();
    let mut client = socket.connect(repeater_addr).await.unwrap();

    let (mut upstream, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();
    client.write_all(b"direct").await.unwrap();
    let mut buf = [0u8; 6];
    timeout(WAIT, upstream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"direct");

    engine.stop().await.unwrap();
}
