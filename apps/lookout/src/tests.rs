//! End-to-end coverage: a real axum server, a real websocket host, and HTTP
//! visitors, all on an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use lookout_core::{HostHello, HostStatus, PairingToken, ReconnectPolicy, VisitorReport};

use crate::config::Config;
use crate::host::HostConnectionManager;
use crate::registry::ConnectionRegistry;
use crate::relay::DeliveryRelay;
use crate::{router, AppState};

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> SocketAddr {
    let config = Config {
        port: 0,
        reverse_dns_enabled: false,
        reverse_dns_timeout_ms: 100,
    };
    let registry = ConnectionRegistry::new();
    let relay = DeliveryRelay::new(registry.clone());
    let state = Arc::new(AppState {
        config,
        registry,
        relay,
        resolver: None,
        metrics: PrometheusBuilder::new().build_recorder().handle(),
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// Polls `/debug/stats` until the registry reports `expected` live hosts.
async fn wait_for_hosts(addr: SocketAddr, expected: usize) {
    timeout(Duration::from_secs(5), async {
        loop {
            let stats: serde_json::Value = reqwest::get(format!("http://{addr}/debug/stats"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if stats["active_hosts"] == expected as u64 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("registry never reached {expected} hosts"));
}

async fn visit(addr: SocketAddr, token: &str, user_agent: &str, forwarded_ip: &str) {
    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/share-with/{token}"))
        .header("user-agent", user_agent)
        .header("x-forwarded-for", forwarded_ip)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
}

async fn next_report(socket: &mut WsSocket) -> VisitorReport {
    let frame = timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for a relayed report")
        .expect("socket closed before a report arrived")
        .unwrap();
    let Message::Text(text) = frame else {
        panic!("expected a text frame, got {frame:?}");
    };
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn visitor_report_reaches_the_registered_host() {
    let addr = spawn_server().await;
    let token = PairingToken::generate().unwrap();

    let (mut socket, _) = connect_async(format!("ws://{addr}/host/{token}"))
        .await
        .unwrap();
    let hello = serde_json::to_string(&HostHello {
        token: token.to_string(),
    })
    .unwrap();
    socket.send(Message::Text(hello.into())).await.unwrap();
    wait_for_hosts(addr, 1).await;

    visit(addr, token.as_str(), "Mozilla/5.0 Test", "203.0.113.5").await;

    let report = next_report(&mut socket).await;
    assert_eq!(report.user_agent, "Mozilla/5.0 Test");
    assert_eq!(report.ip.as_deref(), Some("203.0.113.5"));
    assert_eq!(report.reverse_dns, None);
}

#[tokio::test]
async fn unknown_and_malformed_tokens_drop_quietly() {
    let addr = spawn_server().await;

    visit(addr, "zzz999", "Mozilla/5.0 Test", "203.0.113.5").await;

    // An overlong token never touches the registry but gets the same page.
    let long = "x".repeat(400);
    visit(addr, &long, "Mozilla/5.0 Test", "203.0.113.5").await;
}

#[tokio::test]
async fn reconnecting_under_the_same_token_restores_deliverability() {
    let addr = spawn_server().await;
    let token = PairingToken::generate().unwrap();

    let (mut first, _) = connect_async(format!("ws://{addr}/host/{token}"))
        .await
        .unwrap();
    wait_for_hosts(addr, 1).await;
    first.close(None).await.unwrap();
    wait_for_hosts(addr, 0).await;

    let (mut second, _) = connect_async(format!("ws://{addr}/host/{token}"))
        .await
        .unwrap();
    wait_for_hosts(addr, 1).await;

    visit(addr, token.as_str(), "Mozilla/5.0 Test", "203.0.113.5").await;
    let report = next_report(&mut second).await;
    assert_eq!(report.user_agent, "Mozilla/5.0 Test");
}

#[tokio::test]
async fn a_newer_registration_supersedes_the_older_socket() {
    let addr = spawn_server().await;
    let token = PairingToken::generate().unwrap();

    let (_stale, _) = connect_async(format!("ws://{addr}/host/{token}"))
        .await
        .unwrap();
    wait_for_hosts(addr, 1).await;

    let (mut current, _) = connect_async(format!("ws://{addr}/host/{token}"))
        .await
        .unwrap();

    // Replacement keeps the count at one, so the stats endpoint cannot tell
    // us when the swap lands. Keep visiting until a report arrives on the
    // newer socket; early visits may still hit the stale registration.
    let report = timeout(Duration::from_secs(5), async {
        loop {
            visit(addr, token.as_str(), "Mozilla/5.0 Test", "203.0.113.5").await;
            match timeout(Duration::from_millis(500), current.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    return serde_json::from_str::<VisitorReport>(&text).unwrap()
                }
                Ok(other) => panic!("unexpected frame on the newer socket: {other:?}"),
                Err(_) => continue,
            }
        }
    })
    .await
    .expect("the newer socket never received a report");
    assert_eq!(report.user_agent, "Mozilla/5.0 Test");
}

#[tokio::test]
async fn host_manager_end_to_end_delivery_and_teardown() {
    let addr = spawn_server().await;
    let token = PairingToken::generate().unwrap();

    let (status_tx, mut status_rx) = watch::channel(HostStatus::AwaitingVisitor);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = HostConnectionManager::new(
        token.clone(),
        &format!("http://{addr}"),
        ReconnectPolicy::exponential(),
        status_tx,
        shutdown_rx,
    );
    let runner = tokio::spawn(manager.run());

    wait_for_hosts(addr, 1).await;
    visit(addr, token.as_str(), "Mozilla/5.0 Test", "203.0.113.5").await;

    timeout(Duration::from_secs(5), async {
        loop {
            status_rx.changed().await.unwrap();
            let status = status_rx.borrow_and_update().clone();
            if let HostStatus::Delivered(report) = status {
                assert_eq!(report.user_agent, "Mozilla/5.0 Test");
                assert_eq!(report.ip.as_deref(), Some("203.0.113.5"));
                return;
            }
        }
    })
    .await
    .expect("host manager never surfaced the delivery");

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(5), runner)
        .await
        .expect("teardown did not stop the session")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn teardown_cancels_a_pending_retry() {
    // Nobody listens here; the first connect fails and arms a long retry.
    let (status_tx, _status_rx) = watch::channel(HostStatus::AwaitingVisitor);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = HostConnectionManager::new(
        "abc123".parse().unwrap(),
        "http://127.0.0.1:9",
        ReconnectPolicy::Exponential {
            floor_ms: 60_000,
            cap_ms: 60_000,
            jitter_ms: 0,
        },
        status_tx,
        shutdown_rx,
    );
    let runner = tokio::spawn(manager.run());

    sleep(Duration::from_millis(200)).await;
    shutdown_tx.send(true).unwrap();

    // Returns well before the 60s timer would have fired.
    timeout(Duration::from_secs(2), runner)
        .await
        .expect("teardown did not interrupt the retry timer")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn teardown_interrupts_an_unanswered_connect() {
    // TEST-NET swallows the SYN, so the connect hangs well past the test;
    // teardown has to cut it off rather than wait for the OS timeout.
    let (status_tx, _status_rx) = watch::channel(HostStatus::AwaitingVisitor);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = HostConnectionManager::new(
        "abc123".parse().unwrap(),
        "http://192.0.2.1:9",
        ReconnectPolicy::Exponential {
            floor_ms: 60_000,
            cap_ms: 60_000,
            jitter_ms: 0,
        },
        status_tx,
        shutdown_rx,
    );
    let runner = tokio::spawn(manager.run());

    sleep(Duration::from_millis(200)).await;
    shutdown_tx.send(true).unwrap();

    timeout(Duration::from_secs(2), runner)
        .await
        .expect("teardown did not interrupt the in-flight connect")
        .unwrap()
        .unwrap();
}
