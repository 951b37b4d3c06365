//! Tunnel runtime integration tests: control protocol, registry
//! semantics, dispatch, bridging, and cleanup, all over in-memory
//! transports

mod common;

use axum::body::Body;
use axum::http::Request;
use chrono::Utc;
use common::{expect_opened, setup, setup_with_plan, TestClient, TEST_TOKEN};
use fxtunnel_proto::httpframe::{
    read_request_head, write_response_head, BodyLen, FramedResponseHead,
};
use fxtunnel_proto::{codes, ControlMessage, TunnelKind};
use fxtunnel_server::{intercept, replay};
use fxtunnel_store::{PlanRecord, ReservedSubdomainRecord, Store};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));

/// Answer framed HTTP requests on accepted streams like a real client
/// would, collecting the request bodies it sees
fn serve_http_tunnel(
    client: &TestClient,
    status: u16,
    response_body: &'static [u8],
) -> Arc<Mutex<Vec<Vec<u8>>>> {
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let seen = bodies.clone();
    let mux = client.mux.clone();
    tokio::spawn(async move {
        loop {
            let stream = match mux.accept_stream().await {
                Ok(s) => s,
                Err(_) => return,
            };
            let seen = seen.clone();
            tokio::spawn(async move {
                let (mut rd, mut wr) = tokio::io::split(stream);
                let head = read_request_head(&mut rd).await.unwrap();
                let body = match head.body_len {
                    BodyLen::Known(n) => {
                        let mut buf = vec![0u8; n as usize];
                        rd.read_exact(&mut buf).await.unwrap();
                        buf
                    }
                    BodyLen::Streamed => {
                        let mut buf = Vec::new();
                        rd.read_to_end(&mut buf).await.unwrap();
                        buf
                    }
                };
                seen.lock().await.push(body);

                write_response_head(
                    &mut wr,
                    &FramedResponseHead {
                        status,
                        headers: vec![(
                            "content-length".to_string(),
                            response_body.len().to_string(),
                        )],
                        body_len: BodyLen::Known(response_body.len() as u32),
                    },
                )
                .await
                .unwrap();
                wr.write_all(response_body).await.unwrap();
                wr.shutdown().await.unwrap();
            });
        }
    });
    bodies
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_auth_rejects_bad_token() {
    let env = setup(25100).await;
    let mut client = TestClient::connect(&env.state).await;
    match client.auth("sk_wrong_token").await {
        ControlMessage::AuthErr { code, .. } => assert_eq!(code, codes::BAD_TOKEN),
        other => panic!("expected auth_err, got {:?}", other),
    }
}

#[tokio::test]
async fn test_auth_must_be_first() {
    let env = setup(25110).await;
    let mut client = TestClient::connect(&env.state).await;
    client
        .send(&ControlMessage::OpenTunnel {
            kind: TunnelKind::Http,
            subdomain: None,
            port: None,
            name: None,
        })
        .await;
    match client.recv().await {
        ControlMessage::AuthErr { code, .. } => assert_eq!(code, codes::NOT_AUTHENTICATED),
        other => panic!("expected auth_err, got {:?}", other),
    }
}

#[tokio::test]
async fn test_auth_ok_carries_plan_limits() {
    let env = setup(25120).await;
    let mut client = TestClient::connect(&env.state).await;
    match client.auth(TEST_TOKEN).await {
        ControlMessage::AuthOk { plan_limits, .. } => {
            assert_eq!(plan_limits.max_tunnels, 8);
            assert!(plan_limits.inspector_enabled);
        }
        other => panic!("expected auth_ok, got {:?}", other),
    }
}

#[tokio::test]
async fn test_http_dispatch_round_trip_and_capture() {
    let env = setup(25130).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    let (tunnel_id, subdomain, _) = expect_opened(client.open_http(Some("demo")).await);
    assert_eq!(subdomain.as_deref(), Some("demo"));

    let _bodies = serve_http_tunnel(&client, 200, b"hello");

    let tunnel = env.state.registry.lookup_subdomain("demo").await.unwrap();
    assert_eq!(tunnel.id, tunnel_id);

    let request = Request::builder()
        .method("GET")
        .uri("/hello")
        .header("host", "demo.example.test")
        .header("content-length", "0")
        .body(Body::empty())
        .unwrap();

    let response = intercept::dispatch(
        env.state.clone(),
        tunnel.clone(),
        request,
        "demo.example.test".to_string(),
        PEER,
        None,
        None,
    )
    .await;
    assert_eq!(response.status(), 200);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"hello");

    // The capture record lands asynchronously after the body drains
    wait_for("captured exchange", || async {
        env.state.inspect.ring_len(tunnel_id) > 0
    })
    .await;
    let exchanges = env.state.inspect.list(tunnel_id, 0, 10);
    assert_eq!(exchanges.len(), 1);
    let exchange = &exchanges[0];
    assert_eq!(exchange.tunnel_id, tunnel_id);
    assert_eq!(exchange.method, "GET");
    assert_eq!(exchange.path, "/hello");
    assert_eq!(exchange.status, 200);
    assert!(exchange.duration_ns > 0);
    assert!(!exchange.error);
    assert_eq!(exchange.host, "demo.example.test");
}

#[tokio::test]
async fn test_reserved_subdomain_blocks_other_principal() {
    let env = setup(25140).await;
    // Reserve "held" for a different user
    env.store
        .put_reserved_subdomain(ReservedSubdomainRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            subdomain: "held".to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    match client.open_http(Some("held")).await {
        ControlMessage::TunnelErr { code, .. } => assert_eq!(code, codes::SUBDOMAIN_TAKEN),
        other => panic!("expected tunnel_err, got {:?}", other),
    }
    // The failure left no trace in the registry
    assert!(env.state.registry.lookup_subdomain("held").await.is_none());
    assert_eq!(env.state.registry.len().await, 0);
}

#[tokio::test]
async fn test_invalid_subdomain_rejected() {
    let env = setup(25150).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    match client.open_http(Some("Not.Valid")).await {
        ControlMessage::TunnelErr { code, .. } => assert_eq!(code, codes::INVALID_SUBDOMAIN),
        other => panic!("expected tunnel_err, got {:?}", other),
    }
}

#[tokio::test]
async fn test_random_subdomain_when_unspecified() {
    let env = setup(25160).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    let (_, subdomain, _) = expect_opened(client.open_http(None).await);
    let label = subdomain.unwrap();
    assert_eq!(label.len(), 8);
    assert!(env.state.registry.lookup_subdomain(&label).await.is_some());
}

#[tokio::test]
async fn test_quota_exceeded() {
    let env = setup_with_plan(
        25170,
        PlanRecord {
            id: "default".to_string(),
            max_tunnels: 2,
            max_subdomains: 8,
            max_custom_domains: 4,
            inspector_enabled: false,
        },
    )
    .await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    expect_opened(client.open_http(Some("one")).await);
    expect_opened(client.open_http(Some("two")).await);
    match client.open_http(Some("three")).await {
        ControlMessage::TunnelErr { code, .. } => assert_eq!(code, codes::QUOTA_EXCEEDED),
        other => panic!("expected tunnel_err, got {:?}", other),
    }
    assert_eq!(env.state.registry.count_by_principal(env.user_id).await, 2);
}

#[tokio::test]
async fn test_eviction_on_reopen_same_binding() {
    let env = setup(25180).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;

    let (first_id, _, _) = expect_opened(client.open_http(Some("x")).await);
    let first = env.state.registry.lookup_subdomain("x").await.unwrap();
    assert_eq!(first.id, first_id);

    // Re-binding the same subdomain evicts the first tunnel; the close
    // notice precedes the open reply
    client
        .send(&ControlMessage::OpenTunnel {
            kind: TunnelKind::Http,
            subdomain: Some("x".to_string()),
            port: None,
            name: None,
        })
        .await;
    match client.recv().await {
        ControlMessage::TunnelClosed { tunnel_id } => assert_eq!(tunnel_id, first_id),
        other => panic!("expected tunnel_closed, got {:?}", other),
    }
    let (second_id, _, _) = expect_opened(client.recv().await);
    assert_ne!(first_id, second_id);

    // Routing follows the newer tunnel; the old one is gone and cancelled
    assert_eq!(env.state.registry.lookup_subdomain("x").await.unwrap().id, second_id);
    assert!(env.state.registry.get(first_id).await.is_none());
    assert!(first.cancel.is_cancelled());
    assert_eq!(env.state.registry.count_by_principal(env.user_id).await, 1);
}

#[tokio::test]
async fn test_tcp_auto_allocation_and_echo() {
    let env = setup(25200).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;

    let (tunnel_id, _, port) = expect_opened(client.open_port(TunnelKind::Tcp, 0).await);
    let port = port.unwrap();
    assert!((25200..=25209).contains(&port));

    // Client side: echo pong for ping on the bridged stream
    let mux = client.mux.clone();
    tokio::spawn(async move {
        let stream = mux.accept_stream().await.unwrap();
        let (mut rd, mut wr) = tokio::io::split(stream);
        let mut buf = vec![0u8; 5];
        rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");
        wr.write_all(b"pong\n").await.unwrap();
        wr.shutdown().await.unwrap();
    });

    // External peer
    let mut socket = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    socket.write_all(b"ping\n").await.unwrap();
    let mut reply = vec![0u8; 5];
    timeout(Duration::from_secs(5), socket.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(&reply, b"pong\n");

    let tunnel = env.state.registry.get(tunnel_id).await.unwrap();
    wait_for("tunnel counters", || async {
        use std::sync::atomic::Ordering;
        tunnel.counters.bytes_sent.load(Ordering::Relaxed) >= 5
            && tunnel.counters.bytes_received.load(Ordering::Relaxed) >= 5
    })
    .await;
}

#[tokio::test]
async fn test_tcp_explicit_port_taken_by_other_principal() {
    let env = setup(25220).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    let (_, _, port) = expect_opened(client.open_port(TunnelKind::Tcp, 25221).await);
    assert_eq!(port, Some(25221));

    // A second principal wants the same port
    let other_user = Uuid::new_v4();
    env.store
        .put_user(fxtunnel_store::UserRecord {
            id: other_user,
            display_name: "other".to_string(),
            is_admin: false,
            plan_id: "default".to_string(),
            disabled: false,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    env.store
        .put_token(fxtunnel_store::ApiTokenRecord {
            id: Uuid::new_v4(),
            user_id: other_user,
            token_hash: fxtunnel_store::hash_token("sk_other_token"),
            allowed_subdomains: vec![],
            allowed_ips: vec![],
            max_tunnels: -1,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut other = TestClient::connect(&env.state).await;
    other.auth("sk_other_token").await;
    match other.open_port(TunnelKind::Tcp, 25221).await {
        ControlMessage::TunnelErr { code, .. } => assert_eq!(code, codes::PORT_TAKEN),
        msg => panic!("expected tunnel_err, got {:?}", msg),
    }
}

#[tokio::test]
async fn test_udp_session_round_trip() {
    let env = setup(25240).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;

    let (_, _, port) = expect_opened(client.open_port(TunnelKind::Udp, 0).await);
    let port = port.unwrap();

    // Client side: one datagram in, one reply out
    let mux = client.mux.clone();
    tokio::spawn(async move {
        use fxtunnel_proto::udpframe::{read_datagram, read_session_header, write_datagram};
        let stream = mux.accept_stream().await.unwrap();
        let (mut rd, mut wr) = tokio::io::split(stream);
        let _peer = read_session_header(&mut rd).await.unwrap();
        let datagram = read_datagram(&mut rd).await.unwrap().unwrap();
        assert_eq!(&datagram, b"ping");
        write_datagram(&mut wr, b"pong").await.unwrap();
    });

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"ping", ("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"pong");
}

#[tokio::test]
async fn test_close_tunnel_via_control() {
    let env = setup(25260).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    let (tunnel_id, _, _) = expect_opened(client.open_http(Some("gone")).await);

    client.send(&ControlMessage::CloseTunnel { tunnel_id }).await;
    match client.recv().await {
        ControlMessage::TunnelClosed { tunnel_id: closed } => assert_eq!(closed, tunnel_id),
        other => panic!("expected tunnel_closed, got {:?}", other),
    }
    assert!(env.state.registry.lookup_subdomain("gone").await.is_none());

    // Closing an unknown tunnel fails cleanly
    client.send(&ControlMessage::CloseTunnel { tunnel_id }).await;
    match client.recv().await {
        ControlMessage::TunnelErr { code, .. } => assert_eq!(code, codes::UNKNOWN_TUNNEL),
        other => panic!("expected tunnel_err, got {:?}", other),
    }
}

#[tokio::test]
async fn test_heartbeat_acked() {
    let env = setup(25270).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    client.send(&ControlMessage::Heartbeat {}).await;
    match client.recv().await {
        ControlMessage::HeartbeatAck { .. } => {}
        other => panic!("expected heartbeat_ack, got {:?}", other),
    }
}

#[tokio::test]
async fn test_session_death_cleans_up_everything() {
    let env = setup(25280).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    expect_opened(client.open_http(Some("doomed")).await);
    let (_, _, tcp_a) = expect_opened(client.open_port(TunnelKind::Tcp, 0).await);
    let (_, _, tcp_b) = expect_opened(client.open_port(TunnelKind::Tcp, 0).await);
    assert_eq!(env.state.registry.len().await, 3);
    let free_before = env.state.tcp_ports.free_count();

    // Kill the transport underneath the session
    client.mux.close("test kills transport").await;

    wait_for("registry cleanup", || async { env.state.registry.is_empty().await }).await;
    assert_eq!(env.state.registry.count_by_principal(env.user_id).await, 0);
    assert!(env.state.registry.lookup_subdomain("doomed").await.is_none());
    assert_eq!(env.state.sessions.count().await, 0);

    // Both TCP ports were returned to the allocator
    wait_for("port release", || async {
        env.state.tcp_ports.free_count() == free_before + 2
    })
    .await;
    assert!(env.state.tcp_ports.allocate_exact(tcp_a.unwrap()).is_ok());
    assert!(env.state.tcp_ports.allocate_exact(tcp_b.unwrap()).is_ok());
}

#[tokio::test]
async fn test_replay_references_original_and_reaches_client_twice() {
    let env = setup(25300).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    let (tunnel_id, _, _) = expect_opened(client.open_http(Some("rep")).await);
    let bodies = serve_http_tunnel(&client, 200, b"ok");

    let tunnel = env.state.registry.lookup_subdomain("rep").await.unwrap();
    let original_body = b"{\"n\":1}";
    let request = Request::builder()
        .method("POST")
        .uri("/v1/do")
        .header("host", "rep.example.test")
        .header("content-length", original_body.len().to_string())
        .body(Body::from(&original_body[..]))
        .unwrap();
    let response = intercept::dispatch(
        env.state.clone(),
        tunnel,
        request,
        "rep.example.test".to_string(),
        PEER,
        None,
        None,
    )
    .await;
    assert_eq!(response.status(), 200);
    let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

    wait_for("original capture", || async { env.state.inspect.ring_len(tunnel_id) >= 1 }).await;
    let original = env.state.inspect.list(tunnel_id, 0, 1)[0].clone();
    assert_eq!(original.method, "POST");
    assert!(original.replay_ref.is_none());

    let replayed = replay::replay_exchange(
        env.state.clone(),
        &original,
        replay::ReplayOverrides {
            body: Some(b"{\"n\":2}".to_vec()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(replayed.replay_ref, Some(original.id));
    assert_eq!(replayed.host, original.host);
    assert_eq!(replayed.status, 200);

    let seen = bodies.lock().await;
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], original_body.to_vec());
    assert_eq!(seen[1], b"{\"n\":2}".to_vec());
}

#[tokio::test]
async fn test_replay_fails_when_tunnel_gone() {
    let env = setup(25320).await;
    let exchange = fxtunnel_store::CapturedExchange {
        id: Uuid::new_v4(),
        tunnel_id: Uuid::new_v4(),
        host: "vanished.example.test".to_string(),
        timestamp: Utc::now(),
        duration_ns: 1,
        method: "GET".to_string(),
        path: "/".to_string(),
        status: 200,
        req_headers: vec![],
        resp_headers: vec![],
        req_body: String::new(),
        resp_body: String::new(),
        req_truncated: false,
        resp_truncated: false,
        error: false,
        replay_ref: None,
    };
    let err = replay::replay_exchange(env.state.clone(), &exchange, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, replay::ReplayError::TunnelGone));
}

#[tokio::test]
async fn test_inspect_ring_capacity_bounded() {
    let env = setup(25340).await;
    let tunnel_id = Uuid::new_v4();
    let capacity = env.state.config.inspect.ring_capacity;
    for i in 0..(capacity + 25) {
        env.state.inspect.push(fxtunnel_store::CapturedExchange {
            id: Uuid::new_v4(),
            tunnel_id,
            host: "cap.example.test".to_string(),
            timestamp: Utc::now(),
            duration_ns: i as u64 + 1,
            method: "GET".to_string(),
            path: format!("/{}", i),
            status: 200,
            req_headers: vec![],
            resp_headers: vec![],
            req_body: String::new(),
            resp_body: String::new(),
            req_truncated: false,
            resp_truncated: false,
            error: false,
            replay_ref: None,
        });
    }
    assert_eq!(env.state.inspect.ring_len(tunnel_id), capacity);
    // Latest first, oldest evicted
    let newest = env.state.inspect.list(tunnel_id, 0, 1);
    assert_eq!(newest[0].path, format!("/{}", capacity + 24));
}

#[tokio::test]
async fn test_token_subdomain_allow_list() {
    let env = setup(25360).await;
    let scoped_user = Uuid::new_v4();
    env.store
        .put_user(fxtunnel_store::UserRecord {
            id: scoped_user,
            display_name: "scoped".to_string(),
            is_admin: false,
            plan_id: "default".to_string(),
            disabled: false,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    env.store
        .put_token(fxtunnel_store::ApiTokenRecord {
            id: Uuid::new_v4(),
            user_id: scoped_user,
            token_hash: fxtunnel_store::hash_token("sk_scoped_token"),
            allowed_subdomains: vec!["team-*".to_string()],
            allowed_ips: vec![],
            max_tunnels: -1,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut client = TestClient::connect(&env.state).await;
    client.auth("sk_scoped_token").await;

    match client.open_http(Some("other")).await {
        ControlMessage::TunnelErr { code, .. } => {
            assert_eq!(code, codes::SUBDOMAIN_NOT_ALLOWED)
        }
        other => panic!("expected tunnel_err, got {:?}", other),
    }
    let (_, subdomain, _) = expect_opened(client.open_http(Some("team-x")).await);
    assert_eq!(subdomain.as_deref(), Some("team-x"));
}

#[tokio::test]
async fn test_capture_truncates_large_request_body() {
    let env = common::setup_custom(
        25380,
        PlanRecord {
            id: "default".to_string(),
            max_tunnels: 8,
            max_subdomains: 8,
            max_custom_domains: 4,
            inspector_enabled: true,
        },
        |config| {
            config.server.inspect.max_request_body = 4;
        },
    )
    .await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    let (tunnel_id, _, _) = expect_opened(client.open_http(Some("big")).await);
    let _bodies = serve_http_tunnel(&client, 200, b"ok");

    let tunnel = env.state.registry.lookup_subdomain("big").await.unwrap();
    let body = b"0123456789";
    let request = Request::builder()
        .method("POST")
        .uri("/upload")
        .header("host", "big.example.test")
        .header("content-length", body.len().to_string())
        .body(Body::from(&body[..]))
        .unwrap();
    let response = intercept::dispatch(
        env.state.clone(),
        tunnel,
        request,
        "big.example.test".to_string(),
        PEER,
        None,
        None,
    )
    .await;
    assert_eq!(response.status(), 200);
    let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

    wait_for("truncated capture", || async { env.state.inspect.ring_len(tunnel_id) > 0 }).await;
    let exchange = env.state.inspect.list(tunnel_id, 0, 1)[0].clone();
    assert!(exchange.req_truncated);
    assert_eq!(exchange.req_body_bytes(), b"0123");
    // The forwarded body was not truncated, only the capture
    let seen = _bodies.lock().await;
    assert_eq!(seen[0], body.to_vec());
}

#[tokio::test]
async fn test_slow_inspect_subscriber_is_dropped() {
    let env = setup(25400).await;
    let tunnel_id = Uuid::new_v4();
    let (_sub, mut rx) = env.state.inspect.subscribe(tunnel_id);

    // Never read while far more than the channel depth arrives
    for i in 0..32 {
        env.state.inspect.push(fxtunnel_store::CapturedExchange {
            id: Uuid::new_v4(),
            tunnel_id,
            host: "slow.example.test".to_string(),
            timestamp: Utc::now(),
            duration_ns: i + 1,
            method: "GET".to_string(),
            path: format!("/{}", i),
            status: 200,
            req_headers: vec![],
            resp_headers: vec![],
            req_body: String::new(),
            resp_body: String::new(),
            req_truncated: false,
            resp_truncated: false,
            error: false,
            replay_ref: None,
        });
    }

    // The buffered prefix drains, then the channel is closed: the
    // subscriber was dropped instead of stalling the producer
    let mut received = 0;
    while rx.recv().await.is_some() {
        received += 1;
    }
    assert!(received < 32, "subscriber survived {} events", received);
}
