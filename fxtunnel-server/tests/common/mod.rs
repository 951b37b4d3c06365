//! Shared fixtures: a ServerState over a temp store with generated
//! certificates, and a duplex-backed control client

use chrono::Utc;
use fxtunnel_config::{Config, PortRange};
use fxtunnel_mux::{MuxConfig, MuxSession, MuxStream};
use fxtunnel_proto::{read_control, write_control, ControlMessage, TunnelKind};
use fxtunnel_server::certs::CertManager;
use fxtunnel_server::session;
use fxtunnel_server::state::ServerState;
use fxtunnel_store::{hash_token, ApiTokenRecord, FileStore, PlanRecord, Store, UserRecord};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{ReadHalf, WriteHalf};
use uuid::Uuid;

pub const TEST_TOKEN: &str = "sk_fxtunnel_a1b2c3d4e5f6";

pub struct TestEnv {
    pub state: Arc<ServerState>,
    pub store: Arc<FileStore>,
    pub user_id: Uuid,
    pub _dir: TempDir,
}

/// Build a ServerState with a seeded store. `port_base` keeps parallel
/// tests off each other's ports.
pub async fn setup(port_base: u16) -> TestEnv {
    setup_with_plan(
        port_base,
        PlanRecord {
            id: "default".to_string(),
            max_tunnels: 8,
            max_subdomains: 8,
            max_custom_domains: 4,
            inspector_enabled: true,
        },
    )
    .await
}

pub async fn setup_with_plan(port_base: u16, plan: PlanRecord) -> TestEnv {
    setup_custom(port_base, plan, |_| {}).await
}

pub async fn setup_custom(
    port_base: u16,
    plan: PlanRecord,
    tweak: impl FnOnce(&mut Config),
) -> TestEnv {
    let dir = TempDir::new().unwrap();

    let cert = rcgen::generate_simple_self_signed(vec![
        "*.example.test".to_string(),
        "example.test".to_string(),
    ])
    .unwrap();
    let cert_path = dir.path().join("wildcard.pem");
    let key_path = dir.path().join("wildcard.key");
    std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

    let mut config = Config::default();
    config.server.base_domain = "example.test".to_string();
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.tcp_range = PortRange { min: port_base, max: port_base + 9 };
    config.server.udp_range = PortRange { min: port_base + 10, max: port_base + 19 };
    config.server.api.jwt_secret = "0123456789abcdef0123456789abcdef".to_string();
    config.server.store_path = dir.path().join("store.json");
    config.server.tls.wildcard_cert_file = Some(cert_path);
    config.server.tls.wildcard_key_file = Some(key_path);
    tweak(&mut config);

    let store = Arc::new(FileStore::open(config.server.store_path.clone()).await.unwrap());

    let user = UserRecord {
        id: Uuid::new_v4(),
        display_name: "tester".to_string(),
        is_admin: false,
        plan_id: plan.id.clone(),
        disabled: false,
        created_at: Utc::now(),
    };
    store.put_plan(plan).await.unwrap();
    store.put_user(user.clone()).await.unwrap();
    store
        .put_token(ApiTokenRecord {
            id: Uuid::new_v4(),
            user_id: user.id,
            token_hash: hash_token(TEST_TOKEN),
            allowed_subdomains: Vec::new(),
            allowed_ips: Vec::new(),
            max_tunnels: -1,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let certs = CertManager::load(&config.server, store.clone() as Arc<dyn Store>).unwrap();
    let state = ServerState::new(config.server.clone(), store.clone() as Arc<dyn Store>, certs);

    TestEnv { state, store, user_id: user.id, _dir: dir }
}

/// A scripted control client talking to `run_control_connection` over a
/// duplex transport
pub struct TestClient {
    pub mux: MuxSession,
    pub control_rd: ReadHalf<MuxStream>,
    pub control_wr: WriteHalf<MuxStream>,
}

impl TestClient {
    pub async fn connect(state: &Arc<ServerState>) -> TestClient {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let state = state.clone();
        tokio::spawn(session::run_control_connection(
            state,
            server_io,
            "127.0.0.1:50000".parse().unwrap(),
        ));
        let mux = MuxSession::client(client_io, MuxConfig::default());
        let control = mux.take_control_stream().unwrap();
        let (control_rd, control_wr) = tokio::io::split(control);
        TestClient { mux, control_rd, control_wr }
    }

    pub async fn send(&mut self, msg: &ControlMessage) {
        write_control(&mut self.control_wr, msg).await.unwrap();
    }

    pub async fn recv(&mut self) -> ControlMessage {
        tokio::time::timeout(std::time::Duration::from_secs(5), read_control(&mut self.control_rd))
            .await
            .expect("timed out waiting for control message")
            .unwrap()
            .expect("control stream closed")
    }

    /// Authenticate and return the server's reply
    pub async fn auth(&mut self, token: &str) -> ControlMessage {
        self.send(&ControlMessage::Auth {
            token: token.to_string(),
            client_version: "1.0".to_string(),
        })
        .await;
        self.recv().await
    }

    pub async fn open_http(&mut self, subdomain: Option<&str>) -> ControlMessage {
        self.send(&ControlMessage::OpenTunnel {
            kind: TunnelKind::Http,
            subdomain: subdomain.map(|s| s.to_string()),
            port: None,
            name: None,
        })
        .await;
        self.recv().await
    }

    pub async fn open_port(&mut self, kind: TunnelKind, port: u16) -> ControlMessage {
        self.send(&ControlMessage::OpenTunnel {
            kind,
            subdomain: None,
            port: Some(port),
            name: None,
        })
        .await;
        self.recv().await
    }
}

/// Unpack a TunnelOpened reply or panic with the actual message
pub fn expect_opened(msg: ControlMessage) -> (Uuid, Option<String>, Option<u16>) {
    match msg {
        ControlMessage::TunnelOpened { tunnel_id, subdomain, port } => {
            (tunnel_id, subdomain, port)
        }
        other => panic!("expected tunnel_opened, got {:?}", other),
    }
}
