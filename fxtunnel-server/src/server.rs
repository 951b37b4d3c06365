// Server assembly
// Binds every listener up front (bind failures are fatal before any work
// is accepted), seeds a fresh store with a bootstrap principal, and runs
// until shutdown, then drains sessions within the configured grace.

use crate::api;
use crate::certs::CertManager;
use crate::edge;
use crate::session;
use crate::state::ServerState;
use crate::{ServerError, ServerResult};
use fxtunnel_config::Config;
use fxtunnel_store::{hash_token, ApiTokenRecord, PlanRecord, Store, UserRecord};
use rand::RngCore;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The assembled tunnel server
pub struct TunnelServer {
    state: Arc<ServerState>,
}

impl TunnelServer {
    /// Validate configuration and build the runtime state
    pub fn new(config: &Config, store: Arc<dyn Store>) -> ServerResult<TunnelServer> {
        config
            .validate_server()
            .map_err(|e| ServerError::ConfigError(e.to_string()))?;
        let certs = CertManager::load(&config.server, store.clone())?;
        let state = ServerState::new(config.server.clone(), store, certs);
        Ok(TunnelServer { state })
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Request a graceful shutdown
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }

    /// Run the server until shutdown is requested, then drain
    pub async fn start(&self) -> ServerResult<()> {
        let state = self.state.clone();

        seed_store(&state).await?;
        state.certs.load_cached_certs().await;
        load_custom_domain_routes(&state).await?;

        let bind_ip: IpAddr = state
            .config
            .bind_address
            .parse()
            .map_err(|e| ServerError::ConfigError(format!("bind_address: {}", e)))?;

        let control_listener = bind(bind_ip, state.config.control_port, "control").await?;
        let https_listener = bind(bind_ip, state.config.https_port, "https").await?;
        let http_listener = bind(bind_ip, state.config.http_port, "http").await?;
        let api_listener = bind(bind_ip, state.config.api.port, "api").await?;

        info!(
            base_domain = %state.config.base_domain,
            control_port = state.config.control_port,
            https_port = state.config.https_port,
            api_port = state.config.api.port,
            "fxtunnel server starting"
        );

        let acceptor = TlsAcceptor::from(state.certs.server_tls_config());
        tokio::spawn(control_accept_loop(state.clone(), control_listener, acceptor));
        tokio::spawn(edge::run_https_edge(state.clone(), https_listener));
        tokio::spawn(edge::run_http_responder(state.clone(), http_listener));
        tokio::spawn(state.certs.clone().run_renewal_loop(state.shutdown.clone()));

        let api_shutdown = state.shutdown.clone();
        let api_app = api::api_router(state.clone());
        tokio::spawn(async move {
            let result = axum::serve(
                api_listener,
                api_app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
            .await;
            if let Err(e) = result {
                warn!("API server ended: {}", e);
            }
        });

        state.shutdown.cancelled().await;
        info!("shutdown requested, draining sessions");
        self.drain().await;
        Ok(())
    }

    /// Announce GOAWAY to every session, wait up to the grace period for
    /// streams to finish, then force-close everything
    async fn drain(&self) {
        let sessions = self.state.sessions.list().await;
        for session in &sessions {
            session.mux.goaway();
        }

        let grace = Duration::from_secs(self.state.config.timeouts.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            // Stream 0 is always open; anything above it is in-flight work
            let active: usize = sessions.iter().map(|s| s.mux.stream_count().saturating_sub(1)).sum();
            if active == 0 || tokio::time::Instant::now() >= deadline {
                if active > 0 {
                    warn!(active, "grace expired with streams still open");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for session in &sessions {
            session::cleanup_session(&self.state, session).await;
        }
        info!("drain complete");
    }
}

async fn bind(ip: IpAddr, port: u16, name: &str) -> ServerResult<TcpListener> {
    TcpListener::bind(SocketAddr::new(ip, port))
        .await
        .map_err(|e| ServerError::BindError(format!("{} listener on port {}: {}", name, port, e)))
}

/// Accept loop for inbound client control connections
async fn control_accept_loop(
    state: Arc<ServerState>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
) {
    info!(port = state.config.control_port, "control channel listening");
    loop {
        let (socket, peer) = tokio::select! {
            _ = state.shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("control accept failed: {}", e);
                    continue;
                }
            },
        };
        let state = state.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor.accept(socket).await {
                Ok(tls) => session::run_control_connection(state, tls, peer).await,
                Err(e) => debug!(%peer, "control TLS handshake failed: {}", e),
            }
        });
    }
}

/// A fresh store gets a default plan, an admin principal, and one API
/// token whose secret is logged exactly once
async fn seed_store(state: &Arc<ServerState>) -> ServerResult<()> {
    if state.store.count_tokens().await? > 0 {
        return Ok(());
    }

    let plan = PlanRecord {
        id: "default".to_string(),
        max_tunnels: 8,
        max_subdomains: 8,
        max_custom_domains: 4,
        inspector_enabled: true,
    };
    state.store.put_plan(plan).await?;

    let admin = UserRecord {
        id: Uuid::new_v4(),
        display_name: "admin".to_string(),
        is_admin: true,
        plan_id: "default".to_string(),
        disabled: false,
        created_at: chrono::Utc::now(),
    };
    state.store.put_user(admin.clone()).await?;

    let mut secret_bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut secret_bytes);
    let secret: String = secret_bytes.iter().map(|b| format!("{:02x}", b)).collect();
    let secret = format!("sk_fxtunnel_{}", secret);

    state
        .store
        .put_token(ApiTokenRecord {
            id: Uuid::new_v4(),
            user_id: admin.id,
            token_hash: hash_token(&secret),
            allowed_subdomains: Vec::new(),
            allowed_ips: Vec::new(),
            max_tunnels: -1,
            created_at: chrono::Utc::now(),
        })
        .await?;

    info!(token = %secret, "bootstrap API token created; it will not be shown again");
    Ok(())
}

/// Warm the registry's custom-domain table from verified records
async fn load_custom_domain_routes(state: &Arc<ServerState>) -> ServerResult<()> {
    let domains = state.store.list_all_custom_domains().await?;
    let mut loaded = 0;
    for record in domains {
        if record.verified {
            state
                .registry
                .set_custom_domain(record.domain.clone(), record.target_subdomain.clone())
                .await;
            loaded += 1;
        }
    }
    if loaded > 0 {
        info!(count = loaded, "custom-domain routes loaded");
    }
    Ok(())
}
