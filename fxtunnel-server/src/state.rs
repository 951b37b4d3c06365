// Shared server state
// One typed value owned by the tunnel runtime and passed explicitly to
// every listener and handler; nothing lives in module-level statics.

use crate::certs::CertManager;
use crate::inspect::InspectHub;
use crate::ports::PortAllocator;
use crate::registry::{Registry, Tunnel, TunnelBinding};
use crate::session::SessionManager;
use fxtunnel_config::ServerConfig;
use fxtunnel_mux::MuxConfig;
use fxtunnel_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub struct ServerState {
    pub config: ServerConfig,
    pub store: Arc<dyn Store>,
    pub registry: Registry,
    pub sessions: SessionManager,
    pub tcp_ports: PortAllocator,
    pub udp_ports: PortAllocator,
    pub inspect: InspectHub,
    pub certs: Arc<CertManager>,
    /// Cancelled once at process shutdown
    pub shutdown: CancellationToken,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn Store>,
        certs: Arc<CertManager>,
    ) -> Arc<ServerState> {
        Arc::new(ServerState {
            tcp_ports: PortAllocator::new(config.tcp_range),
            udp_ports: PortAllocator::new(config.udp_range),
            inspect: InspectHub::new(config.inspect.ring_capacity, store.clone()),
            registry: Registry::new(),
            sessions: SessionManager::new(),
            config,
            store,
            certs,
            shutdown: CancellationToken::new(),
        })
    }

    /// Mux tuning derived from config
    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            window: self.config.mux.window_bytes,
            keepalive_interval: Duration::from_secs(self.config.mux.keepalive_secs),
            max_streams: self.config.mux.max_streams,
            ..MuxConfig::default()
        }
    }

    /// Close a tunnel by id: remove from the registry and release its
    /// resources. Returns the descriptor if it was live.
    pub async fn close_tunnel(&self, id: Uuid) -> Option<Arc<Tunnel>> {
        let tunnel = self.registry.remove(id).await?;
        self.release_tunnel(&tunnel);
        info!(tunnel_id = %id, binding = %tunnel.binding, "tunnel closed");
        Some(tunnel)
    }

    /// Release the resources of an already-deregistered tunnel
    pub fn release_tunnel(&self, tunnel: &Tunnel) {
        tunnel.cancel.cancel();
        match tunnel.binding {
            TunnelBinding::TcpPort(port) => self.tcp_ports.release(port),
            TunnelBinding::UdpPort(port) => self.udp_ports.release(port),
            TunnelBinding::Subdomain(_) => {}
        }
        self.inspect.remove_tunnel(tunnel.id);
    }
}
