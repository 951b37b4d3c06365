// Endpoint registry
// The single canonical owner of live tunnel descriptors, with O(1)
// lookups from every public endpoint kind back to its tunnel. All
// mutations go through one RwLock; hot-path lookups take read leases.

use chrono::{DateTime, Utc};
use fxtunnel_proto::TunnelKind;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-tunnel traffic counters, updated with atomic adds from bridges
#[derive(Debug, Default)]
pub struct TunnelCounters {
    /// Bytes sent to the public peer
    pub bytes_sent: AtomicU64,
    /// Bytes received from the public peer
    pub bytes_received: AtomicU64,
    /// HTTP requests dispatched (HTTP tunnels only)
    pub requests: AtomicU64,
}

impl TunnelCounters {
    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }
}

/// The public endpoint a tunnel is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelBinding {
    Subdomain(String),
    TcpPort(u16),
    UdpPort(u16),
}

impl TunnelBinding {
    pub fn kind(&self) -> TunnelKind {
        match self {
            TunnelBinding::Subdomain(_) => TunnelKind::Http,
            TunnelBinding::TcpPort(_) => TunnelKind::Tcp,
            TunnelBinding::UdpPort(_) => TunnelKind::Udp,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            TunnelBinding::Subdomain(_) => None,
            TunnelBinding::TcpPort(p) | TunnelBinding::UdpPort(p) => Some(*p),
        }
    }

    pub fn subdomain(&self) -> Option<&str> {
        match self {
            TunnelBinding::Subdomain(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for TunnelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelBinding::Subdomain(s) => write!(f, "{}", s),
            TunnelBinding::TcpPort(p) => write!(f, "tcp:{}", p),
            TunnelBinding::UdpPort(p) => write!(f, "udp:{}", p),
        }
    }
}

/// Canonical descriptor of a live tunnel
#[derive(Debug)]
pub struct Tunnel {
    pub id: Uuid,
    pub kind: TunnelKind,
    pub binding: TunnelBinding,
    pub principal_id: Uuid,
    pub session_id: Uuid,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Whether the owner's plan enables the HTTP inspector
    pub inspect: bool,
    pub counters: Arc<TunnelCounters>,
    /// Cancelled when the tunnel closes; bridges and listeners watch it
    pub cancel: CancellationToken,
}

impl Tunnel {
    pub fn new(
        kind: TunnelKind,
        binding: TunnelBinding,
        principal_id: Uuid,
        session_id: Uuid,
        name: Option<String>,
        inspect: bool,
    ) -> Arc<Tunnel> {
        Arc::new(Tunnel {
            id: Uuid::new_v4(),
            kind,
            binding,
            principal_id,
            session_id,
            name,
            created_at: Utc::now(),
            inspect,
            counters: Arc::new(TunnelCounters::default()),
            cancel: CancellationToken::new(),
        })
    }
}

#[derive(Default)]
struct RegistryInner {
    tunnels: HashMap<Uuid, Arc<Tunnel>>,
    by_subdomain: HashMap<String, Uuid>,
    by_tcp_port: HashMap<u16, Uuid>,
    by_udp_port: HashMap<u16, Uuid>,
    /// fqdn -> target subdomain; joined back through `by_subdomain`
    by_custom_domain: HashMap<String, String>,
    by_principal: HashMap<Uuid, HashSet<Uuid>>,
    by_session: HashMap<Uuid, HashSet<Uuid>>,
}

impl RegistryInner {
    fn index_remove(&mut self, tunnel: &Tunnel) {
        match &tunnel.binding {
            TunnelBinding::Subdomain(s) => {
                self.by_subdomain.remove(s);
            }
            TunnelBinding::TcpPort(p) => {
                self.by_tcp_port.remove(p);
            }
            TunnelBinding::UdpPort(p) => {
                self.by_udp_port.remove(p);
            }
        }
        if let Some(set) = self.by_principal.get_mut(&tunnel.principal_id) {
            set.remove(&tunnel.id);
            if set.is_empty() {
                self.by_principal.remove(&tunnel.principal_id);
            }
        }
        if let Some(set) = self.by_session.get_mut(&tunnel.session_id) {
            set.remove(&tunnel.id);
            if set.is_empty() {
                self.by_session.remove(&tunnel.session_id);
            }
        }
    }
}

/// Process-wide endpoint registry
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Insert a tunnel. If the binding is already held, the previous
    /// holder is removed and returned for the caller to close (eviction
    /// policy is decided upstream).
    pub async fn insert(&self, tunnel: Arc<Tunnel>) -> Option<Arc<Tunnel>> {
        let mut inner = self.inner.write().await;

        let evicted_id = match &tunnel.binding {
            TunnelBinding::Subdomain(s) => inner.by_subdomain.insert(s.clone(), tunnel.id),
            TunnelBinding::TcpPort(p) => inner.by_tcp_port.insert(*p, tunnel.id),
            TunnelBinding::UdpPort(p) => inner.by_udp_port.insert(*p, tunnel.id),
        };
        let evicted = evicted_id.and_then(|id| inner.tunnels.remove(&id));
        if let Some(old) = &evicted {
            inner.index_remove(old);
            // index_remove cleared the new binding we just wrote; restore it
            match &tunnel.binding {
                TunnelBinding::Subdomain(s) => {
                    inner.by_subdomain.insert(s.clone(), tunnel.id);
                }
                TunnelBinding::TcpPort(p) => {
                    inner.by_tcp_port.insert(*p, tunnel.id);
                }
                TunnelBinding::UdpPort(p) => {
                    inner.by_udp_port.insert(*p, tunnel.id);
                }
            }
        }

        inner.by_principal.entry(tunnel.principal_id).or_default().insert(tunnel.id);
        inner.by_session.entry(tunnel.session_id).or_default().insert(tunnel.id);
        inner.tunnels.insert(tunnel.id, tunnel);
        evicted
    }

    /// Remove one tunnel by id
    pub async fn remove(&self, id: Uuid) -> Option<Arc<Tunnel>> {
        let mut inner = self.inner.write().await;
        let tunnel = inner.tunnels.remove(&id)?;
        inner.index_remove(&tunnel);
        Some(tunnel)
    }

    /// Remove every tunnel owned by a session; used on session death
    pub async fn remove_session(&self, session_id: Uuid) -> Vec<Arc<Tunnel>> {
        let mut inner = self.inner.write().await;
        let ids: Vec<Uuid> = inner
            .by_session
            .get(&session_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(tunnel) = inner.tunnels.remove(&id) {
                inner.index_remove(&tunnel);
                removed.push(tunnel);
            }
        }
        removed
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Tunnel>> {
        self.inner.read().await.tunnels.get(&id).cloned()
    }

    pub async fn lookup_subdomain(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        let inner = self.inner.read().await;
        let id = inner.by_subdomain.get(subdomain)?;
        inner.tunnels.get(id).cloned()
    }

    pub async fn lookup_tcp_port(&self, port: u16) -> Option<Arc<Tunnel>> {
        let inner = self.inner.read().await;
        let id = inner.by_tcp_port.get(&port)?;
        inner.tunnels.get(id).cloned()
    }

    pub async fn lookup_udp_port(&self, port: u16) -> Option<Arc<Tunnel>> {
        let inner = self.inner.read().await;
        let id = inner.by_udp_port.get(&port)?;
        inner.tunnels.get(id).cloned()
    }

    /// Resolve a custom domain to its target tunnel via the subdomain join
    pub async fn lookup_custom_domain(&self, fqdn: &str) -> Option<Arc<Tunnel>> {
        let inner = self.inner.read().await;
        let subdomain = inner.by_custom_domain.get(fqdn)?;
        let id = inner.by_subdomain.get(subdomain)?;
        inner.tunnels.get(id).cloned()
    }

    pub async fn set_custom_domain(&self, fqdn: String, subdomain: String) {
        self.inner.write().await.by_custom_domain.insert(fqdn, subdomain);
    }

    pub async fn remove_custom_domain(&self, fqdn: &str) {
        self.inner.write().await.by_custom_domain.remove(fqdn);
    }

    pub async fn count_by_principal(&self, principal_id: Uuid) -> usize {
        self.inner
            .read()
            .await
            .by_principal
            .get(&principal_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    pub async fn list_by_principal(&self, principal_id: Uuid) -> Vec<Arc<Tunnel>> {
        let inner = self.inner.read().await;
        let mut list: Vec<Arc<Tunnel>> = inner
            .by_principal
            .get(&principal_id)
            .map(|set| set.iter().filter_map(|id| inner.tunnels.get(id)).cloned().collect())
            .unwrap_or_default();
        list.sort_by_key(|t| t.created_at);
        list
    }

    pub async fn list_by_session(&self, session_id: Uuid) -> Vec<Arc<Tunnel>> {
        let inner = self.inner.read().await;
        inner
            .by_session
            .get(&session_id)
            .map(|set| set.iter().filter_map(|id| inner.tunnels.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn list_all(&self) -> Vec<Arc<Tunnel>> {
        let inner = self.inner.read().await;
        let mut list: Vec<Arc<Tunnel>> = inner.tunnels.values().cloned().collect();
        list.sort_by_key(|t| t.created_at);
        list
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tunnels.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.tunnels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_tunnel(subdomain: &str, principal: Uuid, session: Uuid) -> Arc<Tunnel> {
        Tunnel::new(
            TunnelKind::Http,
            TunnelBinding::Subdomain(subdomain.to_string()),
            principal,
            session,
            None,
            true,
        )
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let registry = Registry::new();
        let principal = Uuid::new_v4();
        let session = Uuid::new_v4();

        let http = http_tunnel("demo", principal, session);
        let tcp = Tunnel::new(
            TunnelKind::Tcp,
            TunnelBinding::TcpPort(10_500),
            principal,
            session,
            None,
            false,
        );
        assert!(registry.insert(http.clone()).await.is_none());
        assert!(registry.insert(tcp.clone()).await.is_none());

        assert_eq!(registry.lookup_subdomain("demo").await.unwrap().id, http.id);
        assert_eq!(registry.lookup_tcp_port(10_500).await.unwrap().id, tcp.id);
        assert!(registry.lookup_subdomain("other").await.is_none());
        assert_eq!(registry.count_by_principal(principal).await, 2);
    }

    #[tokio::test]
    async fn test_insert_same_binding_evicts_previous() {
        let registry = Registry::new();
        let principal = Uuid::new_v4();
        let session = Uuid::new_v4();

        let first = http_tunnel("x", principal, session);
        let second = http_tunnel("x", principal, session);
        registry.insert(first.clone()).await;
        let evicted = registry.insert(second.clone()).await.unwrap();
        assert_eq!(evicted.id, first.id);

        // Routing now points at the second tunnel only
        assert_eq!(registry.lookup_subdomain("x").await.unwrap().id, second.id);
        assert!(registry.get(first.id).await.is_none());
        assert_eq!(registry.count_by_principal(principal).await, 1);
    }

    #[tokio::test]
    async fn test_remove_session_clears_everything() {
        let registry = Registry::new();
        let principal = Uuid::new_v4();
        let session = Uuid::new_v4();

        registry.insert(http_tunnel("a", principal, session)).await;
        registry
            .insert(Tunnel::new(
                TunnelKind::Tcp,
                TunnelBinding::TcpPort(10_001),
                principal,
                session,
                None,
                false,
            ))
            .await;
        registry
            .insert(Tunnel::new(
                TunnelKind::Udp,
                TunnelBinding::UdpPort(20_001),
                principal,
                session,
                None,
                false,
            ))
            .await;

        let removed = registry.remove_session(session).await;
        assert_eq!(removed.len(), 3);
        assert!(registry.is_empty().await);
        assert!(registry.lookup_subdomain("a").await.is_none());
        assert!(registry.lookup_tcp_port(10_001).await.is_none());
        assert!(registry.lookup_udp_port(20_001).await.is_none());
        assert_eq!(registry.count_by_principal(principal).await, 0);
    }

    #[tokio::test]
    async fn test_custom_domain_joins_through_subdomain() {
        let registry = Registry::new();
        let tunnel = http_tunnel("x", Uuid::new_v4(), Uuid::new_v4());
        registry.insert(tunnel.clone()).await;
        registry
            .set_custom_domain("app.external.test".to_string(), "x".to_string())
            .await;

        assert_eq!(
            registry.lookup_custom_domain("app.external.test").await.unwrap().id,
            tunnel.id
        );

        registry.remove_custom_domain("app.external.test").await;
        assert!(registry.lookup_custom_domain("app.external.test").await.is_none());
    }

    #[tokio::test]
    async fn test_exactly_one_endpoint_index_per_tunnel() {
        let registry = Registry::new();
        let tunnel = http_tunnel("only", Uuid::new_v4(), Uuid::new_v4());
        registry.insert(tunnel.clone()).await;

        assert!(registry.lookup_subdomain("only").await.is_some());
        // The same id never appears under a port index
        assert!(registry.lookup_tcp_port(10_000).await.is_none());
        assert!(registry.lookup_udp_port(20_001).await.is_none());

        let removed = registry.remove(tunnel.id).await.unwrap();
        assert_eq!(removed.id, tunnel.id);
        assert!(registry.lookup_subdomain("only").await.is_none());
    }
}
