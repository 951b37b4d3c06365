// Client sessions and the control protocol handler
// One authenticated TLS connection per client, carrying a mux. The
// control handler is serial per session: it reads messages off stream 0
// and replies through a single writer task.

use crate::state::ServerState;
use crate::subdomain;
use crate::registry::{Tunnel, TunnelBinding};
use crate::ports::PortError;
use crate::{tcp, udp};
use chrono::{DateTime, Utc};
use fxtunnel_mux::MuxSession;
use fxtunnel_proto::{codes, read_control, write_control, ControlMessage, PlanLimits, TunnelKind};
use fxtunnel_store::{hash_token, ApiTokenRecord, PlanRecord, Store, UserRecord};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Budget for the auth message to arrive on a fresh connection
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts at generating an unclaimed random subdomain
const RANDOM_LABEL_ATTEMPTS: usize = 32;

/// An authenticated client session
pub struct ClientSession {
    pub id: Uuid,
    pub user: UserRecord,
    pub plan: PlanRecord,
    pub token: ApiTokenRecord,
    pub mux: MuxSession,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    last_heartbeat: Mutex<DateTime<Utc>>,
    /// Server-initiated control messages (closes, evictions) join the
    /// reply stream through here
    pub outbound: mpsc::UnboundedSender<ControlMessage>,
}

impl ClientSession {
    pub fn touch(&self) {
        *self.last_heartbeat.lock().unwrap() = Utc::now();
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self.last_heartbeat.lock().unwrap()
    }

    fn plan_limits(&self) -> PlanLimits {
        PlanLimits {
            max_tunnels: self.plan.max_tunnels,
            max_subdomains: self.plan.max_subdomains,
            max_custom_domains: self.plan.max_custom_domains,
            inspector_enabled: self.plan.inspector_enabled,
        }
    }
}

/// All live sessions by id
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, Arc<ClientSession>>>,
}

impl SessionManager {
    pub fn new() -> SessionManager {
        SessionManager { sessions: RwLock::new(HashMap::new()) }
    }

    pub async fn insert(&self, session: Arc<ClientSession>) {
        self.sessions.write().await.insert(session.id, session);
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<ClientSession>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<ClientSession>> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn list(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        SessionManager::new()
    }
}

/// Drive one inbound control connection from TLS accept to cleanup
pub async fn run_control_connection<I>(state: Arc<ServerState>, io: I, peer: SocketAddr)
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mux = MuxSession::server(io, state.mux_config());
    let control = match mux.take_control_stream() {
        Some(c) => c,
        None => return,
    };
    let (mut control_rd, mut control_wr) = tokio::io::split(control);

    // Auth must arrive first, within its budget
    let auth_msg = tokio::time::timeout(AUTH_TIMEOUT, read_control(&mut control_rd)).await;
    let (token_secret, client_version) = match auth_msg {
        Ok(Ok(Some(ControlMessage::Auth { token, client_version }))) => (token, client_version),
        Ok(Ok(Some(_))) | Ok(Ok(None)) => {
            let _ = write_control(
                &mut control_wr,
                &ControlMessage::AuthErr {
                    code: codes::NOT_AUTHENTICATED.to_string(),
                    message: "auth must be the first message".to_string(),
                },
            )
            .await;
            mux.close("auth required").await;
            return;
        }
        Ok(Err(e)) => {
            debug!(%peer, "control decode failed before auth: {}", e);
            mux.close("protocol error").await;
            return;
        }
        Err(_) => {
            debug!(%peer, "auth timed out");
            mux.close("auth timeout").await;
            return;
        }
    };

    let (user, plan, token) = match authenticate(&state, &token_secret, &client_version, peer).await
    {
        Ok(found) => found,
        Err((code, message)) => {
            warn!(%peer, code, "control auth failed");
            let _ = write_control(&mut control_wr, &ControlMessage::AuthErr { code, message }).await;
            mux.close("auth failed").await;
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ControlMessage>();
    let session = Arc::new(ClientSession {
        id: Uuid::new_v4(),
        user,
        plan,
        token,
        mux: mux.clone(),
        remote_addr: peer,
        connected_at: Utc::now(),
        last_heartbeat: Mutex::new(Utc::now()),
        outbound: out_tx.clone(),
    });
    state.sessions.insert(session.clone()).await;

    info!(
        session_id = %session.id,
        user = %session.user.display_name,
        %peer,
        "client session established"
    );

    let _ = out_tx.send(ControlMessage::AuthOk {
        session_id: session.id,
        server_time: Utc::now(),
        plan_limits: session.plan_limits(),
    });

    // Single writer for all control replies and server-initiated notices
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if write_control(&mut control_wr, &msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        match read_control(&mut control_rd).await {
            Ok(Some(msg)) => {
                if handle_message(&state, &session, msg).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(session_id = %session.id, "control stream ended: {}", e);
                break;
            }
        }
    }

    drop(out_tx);
    cleanup_session(&state, &session).await;
    writer.abort();
}

/// Validate a token secret against the store and load its principal
async fn authenticate(
    state: &ServerState,
    token_secret: &str,
    client_version: &str,
    peer: SocketAddr,
) -> Result<(UserRecord, PlanRecord, ApiTokenRecord), (String, String)> {
    if !client_version.starts_with("1.") {
        return Err((
            codes::UNSUPPORTED_VERSION.to_string(),
            format!("unsupported client version {}", client_version),
        ));
    }

    let token = state
        .store
        .find_token_by_hash(&hash_token(token_secret))
        .await
        .map_err(|e| (codes::INTERNAL.to_string(), e.to_string()))?
        .ok_or_else(|| (codes::BAD_TOKEN.to_string(), "unknown token".to_string()))?;

    if !token.allowed_ips.is_empty() {
        let ip = peer.ip().to_string();
        if !token.allowed_ips.contains(&ip) {
            return Err((
                codes::BAD_TOKEN.to_string(),
                "token not valid from this address".to_string(),
            ));
        }
    }

    let user = state
        .store
        .get_user(token.user_id)
        .await
        .map_err(|e| (codes::INTERNAL.to_string(), e.to_string()))?
        .ok_or_else(|| (codes::BAD_TOKEN.to_string(), "token has no principal".to_string()))?;
    if user.disabled {
        return Err((codes::USER_DISABLED.to_string(), "account disabled".to_string()));
    }

    let plan = state
        .store
        .get_plan(&user.plan_id)
        .await
        .map_err(|e| (codes::INTERNAL.to_string(), e.to_string()))?
        .ok_or_else(|| (codes::INTERNAL.to_string(), "plan missing".to_string()))?;

    Ok((user, plan, token))
}

/// Dispatch one control message; `Err` terminates the session
async fn handle_message(
    state: &Arc<ServerState>,
    session: &Arc<ClientSession>,
    msg: ControlMessage,
) -> Result<(), ()> {
    match msg {
        ControlMessage::OpenTunnel { kind, subdomain, port, name } => {
            let reply = match open_tunnel(state, session, kind, subdomain, port, name).await {
                Ok(tunnel) => {
                    info!(
                        session_id = %session.id,
                        tunnel_id = %tunnel.id,
                        binding = %tunnel.binding,
                        "tunnel opened"
                    );
                    ControlMessage::TunnelOpened {
                        tunnel_id: tunnel.id,
                        subdomain: tunnel.binding.subdomain().map(|s| s.to_string()),
                        port: tunnel.binding.port(),
                    }
                }
                Err((code, message)) => ControlMessage::TunnelErr { code, message },
            };
            let _ = session.outbound.send(reply);
            Ok(())
        }
        ControlMessage::CloseTunnel { tunnel_id } => {
            let owned = match state.registry.get(tunnel_id).await {
                Some(t) => t.session_id == session.id,
                None => false,
            };
            let reply = if owned {
                state.close_tunnel(tunnel_id).await;
                ControlMessage::TunnelClosed { tunnel_id }
            } else {
                ControlMessage::TunnelErr {
                    code: codes::UNKNOWN_TUNNEL.to_string(),
                    message: format!("no tunnel {} in this session", tunnel_id),
                }
            };
            let _ = session.outbound.send(reply);
            Ok(())
        }
        ControlMessage::Heartbeat {} => {
            session.touch();
            let _ = session
                .outbound
                .send(ControlMessage::HeartbeatAck { server_time: Utc::now() });
            Ok(())
        }
        other => {
            // Server-bound streams must not carry server-to-client messages
            warn!(session_id = %session.id, "unexpected control message: {:?}", other);
            Err(())
        }
    }
}

/// Create a tunnel for this session, enforcing quota, bindings and
/// eviction semantics
pub async fn open_tunnel(
    state: &Arc<ServerState>,
    session: &Arc<ClientSession>,
    kind: TunnelKind,
    requested_subdomain: Option<String>,
    requested_port: Option<u16>,
    name: Option<String>,
) -> Result<Arc<Tunnel>, (String, String)> {
    // Quota first: plan-level, then token-level
    let live = state.registry.count_by_principal(session.user.id).await;
    if !PlanRecord::allows(session.plan.max_tunnels, live) {
        return Err((
            codes::QUOTA_EXCEEDED.to_string(),
            format!("plan allows {} concurrent tunnels", session.plan.max_tunnels),
        ));
    }
    if session.token.max_tunnels >= 0 && live as i64 >= session.token.max_tunnels {
        return Err((
            codes::QUOTA_EXCEEDED.to_string(),
            format!("token allows {} concurrent tunnels", session.token.max_tunnels),
        ));
    }

    match kind {
        TunnelKind::Http => {
            let label = resolve_subdomain(state, session, requested_subdomain).await?;
            let tunnel = Tunnel::new(
                TunnelKind::Http,
                TunnelBinding::Subdomain(label),
                session.user.id,
                session.id,
                name,
                session.plan.inspector_enabled,
            );
            if let Some(evicted) = state.registry.insert(tunnel.clone()).await {
                info!(
                    evicted = %evicted.id,
                    replacement = %tunnel.id,
                    binding = %tunnel.binding,
                    "tunnel evicted by re-bind"
                );
                state.release_tunnel(&evicted);
                notify_closed(state, &evicted).await;
            }
            Ok(tunnel)
        }
        TunnelKind::Tcp | TunnelKind::Udp => {
            let allocator = match kind {
                TunnelKind::Tcp => &state.tcp_ports,
                _ => &state.udp_ports,
            };

            let port = match requested_port {
                Some(p) if p != 0 && allocator.range().contains(p) => {
                    match allocator.allocate_exact(p) {
                        Ok(port) => port,
                        Err(PortError::Taken(_)) => {
                            // Same-principal re-request evicts the holder
                            let holder = match kind {
                                TunnelKind::Tcp => state.registry.lookup_tcp_port(p).await,
                                _ => state.registry.lookup_udp_port(p).await,
                            };
                            match holder {
                                Some(old) if old.principal_id == session.user.id => {
                                    state.close_tunnel(old.id).await;
                                    notify_closed(state, &old).await;
                                    allocator.allocate_exact(p).map_err(|e| {
                                        (codes::PORT_TAKEN.to_string(), e.to_string())
                                    })?
                                }
                                _ => {
                                    return Err((
                                        codes::PORT_TAKEN.to_string(),
                                        format!("port {} is already in use", p),
                                    ))
                                }
                            }
                        }
                        Err(e) => return Err((codes::PORT_TAKEN.to_string(), e.to_string())),
                    }
                }
                // 0, absent, or out of range: auto-allocate
                _ => allocator
                    .allocate()
                    .map_err(|e| (codes::PORTS_EXHAUSTED.to_string(), e.to_string()))?,
            };

            let binding = match kind {
                TunnelKind::Tcp => TunnelBinding::TcpPort(port),
                _ => TunnelBinding::UdpPort(port),
            };
            let tunnel = Tunnel::new(kind, binding, session.user.id, session.id, name, false);

            // Bind the public listener before publishing the tunnel
            let bind_result = match kind {
                TunnelKind::Tcp => tcp::spawn_tcp_listener(state.clone(), tunnel.clone()).await,
                _ => udp::spawn_udp_listener(state.clone(), tunnel.clone()).await,
            };
            if let Err(e) = bind_result {
                allocator.release(port);
                return Err((codes::INTERNAL.to_string(), e.to_string()));
            }

            state.registry.insert(tunnel.clone()).await;
            Ok(tunnel)
        }
    }
}

/// Resolve the subdomain for an HTTP open request
async fn resolve_subdomain(
    state: &Arc<ServerState>,
    session: &Arc<ClientSession>,
    requested: Option<String>,
) -> Result<String, (String, String)> {
    match requested.filter(|s| !s.is_empty()) {
        Some(raw) => {
            let label = subdomain::normalize(&raw).ok_or_else(|| {
                (
                    codes::INVALID_SUBDOMAIN.to_string(),
                    format!("'{}' is not a valid subdomain", raw),
                )
            })?;

            if !subdomain::allowed_by(&session.token.allowed_subdomains, &label) {
                return Err((
                    codes::SUBDOMAIN_NOT_ALLOWED.to_string(),
                    format!("token does not permit subdomain '{}'", label),
                ));
            }

            if let Some(reserved) = state
                .store
                .get_reserved_subdomain(&label)
                .await
                .map_err(|e| (codes::INTERNAL.to_string(), e.to_string()))?
            {
                if reserved.user_id != session.user.id {
                    return Err((
                        codes::SUBDOMAIN_TAKEN.to_string(),
                        format!("subdomain '{}' is reserved", label),
                    ));
                }
            }

            if let Some(live) = state.registry.lookup_subdomain(&label).await {
                if live.principal_id != session.user.id {
                    return Err((
                        codes::SUBDOMAIN_TAKEN.to_string(),
                        format!("subdomain '{}' is in use", label),
                    ));
                }
                // Same principal: the registry insert evicts the holder
            }
            Ok(label)
        }
        None => {
            for _ in 0..RANDOM_LABEL_ATTEMPTS {
                let label = subdomain::random_label();
                let reserved = state
                    .store
                    .get_reserved_subdomain(&label)
                    .await
                    .map_err(|e| (codes::INTERNAL.to_string(), e.to_string()))?;
                if reserved.is_some() {
                    continue;
                }
                if state.registry.lookup_subdomain(&label).await.is_some() {
                    continue;
                }
                return Ok(label);
            }
            Err((
                codes::INTERNAL.to_string(),
                "could not generate a free subdomain".to_string(),
            ))
        }
    }
}

/// Tell the owning session that its tunnel is gone (eviction, API close)
pub async fn notify_closed(state: &Arc<ServerState>, tunnel: &Tunnel) {
    if let Some(owner) = state.sessions.get(tunnel.session_id).await {
        let _ = owner
            .outbound
            .send(ControlMessage::TunnelClosed { tunnel_id: tunnel.id });
    }
}

/// Tear down a dead session: every owned tunnel is closed and its
/// endpoint resources returned
pub async fn cleanup_session(state: &Arc<ServerState>, session: &Arc<ClientSession>) {
    state.sessions.remove(session.id).await;
    let removed = state.registry.remove_session(session.id).await;
    for tunnel in &removed {
        state.release_tunnel(tunnel);
    }
    session.mux.close("session ended").await;
    info!(
        session_id = %session.id,
        tunnels_closed = removed.len(),
        "client session closed"
    );
}
