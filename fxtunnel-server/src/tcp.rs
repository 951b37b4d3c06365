// Public TCP endpoints
// A listener exists only while a TCP tunnel is bound to its port; closing
// the tunnel cancels the accept loop and frees the port.

use crate::bridge;
use crate::registry::Tunnel;
use crate::state::ServerState;
use crate::{ServerError, ServerResult};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Bind attempts while an evicted listener's socket drains
const BIND_ATTEMPTS: usize = 3;

pub(crate) async fn bind_with_retry(addr: SocketAddr) -> ServerResult<TcpListener> {
    let mut last_err = None;
    for attempt in 0..BIND_ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < BIND_ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    Err(ServerError::BindError(format!(
        "{}: {}",
        addr,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Bind the public port for a TCP tunnel and start its accept loop
pub async fn spawn_tcp_listener(state: Arc<ServerState>, tunnel: Arc<Tunnel>) -> ServerResult<()> {
    let port = match tunnel.binding.port() {
        Some(port) => port,
        None => {
            return Err(ServerError::InternalError(format!(
                "tunnel {} has no port binding",
                tunnel.id
            )))
        }
    };
    let bind_ip = state
        .config
        .bind_address
        .parse()
        .map_err(|e| ServerError::ConfigError(format!("bind_address: {}", e)))?;
    let listener = bind_with_retry(SocketAddr::new(bind_ip, port)).await?;
    info!(tunnel_id = %tunnel.id, port, "TCP endpoint listening");
    tokio::spawn(accept_loop(state, tunnel, listener, port));
    Ok(())
}

async fn accept_loop(
    state: Arc<ServerState>,
    tunnel: Arc<Tunnel>,
    listener: TcpListener,
    port: u16,
) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = tunnel.cancel.cancelled() => return,
            _ = state.shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(port, "TCP accept failed: {}", e);
                    continue;
                }
            },
        };

        // The tunnel may have closed between accept and dispatch
        match state.registry.lookup_tcp_port(port).await {
            Some(current) if current.id == tunnel.id => {}
            _ => {
                debug!(port, "connection raced tunnel close, dropping");
                return;
            }
        }

        let session = match state.sessions.get(tunnel.session_id).await {
            Some(s) => s,
            None => {
                debug!(port, "owning session is gone, dropping connection");
                return;
            }
        };

        let stream = match session
            .mux
            .open_stream_with_header(Bytes::copy_from_slice(tunnel.id.as_bytes()))
            .await
        {
            Ok(s) => s,
            Err(e) => {
                debug!(port, %peer, "failed to open tunnel stream: {}", e);
                continue;
            }
        };

        debug!(port, %peer, "bridging public TCP connection");
        tokio::spawn(bridge::run(
            socket,
            stream,
            tunnel.counters.clone(),
            tunnel.cancel.clone(),
        ));
    }
}
