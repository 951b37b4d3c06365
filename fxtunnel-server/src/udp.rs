// Public UDP endpoints
// One reader task per bound port. Datagrams are keyed by the public
// peer address; each distinct peer gets its own mux stream, opened with
// the peer's address in the session header and torn down after the
// configured idle period.

use crate::registry::Tunnel;
use crate::state::ServerState;
use crate::{ServerError, ServerResult};
use bytes::Bytes;
use fxtunnel_proto::udpframe::{read_datagram, write_datagram, write_session_header, MAX_DATAGRAM};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Queued datagrams per peer before drops
const PEER_QUEUE: usize = 64;

/// Bind the public port for a UDP tunnel and start its reader task
pub async fn spawn_udp_listener(state: Arc<ServerState>, tunnel: Arc<Tunnel>) -> ServerResult<()> {
    let port = match tunnel.binding.port() {
        Some(port) => port,
        None => {
            return Err(ServerError::InternalError(format!(
                "tunnel {} has no port binding",
                tunnel.id
            )))
        }
    };
    let bind_ip: std::net::IpAddr = state
        .config
        .bind_address
        .parse()
        .map_err(|e| ServerError::ConfigError(format!("bind_address: {}", e)))?;
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, port))
        .await
        .map_err(|e| ServerError::BindError(format!("udp {}: {}", port, e)))?;
    info!(tunnel_id = %tunnel.id, port, "UDP endpoint listening");
    tokio::spawn(read_loop(state, tunnel, Arc::new(socket), port));
    Ok(())
}

async fn read_loop(
    state: Arc<ServerState>,
    tunnel: Arc<Tunnel>,
    socket: Arc<UdpSocket>,
    port: u16,
) {
    let idle = Duration::from_secs(state.config.timeouts.udp_idle_secs);
    let mut peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let (gone_tx, mut gone_rx) = mpsc::unbounded_channel::<SocketAddr>();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = tunnel.cancel.cancelled() => return,
            _ = state.shutdown.cancelled() => return,
            Some(peer) = gone_rx.recv() => {
                peers.remove(&peer);
            }
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(port, "UDP recv failed: {}", e);
                        continue;
                    }
                };
                let payload = buf[..n].to_vec();

                if let Some(tx) = peers.get(&peer) {
                    // Per-peer backpressure: drop rather than stall the port
                    let _ = tx.try_send(payload);
                    continue;
                }

                let (tx, rx) = mpsc::channel::<Vec<u8>>(PEER_QUEUE);
                if tx.try_send(payload).is_err() {
                    continue;
                }
                peers.insert(peer, tx);
                debug!(port, %peer, "new UDP session");
                tokio::spawn(peer_session(
                    state.clone(),
                    tunnel.clone(),
                    socket.clone(),
                    peer,
                    rx,
                    gone_tx.clone(),
                    idle,
                ));
            }
        }
    }
}

/// Shuttle one public peer's datagrams over a dedicated mux stream
async fn peer_session(
    state: Arc<ServerState>,
    tunnel: Arc<Tunnel>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut rx: mpsc::Receiver<Vec<u8>>,
    gone_tx: mpsc::UnboundedSender<SocketAddr>,
    idle: Duration,
) {
    let result = async {
        let session = state
            .sessions
            .get(tunnel.session_id)
            .await
            .ok_or_else(|| "owning session is gone".to_string())?;
        let stream = session
            .mux
            .open_stream_with_header(Bytes::copy_from_slice(tunnel.id.as_bytes()))
            .await
            .map_err(|e| e.to_string())?;
        Ok::<_, String>(stream)
    }
    .await;

    let stream = match result {
        Ok(s) => s,
        Err(e) => {
            debug!(%peer, "UDP session failed to open: {}", e);
            let _ = gone_tx.send(peer);
            return;
        }
    };

    let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);
    if write_session_header(&mut stream_wr, peer).await.is_err() {
        let _ = gone_tx.send(peer);
        return;
    }

    // Replies from the client flow back to the original remote address
    let reply_counters = tunnel.counters.clone();
    let reply_socket = socket.clone();
    let reply_task = tokio::spawn(async move {
        while let Ok(Some(datagram)) = read_datagram(&mut stream_rd).await {
            reply_counters.add_sent(datagram.len() as u64);
            if reply_socket.send_to(&datagram, peer).await.is_err() {
                break;
            }
        }
    });

    loop {
        let next = tokio::select! {
            _ = tunnel.cancel.cancelled() => None,
            received = tokio::time::timeout(idle, rx.recv()) => match received {
                Err(_) => {
                    debug!(%peer, "UDP session idle, closing");
                    None
                }
                Ok(maybe) => maybe,
            },
        };
        let payload = match next {
            Some(p) => p,
            None => break,
        };
        tunnel.counters.add_received(payload.len() as u64);
        if write_datagram(&mut stream_wr, &payload).await.is_err() {
            break;
        }
    }

    let _ = stream_wr.shutdown().await;
    reply_task.abort();
    let _ = gone_tx.send(peer);
}
