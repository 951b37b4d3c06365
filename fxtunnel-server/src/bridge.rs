// Byte bridge between a public connection and a mux stream
// Two unidirectional copies with half-close propagation. An error in
// either direction tears down both; a clean EOF only half-closes.

use crate::registry::TunnelCounters;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Copy buffer per direction
const COPY_BUF: usize = 64 * 1024;

async fn copy_half<R, W, F>(mut rd: R, mut wr: W, count: F) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut total: u64 = 0;
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            // Propagate half-close and leave the other direction alone
            wr.shutdown().await?;
            return Ok(total);
        }
        wr.write_all(&buf[..n]).await?;
        total += n as u64;
        count(n as u64);
    }
}

/// Bridge `public` and `tunnel` byte-for-byte until both directions
/// finish, either side errors, or the tunnel is cancelled.
pub async fn run<P, T>(
    public: P,
    tunnel: T,
    counters: Arc<TunnelCounters>,
    cancel: CancellationToken,
) where
    P: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (public_rd, public_wr) = tokio::io::split(public);
    let (tunnel_rd, tunnel_wr) = tokio::io::split(tunnel);

    let local = cancel.child_token();

    let inbound = {
        let local = local.clone();
        let counters = counters.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = local.cancelled() => {}
                result = copy_half(public_rd, tunnel_wr, move |n| counters.add_received(n)) => {
                    if let Err(e) = result {
                        debug!("public to tunnel copy ended: {}", e);
                        local.cancel();
                    }
                }
            }
        })
    };

    let outbound = {
        let local = local.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = local.cancelled() => {}
                result = copy_half(tunnel_rd, public_wr, move |n| counters.add_sent(n)) => {
                    if let Err(e) = result {
                        debug!("tunnel to public copy ended: {}", e);
                        local.cancel();
                    }
                }
            }
        })
    };

    let _ = inbound.await;
    let _ = outbound.await;
}
