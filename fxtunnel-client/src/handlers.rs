// Per-stream handlers
// Every server-opened stream names its tunnel in the SYN header. HTTP
// streams are decoded and forwarded to the local service through a hyper
// client; TCP streams are bridged byte-for-byte; UDP streams shuttle
// length-prefixed datagrams.

use crate::{ClientError, ClientResult};
use bytes::Bytes;
use futures_util::stream;
use fxtunnel_config::TunnelSpec;
use fxtunnel_mux::MuxStream;
use fxtunnel_proto::httpframe::{
    read_request_head, write_response_head, BodyLen, FramedResponseHead,
};
use fxtunnel_proto::udpframe::{read_datagram, read_session_header, write_datagram};
use fxtunnel_proto::TunnelKind;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Idle budget for local UDP replies
const UDP_REPLY_IDLE: Duration = Duration::from_secs(60);

pub type HttpClient = Client<HttpConnector, BoxBody<Bytes, std::io::Error>>;

pub fn build_http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Entry point for one accepted stream
pub async fn handle_stream(
    stream: MuxStream,
    specs: Arc<RwLock<HashMap<Uuid, TunnelSpec>>>,
    http_client: HttpClient,
) {
    let tunnel_id = match Uuid::from_slice(stream.header()) {
        Ok(id) => id,
        Err(_) => {
            warn!("stream opened without a tunnel id header");
            return;
        }
    };
    let spec = match specs.read().await.get(&tunnel_id).cloned() {
        Some(s) => s,
        None => {
            warn!(%tunnel_id, "stream for unknown tunnel");
            return;
        }
    };

    let result = match spec.kind {
        TunnelKind::Http => handle_http(stream, &spec, http_client).await,
        TunnelKind::Tcp => handle_tcp(stream, &spec).await,
        TunnelKind::Udp => handle_udp(stream, &spec).await,
    };
    if let Err(e) = result {
        debug!(%tunnel_id, tunnel = %spec.display_name(), "stream ended: {}", e);
    }
}

/// Decode a framed request, forward it to the local HTTP service, and
/// frame the response back
pub async fn handle_http<S>(stream: S, spec: &TunnelSpec, client: HttpClient) -> ClientResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let head = read_request_head(&mut rd).await?;

    let uri = format!("http://{}:{}{}", spec.local_host, spec.local_port, head.path);
    let mut builder = hyper::Request::builder().method(head.method.as_str()).uri(uri.as_str());
    for (name, value) in &head.headers {
        // The body is re-streamed; hyper frames it itself
        if matches!(name.as_str(), "content-length" | "transfer-encoding" | "connection") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    // Request body: exactly the declared length, or bytes until FIN
    let initial_remaining = match head.body_len {
        BodyLen::Known(n) => Some(n as u64),
        BodyLen::Streamed => None,
    };
    let body_stream = stream::unfold((rd, initial_remaining), |(mut rd, mut remaining)| async move {
        if remaining == Some(0) {
            return None;
        }
        let mut buf = vec![0u8; 16 * 1024];
        let want = match remaining {
            Some(r) => (r as usize).min(buf.len()),
            None => buf.len(),
        };
        match rd.read(&mut buf[..want]).await {
            Ok(0) => None,
            Ok(n) => {
                if let Some(r) = remaining.as_mut() {
                    *r -= n as u64;
                }
                buf.truncate(n);
                Some((Ok(Frame::data(Bytes::from(buf))), (rd, remaining)))
            }
            Err(e) => Some((Err(e), (rd, remaining))),
        }
    });
    let body = BodyExt::boxed(StreamBody::new(body_stream));

    let request = builder
        .body(body)
        .map_err(|e| ClientError::InternalError(e.to_string()))?;

    let response = match client.request(request).await {
        Ok(r) => r,
        Err(e) => {
            // Local service unreachable: answer 502 through the tunnel
            debug!(local = %format!("{}:{}", spec.local_host, spec.local_port), "local dial failed: {}", e);
            let body = b"local service unavailable";
            write_response_head(
                &mut wr,
                &FramedResponseHead {
                    status: 502,
                    headers: vec![("content-length".to_string(), body.len().to_string())],
                    body_len: BodyLen::Known(body.len() as u32),
                },
            )
            .await?;
            wr.write_all(body).await?;
            wr.shutdown().await?;
            return Ok(());
        }
    };

    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    // HEAD and bodyless statuses may still carry a Content-Length
    let body_len = if head.method == "HEAD" || status == 204 || status == 304 {
        BodyLen::Known(0)
    } else {
        response
            .headers()
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|n| {
                if n <= u32::MAX as u64 {
                    BodyLen::Known(n as u32)
                } else {
                    BodyLen::Streamed
                }
            })
            .unwrap_or(BodyLen::Streamed)
    };

    write_response_head(&mut wr, &FramedResponseHead { status, headers, body_len }).await?;

    let mut body = response.into_body();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ClientError::NetworkError(e.to_string()))?;
        if let Some(data) = frame.data_ref() {
            wr.write_all(data).await?;
        }
    }
    wr.shutdown().await?;
    Ok(())
}

/// Bridge the stream byte-for-byte with a local TCP dial
pub async fn handle_tcp<S>(mut stream: S, spec: &TunnelSpec) -> ClientResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut local = TcpStream::connect((spec.local_host.as_str(), spec.local_port))
        .await
        .map_err(|e| {
            ClientError::ConnectionFailed(format!(
                "{}:{}: {}",
                spec.local_host, spec.local_port, e
            ))
        })?;
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut local).await;
    Ok(())
}

/// Shuttle datagrams between the stream and a local UDP socket
pub async fn handle_udp<S>(stream: S, spec: &TunnelSpec) -> ClientResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let peer = read_session_header(&mut rd).await?;
    debug!(%peer, "udp session opened");

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect((spec.local_host.as_str(), spec.local_port))
        .await
        .map_err(|e| {
            ClientError::ConnectionFailed(format!(
                "{}:{}: {}",
                spec.local_host, spec.local_port, e
            ))
        })?;
    let socket = Arc::new(socket);

    // Local replies flow back over the stream until idle
    let reply_socket = socket.clone();
    let reply_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        loop {
            let received =
                match tokio::time::timeout(UDP_REPLY_IDLE, reply_socket.recv(&mut buf)).await {
                    Err(_) => break,
                    Ok(Err(_)) => break,
                    Ok(Ok(n)) => n,
                };
            if write_datagram(&mut wr, &buf[..received]).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    while let Some(datagram) = read_datagram(&mut rd).await? {
        if socket.send(&datagram).await.is_err() {
            break;
        }
    }

    reply_task.abort();
    Ok(())
}
