// Public HTTPS edge
// Accepts TLS with SNI-based certificate selection, then serves
// HTTP/1.1 and HTTP/2 and dispatches each request to the owning tunnel
// through the interceptor. The ClientHello is peeked before the
// handshake so on-demand certificate issuance can run first.
//
// A plain HTTP listener answers ACME HTTP-01 challenges and redirects
// everything else to HTTPS.

use crate::intercept;
use crate::registry::Tunnel;
use crate::state::ServerState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info, warn};

/// Socket peer address attached to each edge request
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// A stream that replays peeked bytes before reading the socket
pub struct PrependStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrependStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        PrependStream { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrependStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrependStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Resolve a public Host to its live tunnel: single-label subdomains of
/// the base domain, then the custom-domain table
pub async fn resolve_public_host(state: &ServerState, host: &str) -> Option<Arc<Tunnel>> {
    let base_suffix = format!(".{}", state.config.base_domain);
    if let Some(label) = host.strip_suffix(&base_suffix) {
        if !label.is_empty() && !label.contains('.') {
            return state.registry.lookup_subdomain(label).await;
        }
        return None;
    }
    state.registry.lookup_custom_domain(host).await
}

fn host_of(req: &Request<Body>) -> Option<String> {
    let raw = req
        .uri()
        .host()
        .map(|h| h.to_string())
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        })?;
    // Strip any port
    let host = match raw.rsplit_once(':') {
        Some((h, maybe_port)) if maybe_port.chars().all(|c| c.is_ascii_digit()) => h.to_string(),
        _ => raw,
    };
    Some(host.to_ascii_lowercase())
}

async fn handle_public_request(
    State(state): State<Arc<ServerState>>,
    req: Request<Body>,
) -> Response {
    let host = match host_of(&req) {
        Some(h) => h,
        None => return (StatusCode::BAD_REQUEST, "missing Host header").into_response(),
    };

    if host == state.config.base_domain {
        // The apex is reserved for the dashboard and API
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }

    let tunnel = match resolve_public_host(&state, &host).await {
        Some(t) => t,
        None => return (StatusCode::BAD_GATEWAY, "tunnel not found").into_response(),
    };

    let peer_ip = req
        .extensions()
        .get::<ClientAddr>()
        .map(|a| a.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    intercept::dispatch(state, tunnel, req, host, peer_ip, None, None).await
}

fn edge_router(state: Arc<ServerState>) -> Router {
    Router::new().fallback(handle_public_request).with_state(state)
}

/// Accept loop for the public HTTPS port
pub async fn run_https_edge(state: Arc<ServerState>, listener: TcpListener) {
    let acceptor = TlsAcceptor::from(state.certs.server_tls_config());
    let router = edge_router(state.clone());
    info!(port = state.config.https_port, "HTTPS edge listening");

    loop {
        let (socket, peer) = tokio::select! {
            _ = state.shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("edge accept failed: {}", e);
                    continue;
                }
            },
        };
        let state = state.clone();
        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_tls_connection(state, acceptor, router, socket, peer).await {
                debug!(%peer, "edge connection ended: {}", e);
            }
        });
    }
}

async fn serve_tls_connection(
    state: Arc<ServerState>,
    acceptor: TlsAcceptor,
    router: Router,
    mut socket: TcpStream,
    peer: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Peek the ClientHello so issuance can happen before the handshake
    // needs a certificate
    let mut first = vec![0u8; 16 * 1024];
    let n = socket.read(&mut first).await?;
    if n == 0 {
        return Ok(());
    }
    first.truncate(n);

    if let Some(sni) = extract_sni(&first) {
        state.certs.prepare_sni(&sni).await;
    }

    let tls = acceptor.accept(PrependStream::new(Bytes::from(first), socket)).await?;

    let service = hyper::service::service_fn(move |mut req: Request<hyper::body::Incoming>| {
        req.extensions_mut().insert(ClientAddr(peer));
        let router = router.clone();
        async move {
            let response = match router.oneshot(req.map(Body::new)).await {
                Ok(response) => response,
                Err(infallible) => match infallible {},
            };
            Ok::<_, std::convert::Infallible>(response)
        }
    });

    auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(tls), service)
        .await?;
    Ok(())
}

async fn serve_acme_challenge(
    State(state): State<Arc<ServerState>>,
    Path(token): Path<String>,
) -> Response {
    match state.certs.challenge_response(&token) {
        Some(key_auth) => (StatusCode::OK, key_auth).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown challenge").into_response(),
    }
}

async fn redirect_to_https(
    State(state): State<Arc<ServerState>>,
    req: Request<Body>,
) -> Response {
    let host = match host_of(&req) {
        Some(h) => h,
        None => return (StatusCode::BAD_REQUEST, "missing Host header").into_response(),
    };
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let target = if state.config.https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, state.config.https_port, path)
    };
    match target.parse::<Uri>() {
        Ok(_) => Redirect::permanent(&target).into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, "bad redirect target").into_response(),
    }
}

/// Router for the plain HTTP port: ACME challenges plus HTTPS redirects
pub fn http_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/:token", get(serve_acme_challenge))
        .fallback(redirect_to_https)
        .with_state(state)
}

/// Serve the plain HTTP listener until shutdown
pub async fn run_http_responder(state: Arc<ServerState>, listener: TcpListener) {
    info!(port = state.config.http_port, "HTTP responder listening");
    let shutdown = state.shutdown.clone();
    let app = http_router(state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        warn!("HTTP responder ended: {}", e);
    }
}

/// Bounds-checked cursor over a byte slice; every TLS structure is a
/// nested reader built from a length-prefixed field of its parent
struct TlsReader<'a> {
    rest: &'a [u8],
}

impl<'a> TlsReader<'a> {
    fn new(rest: &'a [u8]) -> TlsReader<'a> {
        TlsReader { rest }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.rest.len() < n {
            return None;
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    /// A field prefixed by a u8 length
    fn sized8(&mut self) -> Option<&'a [u8]> {
        let n = self.u8()?;
        self.take(n as usize)
    }

    /// A field prefixed by a u16 length
    fn sized16(&mut self) -> Option<&'a [u8]> {
        let n = self.u16()?;
        self.take(n as usize)
    }
}

const TLS_RECORD_HANDSHAKE: u8 = 22;
const TLS_HANDSHAKE_CLIENT_HELLO: u8 = 1;
const TLS_EXT_SERVER_NAME: u16 = 0;
const SNI_NAME_TYPE_HOSTNAME: u8 = 0;

/// Extract the SNI hostname from the first bytes of a TLS connection
pub fn extract_sni(data: &[u8]) -> Option<String> {
    // Record layer: type, legacy version, u16 fragment
    let mut record = TlsReader::new(data);
    if record.u8()? != TLS_RECORD_HANDSHAKE {
        return None;
    }
    record.take(2)?;
    let mut handshake = TlsReader::new(record.sized16()?);

    // Handshake message: type, u24 body
    if handshake.u8()? != TLS_HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let body_len = handshake.u24()?;
    let mut hello = TlsReader::new(handshake.take(body_len)?);

    // ClientHello fields up to the extension block
    hello.take(2)?; // client version
    hello.take(32)?; // random
    hello.sized8()?; // legacy session id
    hello.sized16()?; // cipher suites
    hello.sized8()?; // compression methods

    let mut extensions = TlsReader::new(hello.sized16()?);
    loop {
        let ext_type = extensions.u16()?;
        let ext_body = extensions.sized16()?;
        if ext_type != TLS_EXT_SERVER_NAME {
            continue;
        }
        // server_name: a list of (type, name) entries
        let mut names = TlsReader::new(TlsReader::new(ext_body).sized16()?);
        while let Some(name_type) = names.u8() {
            let name = names.sized16()?;
            if name_type == SNI_NAME_TYPE_HOSTNAME {
                return String::from_utf8(name.to_vec()).ok();
            }
        }
        return None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_prepend_stream_replays_prefix_first() {
        let (mut a, b) = tokio::io::duplex(1024);
        a.write_all(b" world").await.unwrap();
        a.shutdown().await.unwrap();

        let mut stream = PrependStream::new(Bytes::from_static(b"hello"), b);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn test_extract_sni_from_synthetic_hello() {
        // Build a minimal ClientHello with an SNI extension
        let hostname = b"demo.example.test";
        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&((hostname.len() + 3) as u16).to_be_bytes()); // list len
        sni_ext.push(0); // hostname type
        sni_ext.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(hostname);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&0u16.to_be_bytes()); // extension type 0 = server_name
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);

        let mut hello_body = Vec::new();
        hello_body.extend_from_slice(&[0x03, 0x03]); // client version
        hello_body.extend_from_slice(&[0u8; 32]); // random
        hello_body.push(0); // session id length
        hello_body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites len
        hello_body.extend_from_slice(&[0x13, 0x01]);
        hello_body.push(1); // compression methods len
        hello_body.push(0); // null compression
        hello_body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello_body.extend_from_slice(&extensions);

        let mut record = Vec::new();
        record.push(0x16); // handshake record
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&((hello_body.len() + 4) as u16).to_be_bytes());
        record.push(0x01); // ClientHello
        record.push(0);
        record.extend_from_slice(&(hello_body.len() as u16).to_be_bytes()[..]);
        record.extend_from_slice(&hello_body);

        assert_eq!(extract_sni(&record), Some("demo.example.test".to_string()));
    }

    #[test]
    fn test_extract_sni_rejects_non_tls() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"), None);
        assert_eq!(extract_sni(&[0x16, 0x03]), None);
    }
}
