// HTTP request interceptor
// The HTTPS edge never hands raw bytes to the mux for HTTP tunnels; each
// request is re-framed onto a fresh mux stream so the server can rewrite
// headers, watch both directions, and capture bounded copies for the
// inspector. Capture buffers truncate rather than stall: the public
// client always sees the full response.

use crate::state::ServerState;
use crate::registry::Tunnel;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use fxtunnel_proto::httpframe::{
    read_response_head, write_request_head, BodyLen, FramedRequestHead,
};
use fxtunnel_store::CapturedExchange;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Bytes of captured request body fed into the request fingerprint
const FINGERPRINT_BODY_PREFIX: usize = 4096;

/// Chunks buffered between the mux stream and the public response body
const RESPONSE_PIPE_DEPTH: usize = 8;

/// Bounded capture of one direction's bytes
pub struct CaptureBuf {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CaptureBuf {
    pub fn new(cap: usize) -> CaptureBuf {
        CaptureBuf { buf: Vec::new(), cap, truncated: false }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.buf.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }
    }

    pub fn into_parts(self) -> (Vec<u8>, bool) {
        (self.buf, self.truncated)
    }
}

fn bad_gateway(message: &'static str) -> Response {
    (StatusCode::BAD_GATEWAY, message).into_response()
}

/// Hop-by-hop headers that never cross the proxy
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    ) || name.starts_with("proxy-")
}

/// Flatten and rewrite request headers for the framed form
fn prepare_request_headers(
    headers: &HeaderMap,
    host: &str,
    peer_ip: IpAddr,
) -> Vec<(String, String)> {
    // Names enumerated in Connection are hop-by-hop too
    let connection_listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(',').map(|s| s.trim().to_ascii_lowercase()))
        .collect();

    let mut out: Vec<(String, String)> = Vec::with_capacity(headers.len() + 3);
    let mut forwarded_for: Option<String> = None;

    for (name, value) in headers {
        let lname = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&lname) || connection_listed.contains(&lname) {
            continue;
        }
        let value = match value.to_str() {
            Ok(v) => v.to_string(),
            Err(_) => continue,
        };
        if lname == "x-forwarded-for" {
            forwarded_for = Some(value);
            continue;
        }
        if lname == "x-forwarded-proto" || lname == "x-forwarded-host" {
            continue;
        }
        out.push((lname, value));
    }

    let xff = match forwarded_for {
        Some(prior) => format!("{}, {}", prior, peer_ip),
        None => peer_ip.to_string(),
    };
    out.push(("x-forwarded-for".to_string(), xff));
    out.push(("x-forwarded-proto".to_string(), "https".to_string()));
    out.push(("x-forwarded-host".to_string(), host.to_string()));
    out
}

/// Identity fingerprint of a request; logged for correlation only
fn fingerprint(method: &str, path: &str, headers: &[(String, String)], body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    let mut identity: Vec<&(String, String)> = headers
        .iter()
        .filter(|(n, _)| matches!(n.as_str(), "host" | "authorization" | "cookie" | "user-agent"))
        .collect();
    identity.sort();
    for (name, value) in identity {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(&body[..body.len().min(FINGERPRINT_BODY_PREFIX)]);
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

/// Proxy one request onto `tunnel`'s client and stream the answer back.
///
/// `replay_ref` marks exchanges produced by the replay engine;
/// `capture_notify` receives the completed capture record, when the
/// owner's plan has inspection enabled.
pub async fn dispatch(
    state: Arc<ServerState>,
    tunnel: Arc<Tunnel>,
    req: Request<Body>,
    host: String,
    peer_ip: IpAddr,
    replay_ref: Option<Uuid>,
    capture_notify: Option<oneshot::Sender<Arc<CapturedExchange>>>,
) -> Response {
    tunnel.counters.add_request();
    let started = Instant::now();
    let started_at = Utc::now();

    let session = match state.sessions.get(tunnel.session_id).await {
        Some(s) => s,
        None => return bad_gateway("tunnel error"),
    };
    let stream = match session
        .mux
        .open_stream_with_header(Bytes::copy_from_slice(tunnel.id.as_bytes()))
        .await
    {
        Ok(s) => s,
        Err(e) => {
            warn!(tunnel_id = %tunnel.id, "failed to open tunnel stream: {}", e);
            return bad_gateway("tunnel error");
        }
    };

    let method = req.method().as_str().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let body_len = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|n| {
            if n <= u32::MAX as u64 {
                BodyLen::Known(n as u32)
            } else {
                BodyLen::Streamed
            }
        })
        .unwrap_or(BodyLen::Streamed);

    let head = FramedRequestHead {
        method: method.clone(),
        path: path.clone(),
        headers: prepare_request_headers(req.headers(), &host, peer_ip),
        body_len,
    };

    let (mut tunnel_rd, mut tunnel_wr) = tokio::io::split(stream);
    if let Err(e) = write_request_head(&mut tunnel_wr, &head).await {
        warn!(tunnel_id = %tunnel.id, "failed to frame request: {}", e);
        return bad_gateway("tunnel error");
    }

    let inspect = tunnel.inspect;
    let req_cap_limit = state.config.inspect.max_request_body;
    let resp_cap_limit = state.config.inspect.max_response_body;
    let counters = tunnel.counters.clone();

    // Pump the request body toward the client, capturing a bounded copy
    let request_pump = {
        let counters = counters.clone();
        let mut body_stream = req.into_body().into_data_stream();
        tokio::spawn(async move {
            let mut capture = CaptureBuf::new(if inspect { req_cap_limit } else { 0 });
            let mut failed = false;
            while let Some(chunk) = body_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(_) => {
                        failed = true;
                        break;
                    }
                };
                if inspect {
                    capture.extend(&chunk);
                }
                counters.add_received(chunk.len() as u64);
                if tunnel_wr.write_all(&chunk).await.is_err() {
                    failed = true;
                    break;
                }
            }
            let _ = tunnel_wr.shutdown().await;
            (capture, failed)
        })
    };

    let read_timeout = Duration::from_secs(state.config.timeouts.http_read_secs);

    // The response head decides what the public client sees
    let resp_head = match tokio::time::timeout(read_timeout, read_response_head(&mut tunnel_rd))
        .await
    {
        Ok(Ok(h)) => h,
        Ok(Err(e)) => {
            debug!(tunnel_id = %tunnel.id, "response framing failed: {}", e);
            finalize_failed_exchange(
                &state, &tunnel, request_pump, host, started, started_at, method, path,
                replay_ref, capture_notify,
            )
            .await;
            return bad_gateway("tunnel error");
        }
        Err(_) => {
            debug!(tunnel_id = %tunnel.id, "response head timed out");
            finalize_failed_exchange(
                &state, &tunnel, request_pump, host, started, started_at, method, path,
                replay_ref, capture_notify,
            )
            .await;
            return bad_gateway("tunnel error");
        }
    };

    let status = StatusCode::from_u16(resp_head.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &resp_head.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if let Ok(v) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), v);
        }
    }

    // Stream the response body through a bounded pipe while the capture
    // task finishes the exchange record behind it
    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(RESPONSE_PIPE_DEPTH);
    let resp_headers = resp_head.headers.clone();
    let resp_body_len = resp_head.body_len;
    let resp_status = resp_head.status;
    let state_for_task = state.clone();
    let tunnel_for_task = tunnel.clone();

    tokio::spawn(async move {
        let mut capture = CaptureBuf::new(if inspect { resp_cap_limit } else { 0 });
        let mut remaining = match resp_body_len {
            BodyLen::Known(n) => Some(n as u64),
            BodyLen::Streamed => None,
        };
        let mut buf = vec![0u8; 16 * 1024];
        let mut failed = false;

        loop {
            if remaining == Some(0) {
                break;
            }
            let want = match remaining {
                Some(r) => (r as usize).min(buf.len()),
                None => buf.len(),
            };
            let read = tokio::time::timeout(read_timeout, tunnel_rd.read(&mut buf[..want])).await;
            let n = match read {
                Ok(Ok(0)) => {
                    if remaining.is_some() {
                        // Stream ended before the declared length
                        failed = true;
                    }
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(_)) | Err(_) => {
                    failed = true;
                    break;
                }
            };
            if let Some(r) = remaining.as_mut() {
                *r -= n as u64;
            }
            if inspect {
                capture.extend(&buf[..n]);
            }
            counters.add_sent(n as u64);
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            if body_tx.send(Ok(chunk)).await.is_err() {
                // Public client went away mid-response
                failed = true;
                break;
            }
        }
        if failed {
            let _ = body_tx
                .send(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "tunnel stream ended early",
                )))
                .await;
        }
        drop(body_tx);

        // Join the request pump to finish the capture record
        let (req_capture, req_failed) =
            match tokio::time::timeout(Duration::from_secs(5), request_pump).await {
                Ok(Ok(parts)) => parts,
                _ => (CaptureBuf::new(0), true),
            };

        if inspect {
            let (req_body, mut req_truncated) = req_capture.into_parts();
            let (resp_body, resp_truncated) = capture.into_parts();
            if req_failed {
                req_truncated = true;
            }
            let print = fingerprint(&method, &path, &head.headers, &req_body);
            let exchange = CapturedExchange {
                id: Uuid::new_v4(),
                tunnel_id: tunnel_for_task.id,
                host,
                timestamp: started_at,
                duration_ns: started.elapsed().as_nanos() as u64,
                method,
                path,
                status: resp_status,
                req_headers: head.headers.clone(),
                resp_headers,
                req_body: encode_b64(&req_body),
                resp_body: encode_b64(&resp_body),
                req_truncated,
                resp_truncated,
                error: failed,
                replay_ref,
            };
            debug!(
                tunnel_id = %tunnel_for_task.id,
                fingerprint = %print,
                status = resp_status,
                "exchange captured"
            );
            let stored = state_for_task.inspect.push(exchange);
            if let Some(notify) = capture_notify {
                let _ = notify.send(stored);
            }
        }
    });

    let body = Body::from_stream(futures_util::stream::unfold(body_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));

    builder
        .body(body)
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "response build failed").into_response())
}

fn encode_b64(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Record an exchange for a request whose response never materialized
#[allow(clippy::too_many_arguments)]
async fn finalize_failed_exchange(
    state: &Arc<ServerState>,
    tunnel: &Arc<Tunnel>,
    request_pump: tokio::task::JoinHandle<(CaptureBuf, bool)>,
    host: String,
    started: Instant,
    started_at: chrono::DateTime<Utc>,
    method: String,
    path: String,
    replay_ref: Option<Uuid>,
    capture_notify: Option<oneshot::Sender<Arc<CapturedExchange>>>,
) {
    request_pump.abort();
    if !tunnel.inspect {
        return;
    }
    let exchange = CapturedExchange {
        id: Uuid::new_v4(),
        tunnel_id: tunnel.id,
        host,
        timestamp: started_at,
        duration_ns: started.elapsed().as_nanos() as u64,
        method,
        path,
        status: 502,
        req_headers: Vec::new(),
        resp_headers: Vec::new(),
        req_body: String::new(),
        resp_body: String::new(),
        req_truncated: true,
        resp_truncated: true,
        error: true,
        replay_ref,
    };
    let stored = state.inspect.push(exchange);
    if let Some(notify) = capture_notify {
        let _ = notify.send(stored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_buf_truncates_at_cap() {
        let mut cap = CaptureBuf::new(8);
        cap.extend(b"hello");
        cap.extend(b" world");
        let (bytes, truncated) = cap.into_parts();
        assert_eq!(&bytes, b"hello wo");
        assert!(truncated);
    }

    #[test]
    fn test_capture_buf_exact_fit_not_truncated() {
        let mut cap = CaptureBuf::new(5);
        cap.extend(b"hello");
        let (bytes, truncated) = cap.into_parts();
        assert_eq!(&bytes, b"hello");
        assert!(!truncated);
    }

    #[test]
    fn test_hop_by_hop_and_forwarding_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("demo.example.test"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("x-drop-me"));
        headers.insert("x-drop-me", HeaderValue::from_static("1"));
        headers.insert("proxy-authorization", HeaderValue::from_static("secret"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.7"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let out = prepare_request_headers(&headers, "demo.example.test", "203.0.113.9".parse().unwrap());
        let get = |name: &str| {
            out.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone())
        };

        assert_eq!(get("host").as_deref(), Some("demo.example.test"));
        assert!(get("x-drop-me").is_none());
        assert!(get("proxy-authorization").is_none());
        assert!(get("transfer-encoding").is_none());
        assert_eq!(get("accept").as_deref(), Some("*/*"));
        assert_eq!(get("x-forwarded-for").as_deref(), Some("198.51.100.7, 203.0.113.9"));
        assert_eq!(get("x-forwarded-proto").as_deref(), Some("https"));
        assert_eq!(get("x-forwarded-host").as_deref(), Some("demo.example.test"));
    }

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let headers = vec![("host".to_string(), "a.example.test".to_string())];
        let a = fingerprint("GET", "/x", &headers, b"body");
        let b = fingerprint("GET", "/x", &headers, b"body");
        let c = fingerprint("GET", "/y", &headers, b"body");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
