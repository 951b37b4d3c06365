// Replay engine
// Reconstructs a captured request, applies optional overrides, and
// re-injects it through the interceptor as if it had arrived from the
// public edge. The resulting exchange carries `replay_ref`.

use crate::edge;
use crate::intercept;
use crate::state::ServerState;
use axum::body::Body;
use axum::http::{Method, Request};
use fxtunnel_store::CapturedExchange;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Budget for the replayed exchange to complete
const REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Overrides applied to the reconstructed request
#[derive(Debug, Default, Clone)]
pub struct ReplayOverrides {
    pub method: Option<String>,
    pub path: Option<String>,
    pub headers: Option<Vec<(String, String)>>,
    pub body: Option<Vec<u8>>,
}

/// Replay failures
#[derive(Debug)]
pub enum ReplayError {
    /// The exchange's host no longer resolves to a live tunnel
    TunnelGone,
    /// The owner's plan has the inspector disabled
    InspectorDisabled,
    /// The reconstructed request was malformed
    BadRequest(String),
    /// The replayed exchange never completed
    Failed(String),
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayError::TunnelGone => write!(f, "tunnel is gone"),
            ReplayError::InspectorDisabled => write!(f, "inspector disabled for this plan"),
            ReplayError::BadRequest(msg) => write!(f, "bad replay request: {}", msg),
            ReplayError::Failed(msg) => write!(f, "replay failed: {}", msg),
        }
    }
}

/// Headers the interceptor owns; they are re-derived on dispatch
fn is_synthetic_header(name: &str) -> bool {
    name.starts_with("x-forwarded-") || name.starts_with(':')
}

/// Re-inject `original` (with `overrides`) at its recorded host
pub async fn replay_exchange(
    state: Arc<ServerState>,
    original: &CapturedExchange,
    overrides: ReplayOverrides,
) -> Result<Arc<CapturedExchange>, ReplayError> {
    let tunnel = edge::resolve_public_host(&state, &original.host)
        .await
        .ok_or(ReplayError::TunnelGone)?;
    if !tunnel.inspect {
        return Err(ReplayError::InspectorDisabled);
    }

    let method_str = overrides.method.unwrap_or_else(|| original.method.clone());
    let method = Method::from_bytes(method_str.as_bytes())
        .map_err(|e| ReplayError::BadRequest(e.to_string()))?;
    let path = overrides.path.unwrap_or_else(|| original.path.clone());
    let headers = overrides
        .headers
        .unwrap_or_else(|| original.req_headers.clone());
    let body = overrides.body.unwrap_or_else(|| original.req_body_bytes());

    let mut builder = Request::builder().method(method).uri(path.as_str());
    let mut saw_host = false;
    for (name, value) in &headers {
        let lname = name.to_ascii_lowercase();
        if is_synthetic_header(&lname) {
            continue;
        }
        if lname == "content-length" {
            continue;
        }
        if lname == "host" {
            saw_host = true;
        }
        builder = builder.header(name, value);
    }
    if !saw_host {
        builder = builder.header("host", &original.host);
    }
    builder = builder.header("content-length", body.len().to_string());

    let request = builder
        .body(Body::from(body))
        .map_err(|e| ReplayError::BadRequest(e.to_string()))?;

    let (notify_tx, notify_rx) = oneshot::channel();
    let response = intercept::dispatch(
        state.clone(),
        tunnel,
        request,
        original.host.clone(),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        Some(original.id),
        Some(notify_tx),
    )
    .await;

    // Drain the response so the capture task can finish behind it
    let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await;

    match tokio::time::timeout(REPLAY_TIMEOUT, notify_rx).await {
        Ok(Ok(exchange)) => Ok(exchange),
        Ok(Err(_)) => Err(ReplayError::Failed("capture never completed".to_string())),
        Err(_) => Err(ReplayError::Failed("replay timed out".to_string())),
    }
}
