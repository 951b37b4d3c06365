// Control protocol messages exchanged on stream 0
// Length-prefixed JSON: a 4-byte big-endian length followed by the payload.

use crate::{ProtoError, ProtoResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Control protocol version sent with `auth`
pub const PROTOCOL_VERSION: &str = "1.0";

/// Largest accepted control message payload
const MAX_CONTROL_MESSAGE: usize = 64 * 1024;

/// Tunnel kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Http,
    Tcp,
    Udp,
}

impl std::fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelKind::Http => write!(f, "http"),
            TunnelKind::Tcp => write!(f, "tcp"),
            TunnelKind::Udp => write!(f, "udp"),
        }
    }
}

/// Plan quota summary sent back with `auth_ok`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanLimits {
    /// Maximum concurrent tunnels; -1 means unlimited
    pub max_tunnels: i64,
    /// Maximum reserved subdomains; -1 means unlimited
    pub max_subdomains: i64,
    /// Maximum custom domains; -1 means unlimited
    pub max_custom_domains: i64,
    /// Whether the HTTP inspector captures traffic for this plan
    pub inspector_enabled: bool,
}

/// Control protocol message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client authentication request; must be the first message
    Auth {
        token: String,
        client_version: String,
    },
    /// Server authentication success
    AuthOk {
        session_id: Uuid,
        server_time: DateTime<Utc>,
        plan_limits: PlanLimits,
    },
    /// Server authentication failure; the session closes afterwards
    AuthErr {
        code: String,
        message: String,
    },
    /// Request a new public endpoint
    OpenTunnel {
        kind: TunnelKind,
        /// Requested subdomain for HTTP tunnels; empty/absent for random
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        /// Preferred public port for TCP/UDP tunnels; 0 or absent for auto
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        /// Optional display name
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Endpoint assigned
    TunnelOpened {
        tunnel_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    /// Endpoint request failed
    TunnelErr {
        code: String,
        message: String,
    },
    /// Close a tunnel this session owns
    CloseTunnel {
        tunnel_id: Uuid,
    },
    /// Close acknowledged (also sent for server-initiated closes)
    TunnelClosed {
        tunnel_id: Uuid,
    },
    /// Optional application-level liveness probe
    Heartbeat {},
    HeartbeatAck {
        server_time: DateTime<Utc>,
    },
}

/// Write one length-prefixed control message
pub async fn write_control<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &ControlMessage,
) -> ProtoResult<()> {
    let payload = serde_json::to_vec(msg).map_err(|e| ProtoError::Decode(e.to_string()))?;
    if payload.len() > MAX_CONTROL_MESSAGE {
        return Err(ProtoError::TooLarge(format!(
            "control message is {} bytes",
            payload.len()
        )));
    }
    w.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    w.write_all(&payload).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-prefixed control message.
///
/// Returns `Ok(None)` on a clean EOF at a message boundary.
pub async fn read_control<R: AsyncRead + Unpin>(r: &mut R) -> ProtoResult<Option<ControlMessage>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_CONTROL_MESSAGE {
        return Err(ProtoError::TooLarge(format!("control message is {} bytes", len)));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    let msg = serde_json::from_slice(&payload).map_err(|e| ProtoError::Decode(e.to_string()))?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_control_round_trip() {
        let msg = ControlMessage::OpenTunnel {
            kind: TunnelKind::Http,
            subdomain: Some("demo".to_string()),
            port: None,
            name: Some("my app".to_string()),
        };
        let mut writer = std::io::Cursor::new(Vec::new());
        write_control(&mut writer, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(writer.into_inner());
        let decoded = read_control(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        assert!(read_control(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(10_000_000u32).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_control(&mut cursor).await.unwrap_err(),
            ProtoError::TooLarge(_)
        ));
    }

    #[test]
    fn test_tag_format_is_snake_case() {
        let msg = ControlMessage::Heartbeat {};
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"heartbeat\""));

        let msg = ControlMessage::Auth {
            token: "sk_test".to_string(),
            client_version: PROTOCOL_VERSION.to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"auth\""));
    }
}
