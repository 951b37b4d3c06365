// fxtunnel client runtime
// Holds one multiplexed control connection to the server, opens the
// configured tunnels after authenticating, and answers server-opened
// streams by dialing local services.

pub mod client;
pub mod connection;
pub mod handlers;

pub use client::{ConnectionState, ReconnectionStrategy, TunnelClient};

use std::error::Error;
use std::fmt;

/// Client errors
#[derive(Debug)]
pub enum ClientError {
    /// Could not reach or handshake with the server
    ConnectionFailed(String),
    /// The server rejected our token
    AuthenticationFailed(String),
    /// TLS setup or validation failed
    TlsError(String),
    /// The server broke the wire contract
    ProtocolError(String),
    /// Invalid configuration
    ConfigError(String),
    /// Network failure mid-session
    NetworkError(String),
    /// Everything else
    InternalError(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::ConnectionFailed(msg) => write!(f, "connection failed: {}", msg),
            ClientError::AuthenticationFailed(msg) => write!(f, "authentication failed: {}", msg),
            ClientError::TlsError(msg) => write!(f, "TLS error: {}", msg),
            ClientError::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            ClientError::ConfigError(msg) => write!(f, "configuration error: {}", msg),
            ClientError::NetworkError(msg) => write!(f, "network error: {}", msg),
            ClientError::InternalError(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::NetworkError(e.to_string())
    }
}

impl From<fxtunnel_proto::ProtoError> for ClientError {
    fn from(e: fxtunnel_proto::ProtoError) -> Self {
        ClientError::ProtocolError(e.to_string())
    }
}

/// Client operation result type
pub type ClientResult<T> = Result<T, ClientError>;
