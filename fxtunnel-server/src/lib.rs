// fxtunnel server runtime
// Owns the endpoint registry, client sessions, the public HTTPS/TCP/UDP
// edges, the HTTP interceptor with capture and replay, certificate
// management and the REST API.

pub mod api;
pub mod bridge;
pub mod certs;
pub mod edge;
pub mod inspect;
pub mod intercept;
pub mod ports;
pub mod registry;
pub mod replay;
pub mod server;
pub mod session;
pub mod state;
pub mod subdomain;
pub mod tcp;
pub mod udp;

pub use registry::{Registry, Tunnel, TunnelBinding, TunnelCounters};
pub use server::TunnelServer;
pub use state::ServerState;

use std::error::Error;
use std::fmt;

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    /// Invalid or incomplete configuration
    ConfigError(String),
    /// A listener could not bind
    BindError(String),
    /// The store failed
    StoreError(String),
    /// TLS material could not be loaded or built
    TlsError(String),
    /// Certificate issuance failed
    AcmeError(String),
    /// A peer broke the wire contract
    ProtocolError(String),
    /// Network failure
    NetworkError(String),
    /// Everything else
    InternalError(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::ConfigError(msg) => write!(f, "configuration error: {}", msg),
            ServerError::BindError(msg) => write!(f, "bind failure: {}", msg),
            ServerError::StoreError(msg) => write!(f, "store failure: {}", msg),
            ServerError::TlsError(msg) => write!(f, "TLS error: {}", msg),
            ServerError::AcmeError(msg) => write!(f, "certificate issuance error: {}", msg),
            ServerError::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            ServerError::NetworkError(msg) => write!(f, "network error: {}", msg),
            ServerError::InternalError(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl Error for ServerError {}

impl From<fxtunnel_store::StoreError> for ServerError {
    fn from(e: fxtunnel_store::StoreError) -> Self {
        ServerError::StoreError(e.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::NetworkError(e.to_string())
    }
}

/// Server operation result type
pub type ServerResult<T> = Result<T, ServerError>;
