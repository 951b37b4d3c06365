// Wire protocol shared by server and client
// Control messages ride stream 0 as length-prefixed JSON; HTTP exchanges
// and UDP datagrams use the compact binary framings defined here.

pub mod control;
pub mod httpframe;
pub mod udpframe;

pub use control::{
    read_control, write_control, ControlMessage, PlanLimits, TunnelKind, PROTOCOL_VERSION,
};
pub use httpframe::{
    read_request_head, read_response_head, write_request_head, write_response_head, BodyLen,
    FramedRequestHead, FramedResponseHead,
};

use std::error::Error;
use std::fmt;

/// Structured failure codes carried in control replies and REST errors
pub mod codes {
    pub const BAD_TOKEN: &str = "BAD_TOKEN";
    pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
    pub const USER_DISABLED: &str = "USER_DISABLED";
    pub const UNSUPPORTED_VERSION: &str = "UNSUPPORTED_VERSION";
    pub const SUBDOMAIN_TAKEN: &str = "SUBDOMAIN_TAKEN";
    pub const SUBDOMAIN_NOT_ALLOWED: &str = "SUBDOMAIN_NOT_ALLOWED";
    pub const INVALID_SUBDOMAIN: &str = "INVALID_SUBDOMAIN";
    pub const PORT_TAKEN: &str = "PORT_TAKEN";
    pub const PORTS_EXHAUSTED: &str = "PORTS_EXHAUSTED";
    pub const QUOTA_EXCEEDED: &str = "QUOTA_EXCEEDED";
    pub const UNKNOWN_TUNNEL: &str = "UNKNOWN_TUNNEL";
    pub const TUNNEL_GONE: &str = "TUNNEL_GONE";
    pub const NOT_AUTHENTICATED: &str = "NOT_AUTHENTICATED";
    pub const INTERNAL: &str = "INTERNAL";
}

/// Protocol codec errors
#[derive(Debug)]
pub enum ProtoError {
    /// Transport failure while reading or writing
    Io(String),
    /// Payload failed to parse
    Decode(String),
    /// Message or field exceeds its wire limit
    TooLarge(String),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::Io(msg) => write!(f, "I/O error: {}", msg),
            ProtoError::Decode(msg) => write!(f, "decode error: {}", msg),
            ProtoError::TooLarge(msg) => write!(f, "message too large: {}", msg),
        }
    }
}

impl Error for ProtoError {}

impl From<std::io::Error> for ProtoError {
    fn from(e: std::io::Error) -> Self {
        ProtoError::Io(e.to_string())
    }
}

/// Protocol operation result type
pub type ProtoResult<T> = Result<T, ProtoError>;
