// Framed stream multiplexer
// Turns one reliable byte transport (the outer TLS connection) into many
// independent bidirectional streams with per-stream flow control.

pub mod frame;
pub mod session;
pub mod stream;

pub use frame::{Frame, FrameType, FLAG_ACK, HEADER_LEN, PROTOCOL_VERSION};
pub use session::{MuxConfig, MuxSession, Side};
pub use stream::MuxStream;

use std::error::Error;
use std::fmt;

/// Default per-direction credit window for each stream (256 KiB)
pub const DEFAULT_WINDOW: u32 = 256 * 1024;

/// Largest DATA payload written in a single frame
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Multiplexer errors
#[derive(Debug)]
pub enum MuxError {
    /// Session is closed (or closing); no new streams or frames
    SessionClosed,
    /// Too many concurrent streams
    StreamLimit,
    /// The stream was reset by the peer or by protocol violation
    StreamReset(u32),
    /// Peer sent a malformed or out-of-contract frame
    Protocol(String),
    /// Keepalive pings went unanswered
    Timeout,
    /// Underlying transport failure
    Io(String),
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxError::SessionClosed => write!(f, "session closed"),
            MuxError::StreamLimit => write!(f, "stream limit reached"),
            MuxError::StreamReset(id) => write!(f, "stream {} reset", id),
            MuxError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            MuxError::Timeout => write!(f, "keepalive timeout"),
            MuxError::Io(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl Error for MuxError {}

impl From<std::io::Error> for MuxError {
    fn from(e: std::io::Error) -> Self {
        MuxError::Io(e.to_string())
    }
}

impl From<MuxError> for std::io::Error {
    fn from(e: MuxError) -> Self {
        match e {
            MuxError::Io(msg) => std::io::Error::new(std::io::ErrorKind::BrokenPipe, msg),
            MuxError::Timeout => std::io::Error::new(std::io::ErrorKind::TimedOut, "keepalive timeout"),
            other => std::io::Error::new(std::io::ErrorKind::ConnectionReset, other.to_string()),
        }
    }
}

/// Multiplexer operation result type
pub type MuxResult<T> = Result<T, MuxError>;
