// UDP datagram framing over a mux stream
//
// A server-opened UDP stream begins with a session header identifying the
// public peer: u16 address length (4 for IPv4, 16 for IPv6), u16 peer
// port, then the raw address bytes. Every datagram in either direction is
// then length-prefixed with a u16.

use crate::{ProtoError, ProtoResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest UDP payload carried through a tunnel
pub const MAX_DATAGRAM: usize = 65_535;

/// Write the stream-opening session header for a public peer address
pub async fn write_session_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    peer: SocketAddr,
) -> ProtoResult<()> {
    match peer.ip() {
        IpAddr::V4(ip) => {
            w.write_all(&4u16.to_be_bytes()).await?;
            w.write_all(&peer.port().to_be_bytes()).await?;
            w.write_all(&ip.octets()).await?;
        }
        IpAddr::V6(ip) => {
            w.write_all(&16u16.to_be_bytes()).await?;
            w.write_all(&peer.port().to_be_bytes()).await?;
            w.write_all(&ip.octets()).await?;
        }
    }
    w.flush().await?;
    Ok(())
}

/// Read the stream-opening session header
pub async fn read_session_header<R: AsyncRead + Unpin>(r: &mut R) -> ProtoResult<SocketAddr> {
    let mut len = [0u8; 2];
    r.read_exact(&mut len).await?;
    let mut port = [0u8; 2];
    r.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    let ip = match u16::from_be_bytes(len) {
        4 => {
            let mut octets = [0u8; 4];
            r.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        16 => {
            let mut octets = [0u8; 16];
            r.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => {
            return Err(ProtoError::Decode(format!(
                "bad address length {} in UDP session header",
                other
            )))
        }
    };
    Ok(SocketAddr::new(ip, port))
}

/// Write one length-prefixed datagram
pub async fn write_datagram<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> ProtoResult<()> {
    if payload.len() > MAX_DATAGRAM {
        return Err(ProtoError::TooLarge(format!("datagram is {} bytes", payload.len())));
    }
    w.write_all(&(payload.len() as u16).to_be_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-prefixed datagram.
///
/// Returns `Ok(None)` on a clean EOF at a datagram boundary.
pub async fn read_datagram<R: AsyncRead + Unpin>(r: &mut R) -> ProtoResult<Option<Vec<u8>>> {
    let mut len = [0u8; 2];
    match r.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
    r.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
