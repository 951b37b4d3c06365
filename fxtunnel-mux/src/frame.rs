// Wire framing for the multiplexer
// Every frame is a fixed 12-byte header followed by an optional payload,
// network byte order throughout.

use crate::{MuxError, MuxResult};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version carried in the first header byte
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed frame header length in bytes
pub const HEADER_LEN: usize = 12;

/// PING frames with this flag set are acknowledgements
pub const FLAG_ACK: u16 = 0x0001;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Open a new stream; payload is an opaque stream header
    Syn = 1,
    /// Stream payload bytes
    Data = 2,
    /// Flow-control credit grant; payload is a u32 increment
    WinUpdate = 3,
    /// Half-close of the sender's write direction
    Fin = 4,
    /// Abortive stream close; payload is a u32 error code
    Rst = 5,
    /// Keepalive probe; payload is an 8-byte opaque nonce
    Ping = 6,
    /// Graceful session shutdown; payload is the highest accepted stream id
    GoAway = 7,
}

impl FrameType {
    fn from_u8(v: u8) -> Option<FrameType> {
        match v {
            1 => Some(FrameType::Syn),
            2 => Some(FrameType::Data),
            3 => Some(FrameType::WinUpdate),
            4 => Some(FrameType::Fin),
            5 => Some(FrameType::Rst),
            6 => Some(FrameType::Ping),
            7 => Some(FrameType::GoAway),
            _ => None,
        }
    }
}

/// A single multiplexer frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub typ: FrameType,
    pub flags: u16,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(typ: FrameType, stream_id: u32, payload: Bytes) -> Self {
        Frame { typ, flags: 0, stream_id, payload }
    }

    pub fn syn(stream_id: u32, header: Bytes) -> Self {
        Frame::new(FrameType::Syn, stream_id, header)
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Frame::new(FrameType::Data, stream_id, payload)
    }

    pub fn win_update(stream_id: u32, increment: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(increment);
        Frame::new(FrameType::WinUpdate, stream_id, buf.freeze())
    }

    pub fn fin(stream_id: u32) -> Self {
        Frame::new(FrameType::Fin, stream_id, Bytes::new())
    }

    pub fn rst(stream_id: u32, code: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(code);
        Frame::new(FrameType::Rst, stream_id, buf.freeze())
    }

    pub fn ping(nonce: u64, ack: bool) -> Self {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(nonce);
        let mut frame = Frame::new(FrameType::Ping, 0, buf.freeze());
        if ack {
            frame.flags |= FLAG_ACK;
        }
        frame
    }

    pub fn goaway(last_stream_id: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(last_stream_id);
        Frame::new(FrameType::GoAway, 0, buf.freeze())
    }

    /// Decode the leading u32 of the payload (WIN_UPDATE increment,
    /// RST code, GOAWAY last-stream-id)
    pub fn payload_u32(&self) -> MuxResult<u32> {
        if self.payload.len() < 4 {
            return Err(MuxError::Protocol(format!(
                "{:?} frame payload too short: {} bytes",
                self.typ,
                self.payload.len()
            )));
        }
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.payload[..4]);
        Ok(u32::from_be_bytes(b))
    }

    /// Decode the 8-byte PING nonce
    pub fn payload_u64(&self) -> MuxResult<u64> {
        if self.payload.len() < 8 {
            return Err(MuxError::Protocol(format!(
                "{:?} frame payload too short: {} bytes",
                self.typ,
                self.payload.len()
            )));
        }
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.payload[..8]);
        Ok(u64::from_be_bytes(b))
    }

    /// Serialize into a single contiguous buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.typ as u8);
        buf.put_u16(self.flags);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Write one frame to the transport
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> MuxResult<()> {
    w.write_all(&frame.encode()).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame from the transport.
///
/// Any malformed header (bad version, unknown type, oversized payload)
/// is a protocol violation that terminates the whole session.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, max_payload: usize) -> MuxResult<Frame> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header).await?;

    if header[0] != PROTOCOL_VERSION {
        return Err(MuxError::Protocol(format!("unsupported version {}", header[0])));
    }
    let typ = FrameType::from_u8(header[1])
        .ok_or_else(|| MuxError::Protocol(format!("unknown frame type {}", header[1])))?;
    let flags = u16::from_be_bytes([header[2], header[3]]);
    let stream_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;

    if len > max_payload {
        return Err(MuxError::Protocol(format!(
            "frame payload {} exceeds limit {}",
            len, max_payload
        )));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut payload).await?;
    }

    Ok(Frame { typ, flags, stream_id, payload: Bytes::from(payload) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let frame = Frame::data(7, Bytes::from_static(b"hello"));
        let mut writer = std::io::Cursor::new(Vec::new());
        write_frame(&mut writer, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(writer.into_inner());
        let decoded = read_frame(&mut cursor, 1024).await.unwrap();
        assert_eq!(decoded.typ, FrameType::Data);
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_ping_ack_flag() {
        let frame = Frame::ping(42, true);
        let mut writer = std::io::Cursor::new(Vec::new());
        write_frame(&mut writer, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(writer.into_inner());
        let decoded = read_frame(&mut cursor, 1024).await.unwrap();
        assert_eq!(decoded.typ, FrameType::Ping);
        assert_ne!(decoded.flags & FLAG_ACK, 0);
        assert_eq!(decoded.payload_u64().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_bad_version_rejected() {
        let frame = Frame::fin(3);
        let mut writer = std::io::Cursor::new(Vec::new());
        write_frame(&mut writer, &frame).await.unwrap();
        let mut buf = writer.into_inner();
        buf[0] = 9;

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, MuxError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let frame = Frame::fin(3);
        let mut writer = std::io::Cursor::new(Vec::new());
        write_frame(&mut writer, &frame).await.unwrap();
        let mut buf = writer.into_inner();
        buf[1] = 200;

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, MuxError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let frame = Frame::data(1, Bytes::from(vec![0u8; 64]));
        let mut writer = std::io::Cursor::new(Vec::new());
        write_frame(&mut writer, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(writer.into_inner());
        let err = read_frame(&mut cursor, 16).await.unwrap_err();
        assert!(matches!(err, MuxError::Protocol(_)));
    }

    #[test]
    fn test_win_update_payload() {
        let frame = Frame::win_update(5, 4096);
        assert_eq!(frame.payload_u32().unwrap(), 4096);
    }
}
