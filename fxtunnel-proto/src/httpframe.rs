// Compact binary framing for HTTP exchanges over a mux stream
//
// Request head: 1-byte method code, 2-byte header count, then per header
// u8 name-len, u16 value-len, name bytes, value bytes, then a u32 body
// length marker. 0xFFFF_FFFF means the body streams until the write side
// half-closes. The request path travels as the leading `:path` pseudo
// header; non-standard methods use code 0 with the literal method in an
// `x-fxtunnel-method` header.
//
// Response head: 2-byte status, 2-byte header count, headers, body marker,
// same conventions.

use crate::{ProtoError, ProtoResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Body length marker for "streamed until FIN"
pub const BODY_STREAMED: u32 = 0xFFFF_FFFF;

/// Pseudo header carrying the request path
pub const PSEUDO_PATH: &str = ":path";

/// Header carrying the literal method when the code is 0
pub const EXTENSION_METHOD_HEADER: &str = "x-fxtunnel-method";

const MAX_HEADERS: usize = 256;

/// How much body follows a frame head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLen {
    /// Exactly this many bytes follow
    Known(u32),
    /// Bytes follow until the stream half-closes
    Streamed,
}

impl BodyLen {
    fn to_wire(self) -> u32 {
        match self {
            BodyLen::Known(n) => n,
            BodyLen::Streamed => BODY_STREAMED,
        }
    }

    fn from_wire(v: u32) -> BodyLen {
        if v == BODY_STREAMED {
            BodyLen::Streamed
        } else {
            BodyLen::Known(v)
        }
    }
}

fn method_code(method: &str) -> u8 {
    match method {
        "GET" => 1,
        "POST" => 2,
        "PUT" => 3,
        "DELETE" => 4,
        "HEAD" => 5,
        "OPTIONS" => 6,
        "PATCH" => 7,
        "CONNECT" => 8,
        "TRACE" => 9,
        _ => 0,
    }
}

fn method_name(code: u8) -> Option<&'static str> {
    match code {
        1 => Some("GET"),
        2 => Some("POST"),
        3 => Some("PUT"),
        4 => Some("DELETE"),
        5 => Some("HEAD"),
        6 => Some("OPTIONS"),
        7 => Some("PATCH"),
        8 => Some("CONNECT"),
        9 => Some("TRACE"),
        _ => None,
    }
}

/// Decoded request head
#[derive(Debug, Clone, PartialEq)]
pub struct FramedRequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body_len: BodyLen,
}

/// Decoded response head
#[derive(Debug, Clone, PartialEq)]
pub struct FramedResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body_len: BodyLen,
}

async fn write_headers<W: AsyncWrite + Unpin>(
    w: &mut W,
    headers: &[(String, String)],
) -> ProtoResult<()> {
    if headers.len() > MAX_HEADERS {
        return Err(ProtoError::TooLarge(format!("{} headers", headers.len())));
    }
    w.write_all(&(headers.len() as u16).to_be_bytes()).await?;
    for (name, value) in headers {
        if name.len() > u8::MAX as usize {
            return Err(ProtoError::TooLarge(format!("header name '{}'", name)));
        }
        if value.len() > u16::MAX as usize {
            return Err(ProtoError::TooLarge(format!("value of header '{}'", name)));
        }
        w.write_all(&[name.len() as u8]).await?;
        w.write_all(&(value.len() as u16).to_be_bytes()).await?;
        w.write_all(name.as_bytes()).await?;
        w.write_all(value.as_bytes()).await?;
    }
    Ok(())
}

async fn read_headers<R: AsyncRead + Unpin>(r: &mut R) -> ProtoResult<Vec<(String, String)>> {
    let mut count_buf = [0u8; 2];
    r.read_exact(&mut count_buf).await?;
    let count = u16::from_be_bytes(count_buf) as usize;
    if count > MAX_HEADERS {
        return Err(ProtoError::TooLarge(format!("{} headers", count)));
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let mut name_len = [0u8; 1];
        r.read_exact(&mut name_len).await?;
        let mut value_len = [0u8; 2];
        r.read_exact(&mut value_len).await?;
        let mut name = vec![0u8; name_len[0] as usize];
        r.read_exact(&mut name).await?;
        let mut value = vec![0u8; u16::from_be_bytes(value_len) as usize];
        r.read_exact(&mut value).await?;
        let name = String::from_utf8(name).map_err(|_| {
            ProtoError::Decode("header name is not valid UTF-8".to_string())
        })?;
        let value = String::from_utf8(value).map_err(|_| {
            ProtoError::Decode(format!("value of header '{}' is not valid UTF-8", name))
        })?;
        headers.push((name, value));
    }
    Ok(headers)
}

/// Encode a request head onto a mux stream
pub async fn write_request_head<W: AsyncWrite + Unpin>(
    w: &mut W,
    head: &FramedRequestHead,
) -> ProtoResult<()> {
    let code = method_code(&head.method);
    w.write_all(&[code]).await?;

    let mut headers: Vec<(String, String)> =
        Vec::with_capacity(head.headers.len() + 2);
    headers.push((PSEUDO_PATH.to_string(), head.path.clone()));
    if code == 0 {
        headers.push((EXTENSION_METHOD_HEADER.to_string(), head.method.clone()));
    }
    headers.extend(head.headers.iter().cloned());

    write_headers(w, &headers).await?;
    w.write_all(&head.body_len.to_wire().to_be_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Decode a request head from a mux stream
pub async fn read_request_head<R: AsyncRead + Unpin>(r: &mut R) -> ProtoResult<FramedRequestHead> {
    let mut code = [0u8; 1];
    r.read_exact(&mut code).await?;
    let mut headers = read_headers(r).await?;
    let mut marker = [0u8; 4];
    r.read_exact(&mut marker).await?;

    let path = match headers.iter().position(|(n, _)| n == PSEUDO_PATH) {
        Some(i) => headers.remove(i).1,
        None => return Err(ProtoError::Decode("missing :path pseudo header".to_string())),
    };
    let method = match method_name(code[0]) {
        Some(m) => m.to_string(),
        None => match headers.iter().position(|(n, _)| n == EXTENSION_METHOD_HEADER) {
            Some(i) => headers.remove(i).1,
            None => {
                return Err(ProtoError::Decode(
                    "extension method code without method header".to_string(),
                ))
            }
        },
    };

    Ok(FramedRequestHead {
        method,
        path,
        headers,
        body_len: BodyLen::from_wire(u32::from_be_bytes(marker)),
    })
}

/// Encode a response head onto a mux stream
pub async fn write_response_head<W: AsyncWrite + Unpin>(
    w: &mut W,
    head: &FramedResponseHead,
) -> ProtoResult<()> {
    w.write_all(&head.status.to_be_bytes()).await?;
    write_headers(w, &head.headers).await?;
    w.write_all(&head.body_len.to_wire().to_be_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Decode a response head from a mux stream
pub async fn read_response_head<R: AsyncRead + Unpin>(
    r: &mut R,
) -> ProtoResult<FramedResponseHead> {
    let mut status = [0u8; 2];
    r.read_exact(&mut status).await?;
    let headers = read_headers(r).await?;
    let mut marker = [0u8; 4];
    r.read_exact(&mut marker).await?;
    Ok(FramedResponseHead {
        status: u16::from_be_bytes(status),
        headers,
        body_len: BodyLen::from_wire(u32::from_be_bytes(marker)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_head_round_trip() {
        let head = FramedRequestHead {
            method: "POST".to_string(),
            path: "/v1/do?x=1".to_string(),
            headers: vec![
                ("host".to_string(), "demo.example.test".to_string()),
                ("content-type".to_string(), "application/json".to_string()),
            ],
            body_len: BodyLen::Known(9),
        };
        let mut writer = std::io::Cursor::new(Vec::new());
        write_request_head(&mut writer, &head).await.unwrap();

        let mut cursor = std::io::Cursor::new(writer.into_inner());
        let decoded = read_request_head(&mut cursor).await.unwrap();
        assert_eq!(decoded, head);
    }

    #[tokio::test]
    async fn test_extension_method_round_trip() {
        let head = FramedRequestHead {
            method: "PROPFIND".to_string(),
            path: "/dav".to_string(),
            headers: vec![("host".to_string(), "x.example.test".to_string())],
            body_len: BodyLen::Streamed,
        };
        let mut writer = std::io::Cursor::new(Vec::new());
        write_request_head(&mut writer, &head).await.unwrap();

        let mut cursor = std::io::Cursor::new(writer.into_inner());
        let decoded = read_request_head(&mut cursor).await.unwrap();
        assert_eq!(decoded.method, "PROPFIND");
        assert_eq!(decoded.body_len, BodyLen::Streamed);
        // The carrier header is stripped on decode
        assert!(!decoded.headers.iter().any(|(n, _)| n == EXTENSION_METHOD_HEADER));
    }

    #[tokio::test]
    async fn test_response_head_round_trip() {
        let head = FramedResponseHead {
            status: 502,
            headers: vec![("content-length".to_string(), "12".to_string())],
            body_len: BodyLen::Known(12),
        };
        let mut writer = std::io::Cursor::new(Vec::new());
        write_response_head(&mut writer, &head).await.unwrap();

        let mut cursor = std::io::Cursor::new(writer.into_inner());
        let decoded = read_response_head(&mut cursor).await.unwrap();
        assert_eq!(decoded, head);
    }

    #[tokio::test]
    async fn test_missing_path_rejected() {
        // A request head encoded with no headers at all
        let mut buf = Vec::new();
        buf.push(1); // GET
        buf.extend_from_slice(&0u16.to_be_bytes()); // zero headers
        buf.extend_from_slice(&0u32.to_be_bytes()); // empty body
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_request_head(&mut cursor).await.is_err());
    }

    #[test]
    fn test_streamed_marker() {
        assert_eq!(BodyLen::Streamed.to_wire(), BODY_STREAMED);
        assert_eq!(BodyLen::from_wire(BODY_STREAMED), BodyLen::Streamed);
        assert_eq!(BodyLen::from_wire(7), BodyLen::Known(7));
    }
}
