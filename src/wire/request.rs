//! RTSP request parsing and response serialization (RFC 2326 §4, §6).
//!
//! Hand-rolled: the request line plus a small, fixed set of headers this
//! server actually reads. Header names are matched case-insensitively on
//! input; output always uses the canonical casing RTSP clients expect.

use std::collections::HashMap;

use crate::error::{Result, RtspError};

/// Maximum size of a buffered request (headers + Content-Length body) this
/// server will accept before dropping the connection.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
}

impl Method {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "OPTIONS" => Some(Self::Options),
            "DESCRIBE" => Some(Self::Describe),
            "SETUP" => Some(Self::Setup),
            "PLAY" => Some(Self::Play),
            "PAUSE" => Some(Self::Pause),
            "TEARDOWN" => Some(Self::Teardown),
            "GET_PARAMETER" => Some(Self::GetParameter),
            "SET_PARAMETER" => Some(Self::SetParameter),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Describe => "DESCRIBE",
            Self::Setup => "SETUP",
            Self::Play => "PLAY",
            Self::Pause => "PAUSE",
            Self::Teardown => "TEARDOWN",
            Self::GetParameter => "GET_PARAMETER",
            Self::SetParameter => "SET_PARAMETER",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn cseq(&self) -> Option<&str> {
        self.header("cseq")
    }
}

/// Try to take one complete request out of a connection's receive buffer.
/// Returns `Ok(None)` if more bytes are needed, `Ok(Some((request,
/// consumed_len)))` once the header block (and body, if `Content-Length`
/// says so) is fully buffered.
pub fn take_request_from_buffer(buf: &[u8]) -> Result<Option<(Request, usize)>> {
    if buf.len() > MAX_REQUEST_BYTES {
        return Err(RtspError::Protocol("request exceeds maximum size".into()));
    }

    let header_end = match find_double_crlf(buf) {
        Some(idx) => idx,
        None => return Ok(None),
    };

    let header_block = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| RtspError::Protocol("request headers are not valid UTF-8".into()))?;

    let mut lines = header_block.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| RtspError::Protocol("missing request line".into()))?;
    let uri = parts
        .next()
        .ok_or_else(|| RtspError::Protocol("missing request URI".into()))?
        .to_string();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("RTSP/") {
        return Err(RtspError::Protocol(format!("unsupported version {version}")));
    }

    let method = Method::parse(method_str)
        .ok_or_else(|| RtspError::UnsupportedMethod(method_str.to_string()))?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(RtspError::Protocol(format!("malformed header line: {line}")));
        };
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    let body_start = header_end + 4;
    let content_length = headers
        .get("content-length")
        .map(|v| v.parse::<usize>())
        .transpose()
        .map_err(|_| RtspError::Protocol("invalid Content-Length".into()))?
        .unwrap_or(0);

    let total_len = body_start + content_length;
    if buf.len() < total_len {
        return Ok(None);
    }

    let body = buf[body_start..total_len].to_vec();

    Ok(Some((
        Request {
            method,
            uri,
            headers,
            body,
        },
        total_len,
    )))
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Minimal response builder, written directly to the wire in `server.rs`.
#[derive(Debug, Clone)]
pub struct Response {
    pub status_code: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status_code: u16, reason: &'static str) -> Self {
        Self {
            status_code,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers.push(("Content-Type".to_string(), content_type.to_string()));
        self.headers.push(("Content-Length".to_string(), body.len().to_string()));
        self.body = body;
        self
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.reason);
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

pub fn status_reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        453 => "Not Enough Bandwidth",
        454 => "Session Not Found",
        455 => "Method Not Valid in This State",
        459 => "Aggregate Operation Not Allowed",
        461 => "Unsupported Transport",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        505 => "RTSP Version Not Supported",
        _ => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(s: &str) -> Vec<u8> {
        s.replace('\n', "\r\n").into_bytes()
    }

    #[test]
    fn parses_options_request_with_no_body() {
        let buf = raw("OPTIONS rtsp://host/cam1 RTSP/1.0\nCSeq: 1\n\n");
        let (req, consumed) = take_request_from_buffer(&buf).unwrap().unwrap();
        assert_eq!(req.method, Method::Options);
        assert_eq!(req.uri, "rtsp://host/cam1");
        assert_eq!(req.cseq(), Some("1"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn incomplete_headers_return_none() {
        let buf = raw("OPTIONS rtsp://host/cam1 RTSP/1.0\nCSeq: 1\n");
        assert!(take_request_from_buffer(&buf).unwrap().is_none());
    }

    #[test]
    fn waits_for_full_body_per_content_length() {
        let mut buf = raw("SET_PARAMETER rtsp://host/cam1 RTSP/1.0\nCSeq: 2\nContent-Length: 5\n\n");
        buf.extend_from_slice(b"abc");
        assert!(take_request_from_buffer(&buf).unwrap().is_none());
        buf.extend_from_slice(b"de");
        let (req, consumed) = take_request_from_buffer(&buf).unwrap().unwrap();
        assert_eq!(req.body, b"abcde");
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let buf = raw("OPTIONS rtsp://host/cam1 RTSP/1.0\nCSeq: 7\n\n");
        let (req, _) = take_request_from_buffer(&buf).unwrap().unwrap();
        assert_eq!(req.header("CSEQ"), Some("7"));
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let buf = raw("ANNOUNCE rtsp://host/cam1 RTSP/1.0\nCSeq: 1\n\n");
        let err = take_request_from_buffer(&buf).unwrap_err();
        assert!(matches!(err, RtspError::UnsupportedMethod(_)));
    }

    #[test]
    fn response_serializes_status_line_headers_and_body() {
        let resp = Response::new(200, "OK")
            .with_header("CSeq", "1")
            .with_body("application/sdp", b"v=0\r\n".to_vec());
        let bytes = resp.serialize();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("v=0\r\n"));
    }
}
