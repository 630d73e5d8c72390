//! HTTP request/response line and header parsing.
//!
//! Only start-lines and headers are parsed; bodies are never reassembled. `parse_from`
//! returns `Ok(None)` when the buffer holds an incomplete start-line/header block (more
//! data may still arrive) and an error only once httparse reports the bytes are not a
//! valid HTTP message at all.

use anyhow::{bail, Result};
use httparse::{Request, Response, Status, EMPTY_HEADER};

#[derive(Debug, Default, Clone)]
pub struct HttpRequest {
    pub method: Option<String>,
    pub uri: Option<String>,
    pub version: Option<String>,
    pub user_agent: Option<String>,
    pub host: Option<String>,
    pub content_length: Option<usize>,
}

impl HttpRequest {
    /// Returns `Some((request, bytes_consumed))` once a full start-line and header block
    /// is present at the front of `data`, `None` if more data is needed, or an error if
    /// `data` cannot be a valid HTTP request no matter how much more arrives.
    pub(crate) fn parse_from(data: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut request = HttpRequest::default();
        const NUM_OF_HEADERS: usize = 20;
        let mut headers = [EMPTY_HEADER; NUM_OF_HEADERS];
        let mut req = Request::new(&mut headers[..]);
        let consumed = match req.parse(data) {
            Ok(Status::Complete(n)) => n,
            Ok(Status::Partial) => return Ok(None),
            Err(_) => bail!("not an HTTP request"),
        };

        request.method = req.method.map(str::to_owned);
        request.uri = req.path.map(str::to_owned);
        request.version = req.version.map(|v| format!("HTTP/1.{v}"));
        for hdr in &headers {
            match hdr.name.to_lowercase().as_str() {
                "user-agent" => request.user_agent = Some(String::from_utf8_lossy(hdr.value).into_owned()),
                "host" => request.host = Some(String::from_utf8_lossy(hdr.value).into_owned()),
                "content-length" => {
                    if let Ok(s) = std::str::from_utf8(hdr.value) {
                        request.content_length = s.parse().ok();
                    }
                }
                _ => (),
            }
        }
        Ok(Some((request, consumed)))
    }
}

#[derive(Debug, Default, Clone)]
pub struct HttpResponse {
    pub version: Option<String>,
    pub status_code: Option<u16>,
    pub status_msg: Option<String>,
    pub content_length: Option<usize>,
}

impl HttpResponse {
    pub(crate) fn parse_from(data: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut response = HttpResponse::default();
        const NUM_OF_HEADERS: usize = 20;
        let mut headers = [EMPTY_HEADER; NUM_OF_HEADERS];
        let mut resp = Response::new(&mut headers[..]);
        let consumed = match resp.parse(data) {
            Ok(Status::Complete(n)) => n,
            Ok(Status::Partial) => return Ok(None),
            Err(_) => bail!("not an HTTP response"),
        };

        response.version = resp.version.map(|v| format!("HTTP/1.{v}"));
        response.status_code = resp.code;
        response.status_msg = resp.reason.map(str::to_owned);
        for hdr in &headers {
            if hdr.name.eq_ignore_ascii_case("content-length") {
                if let Ok(s) = std::str::from_utf8(hdr.value) {
                    response.content_length = s.parse().ok();
                }
            }
        }
        Ok(Some((response, consumed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_request_returns_none() {
        let buf = b"GET / HTTP/1.1\r\nHost: example.com\r\n";
        assert!(HttpRequest::parse_from(buf).unwrap().is_none());
    }

    #[test]
    fn complete_request_reports_bytes_consumed() {
        let buf = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\nextra";
        let (request, consumed) = HttpRequest::parse_from(buf).unwrap().unwrap();
        assert_eq!(request.method.as_deref(), Some("GET"));
        assert_eq!(consumed, buf.len() - b"extra".len());
    }

    #[test]
    fn garbage_is_a_hard_error() {
        let buf = b"\x00\x01\x02not http at all";
        assert!(HttpRequest::parse_from(buf).is_err());
    }
}
