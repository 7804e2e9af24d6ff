//! Incremental HTTP/1.1 request head parsing.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::Method;
use percent_encoding::percent_decode;

use crate::app::Headers;
use crate::error::Parse;

/// Maximum bytes allowed in a request head before parsing is abandoned
/// (surfaced as 400 per the parse-error table).
pub(crate) const DEFAULT_MAX_HEAD_SIZE: usize = 64 * 1024;

pub(crate) const DEFAULT_MAX_HEADERS: usize = 100;

/// How the request body is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
    None,
    Length(u64),
    Chunked,
}

/// WebSocket handshake fields pulled out of the head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WsHandshake {
    pub(crate) key: String,
    pub(crate) subprotocols: Vec<String>,
}

/// A parsed request head.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    /// The request target exactly as received.
    pub(crate) target: Bytes,
    /// Percent-decoded path (before `?`); raw target on non-UTF-8 decode.
    pub(crate) path: String,
    /// Bytes after `?`, undecoded.
    pub(crate) query: Bytes,
    pub(crate) headers: Headers,
    pub(crate) keep_alive: bool,
    pub(crate) body: BodyLength,
    pub(crate) expect_continue: bool,
    pub(crate) websocket: Option<WsHandshake>,
    pub(crate) sse: bool,
}

/// Try to parse one request head from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. On success the head's
/// bytes are consumed from `buf`.
pub(crate) fn parse_head(buf: &mut BytesMut) -> Result<Option<RequestHead>, Parse> {
    let mut headers = [httparse::EMPTY_HEADER; DEFAULT_MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let status = req.parse(buf)?;
    let head_len = match status {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            if buf.len() > DEFAULT_MAX_HEAD_SIZE {
                return Err(Parse::TooLarge);
            }
            return Ok(None);
        }
    };

    let method = Method::from_bytes(req.method.unwrap_or("").as_bytes())?;
    let minor = req.version.ok_or(Parse::Version)?;
    if minor > 1 {
        return Err(Parse::Version);
    }

    let target = Bytes::copy_from_slice(req.path.unwrap_or("/").as_bytes());
    let (path, query) = split_target(&target);

    let mut out = Vec::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| Parse::Header(crate::error::Header::Token))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| Parse::Header(crate::error::Header::Token))?;
        out.push((name, value));
    }

    let body = body_length(&out)?;
    let keep_alive = keep_alive(minor, &out);
    let expect_continue = header_contains(&out, "expect", "100-continue");
    let websocket = detect_websocket(&out);
    let sse = header_contains(&out, "accept", "text/event-stream");

    let _ = buf.split_to(head_len);

    Ok(Some(RequestHead {
        method,
        target,
        path,
        query,
        headers: out,
        keep_alive,
        body,
        expect_continue,
        websocket,
        sse,
    }))
}

/// Split the request target into a decoded path and the raw query bytes.
fn split_target(target: &Bytes) -> (String, Bytes) {
    let (raw_path, query) = match target.iter().position(|&b| b == b'?') {
        Some(i) => (target.slice(..i), target.slice(i + 1..)),
        None => (target.clone(), Bytes::new()),
    };
    let decoded: Vec<u8> = percent_decode(&raw_path).collect();
    let path = match String::from_utf8(decoded) {
        Ok(p) => p,
        // Not valid UTF-8 once decoded; the raw bytes pass through.
        Err(_) => String::from_utf8_lossy(&raw_path).into_owned(),
    };
    (path, query)
}

/// Resolve body framing from `content-length` / `transfer-encoding`,
/// rejecting ambiguity (request smuggling defense).
fn body_length(headers: &Headers) -> Result<BodyLength, Parse> {
    let mut content_length: Option<u64> = None;
    let mut chunked = false;

    for (name, value) in headers {
        if name == http::header::CONTENT_LENGTH {
            let text = value
                .to_str()
                .map_err(|_| Parse::content_length_invalid())?;
            // A single header may fold multiple values; all must agree.
            for part in text.split(',') {
                let parsed = parse_content_length(part.trim())?;
                match content_length {
                    Some(prev) if prev != parsed => {
                        return Err(Parse::content_length_invalid());
                    }
                    _ => content_length = Some(parsed),
                }
            }
        } else if name == http::header::TRANSFER_ENCODING {
            let text = value
                .to_str()
                .map_err(|_| Parse::transfer_encoding_unexpected())?;
            let last = text.split(',').map(str::trim).last().unwrap_or_default();
            if last.eq_ignore_ascii_case("chunked") {
                chunked = true;
            } else {
                return Err(Parse::transfer_encoding_unexpected());
            }
        }
    }

    match (content_length, chunked) {
        // Both present: reject rather than pick a winner.
        (Some(_), true) => Err(Parse::transfer_encoding_unexpected()),
        (Some(n), false) => Ok(BodyLength::Length(n)),
        (None, true) => Ok(BodyLength::Chunked),
        (None, false) => Ok(BodyLength::None),
    }
}

fn parse_content_length(s: &str) -> Result<u64, Parse> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Parse::content_length_invalid());
    }
    s.parse().map_err(|_| Parse::content_length_invalid())
}

fn keep_alive(minor: u8, headers: &Headers) -> bool {
    if header_contains(headers, "connection", "close") {
        return false;
    }
    if minor == 0 {
        return header_contains(headers, "connection", "keep-alive");
    }
    true
}

/// Case-insensitive membership test over a comma-separated header value,
/// across duplicate headers.
fn header_contains(headers: &Headers, name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|(n, _)| n.as_str() == name)
        .filter_map(|(_, v)| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| {
            let t = t.trim();
            t.eq_ignore_ascii_case(token)
                || t.len() > token.len()
                    && t[..token.len()].eq_ignore_ascii_case(token)
                    && t.as_bytes()[token.len()] == b';'
        })
}

fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a HeaderValue> {
    headers
        .iter()
        .find(|(n, _)| n.as_str() == name)
        .map(|(_, v)| v)
}

/// The four-header WebSocket upgrade test. All must be present and
/// version must be 13; anything less stays a plain HTTP request.
fn detect_websocket(headers: &Headers) -> Option<WsHandshake> {
    if !header_contains(headers, "upgrade", "websocket") {
        return None;
    }
    if !header_contains(headers, "connection", "upgrade") {
        return None;
    }
    let version = header_value(headers, "sec-websocket-version")?;
    if version.as_bytes() != b"13" {
        return None;
    }
    let key = header_value(headers, "sec-websocket-key")?
        .to_str()
        .ok()?
        .trim()
        .to_owned();
    if key.is_empty() {
        return None;
    }
    let subprotocols = headers
        .iter()
        .filter(|(n, _)| n.as_str() == "sec-websocket-protocol")
        .filter_map(|(_, v)| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_owned())
        .filter(|p| !p.is_empty())
        .collect();
    Some(WsHandshake { key, subprotocols })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> Result<Option<RequestHead>, Parse> {
        let mut buf = BytesMut::from(raw);
        parse_head(&mut buf)
    }

    #[test]
    fn parses_simple_get() {
        let head = parse(b"GET /hello?x=1 HTTP/1.1\r\nHost: example\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.path, "/hello");
        assert_eq!(&head.query[..], b"x=1");
        assert_eq!(head.body, BodyLength::None);
        assert!(head.keep_alive);
        assert!(head.websocket.is_none());
        assert!(!head.sse);
    }

    #[test]
    fn partial_head_needs_more() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHos"[..]);
        assert!(parse_head(&mut buf).unwrap().is_none());
        // nothing consumed
        assert_eq!(&buf[..4], b"GET ");
    }

    #[test]
    fn headers_preserve_order_and_duplicates() {
        let head = parse(b"GET / HTTP/1.1\r\nX-One: a\r\nX-Two: b\r\nX-One: c\r\n\r\n")
            .unwrap()
            .unwrap();
        let names: Vec<_> = head.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["x-one", "x-two", "x-one"]);
    }

    #[test]
    fn percent_decodes_path() {
        let head = parse(b"GET /a%20b%2Fc HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.path, "/a b/c");
        assert_eq!(&head.target[..], b"/a%20b%2Fc");
    }

    #[test]
    fn invalid_utf8_path_passes_through() {
        let head = parse(b"GET /a%FF%FE HTTP/1.1\r\n\r\n").unwrap().unwrap();
        // decode produced invalid UTF-8; the raw target wins
        assert_eq!(head.path, "/a%FF%FE");
    }

    #[test]
    fn content_length_and_chunked_rejected() {
        let err = parse(
            b"POST / HTTP/1.1\r\ncontent-length: 5\r\ntransfer-encoding: chunked\r\n\r\n",
        )
        .unwrap_err();
        matches::assert_matches!(err, Parse::Header(_));
    }

    #[test]
    fn disagreeing_content_lengths_rejected() {
        let err = parse(b"POST / HTTP/1.1\r\ncontent-length: 5\r\ncontent-length: 6\r\n\r\n")
            .unwrap_err();
        matches::assert_matches!(err, Parse::Header(_));
    }

    #[test]
    fn agreeing_content_lengths_fold() {
        let head = parse(b"POST / HTTP/1.1\r\ncontent-length: 5, 5\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.body, BodyLength::Length(5));
    }

    #[test]
    fn chunked_body_detected() {
        let head = parse(b"POST / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.body, BodyLength::Chunked);
    }

    #[test]
    fn non_chunked_transfer_encoding_rejected() {
        let err = parse(b"POST / HTTP/1.1\r\ntransfer-encoding: gzip\r\n\r\n").unwrap_err();
        matches::assert_matches!(err, Parse::Header(_));
    }

    #[test]
    fn connection_close_disables_keep_alive() {
        let head = parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!head.keep_alive);
    }

    #[test]
    fn http10_defaults_to_close() {
        let head = parse(b"GET / HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert!(!head.keep_alive);
        let head = parse(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(head.keep_alive);
    }

    #[test]
    fn expect_continue_detected() {
        let head = parse(
            b"POST / HTTP/1.1\r\ncontent-length: 3\r\nExpect: 100-continue\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert!(head.expect_continue);
    }

    #[test]
    fn websocket_upgrade_detected() {
        let head = parse(
            b"GET /ws HTTP/1.1\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Protocol: chat, superchat\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        let ws = head.websocket.expect("handshake");
        assert_eq!(ws.key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(ws.subprotocols, ["chat", "superchat"]);
    }

    #[test]
    fn incomplete_websocket_handshake_stays_http() {
        // missing Sec-WebSocket-Key
        let head = parse(
            b"GET /ws HTTP/1.1\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert!(head.websocket.is_none());
    }

    #[test]
    fn event_stream_accept_detected() {
        let head = parse(b"GET /events HTTP/1.1\r\nAccept: text/event-stream\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(head.sse);
    }

    #[test]
    fn oversize_head_rejected() {
        let mut raw = Vec::from(&b"GET / HTTP/1.1\r\n"[..]);
        raw.extend(std::iter::repeat(b'a').take(DEFAULT_MAX_HEAD_SIZE + 1));
        matches::assert_matches!(parse(&raw).unwrap_err(), Parse::TooLarge);
    }
}
