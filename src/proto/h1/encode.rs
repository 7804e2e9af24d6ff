//! HTTP/1.1 response serialization.
//!
//! The connection task decides the framing mode once (from the app's
//! declared headers and the first body event) and the encoder holds it for
//! the rest of the exchange.

use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::HeaderValue;
use http::StatusCode;

use crate::app::Headers;
use crate::error::Error;

/// How the response body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// `Content-Length` framing; the value is the bytes remaining.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// No body may follow (1xx, 204, 304).
    NoBody,
}

impl Mode {
    /// Whether a status code forbids a message body.
    pub(crate) fn forbids_body(status: StatusCode) -> bool {
        status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
    }
}

#[derive(Debug)]
pub(crate) struct Encoder {
    mode: Mode,
    /// HEAD responses carry framing headers but never body bytes.
    is_head: bool,
    /// Trailers were declared; the zero chunk is held open for them.
    trailers: bool,
    finished: bool,
}

impl Encoder {
    pub(crate) fn new(mode: Mode, is_head: bool, trailers: bool) -> Encoder {
        Encoder {
            mode,
            is_head,
            trailers,
            finished: false,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Serialize the status line and headers.
    ///
    /// Framing headers the app omitted are supplied here: `content-length`
    /// in `Length` mode, `transfer-encoding: chunked` in `Chunked` mode,
    /// `date` always, and `connection: close` when the exchange ends the
    /// connection.
    pub(crate) fn encode_head(
        &self,
        status: StatusCode,
        headers: &Headers,
        keep_alive: bool,
        buf: &mut BytesMut,
    ) {
        buf.extend_from_slice(b"HTTP/1.1 ");
        let mut code = itoa::Buffer::new();
        buf.extend_from_slice(code.format(status.as_u16()).as_bytes());
        buf.put_u8(b' ');
        buf.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        buf.extend_from_slice(b"\r\n");

        let mut saw_date = false;
        let mut saw_connection = false;
        let mut saw_content_length = false;
        let mut saw_transfer_encoding = false;

        for (name, value) in headers {
            match *name {
                http::header::DATE => saw_date = true,
                http::header::CONNECTION => saw_connection = true,
                http::header::CONTENT_LENGTH => {
                    // In chunked mode a leftover length header would desync
                    // the peer; the declared framing wins.
                    if self.mode == Mode::Chunked {
                        continue;
                    }
                    saw_content_length = true;
                }
                http::header::TRANSFER_ENCODING => {
                    if self.mode != Mode::Chunked {
                        continue;
                    }
                    saw_transfer_encoding = true;
                }
                _ => {}
            }
            put_header(buf, name.as_str().as_bytes(), value.as_bytes());
        }

        match self.mode {
            Mode::Length(n) if !saw_content_length => {
                let mut len = itoa::Buffer::new();
                put_header(buf, b"content-length", len.format(n).as_bytes());
            }
            Mode::Chunked if !saw_transfer_encoding => {
                put_header(buf, b"transfer-encoding", b"chunked");
            }
            _ => {}
        }
        if !saw_date {
            let date = httpdate::fmt_http_date(SystemTime::now());
            put_header(buf, b"date", date.as_bytes());
        }
        if !keep_alive && !saw_connection {
            put_header(buf, b"connection", b"close");
        }
        buf.extend_from_slice(b"\r\n");
    }

    /// Serialize one body event. The final event (`more == false`) closes
    /// the framing unless trailers are still owed.
    pub(crate) fn encode_body(
        &mut self,
        data: &[u8],
        more: bool,
        buf: &mut BytesMut,
    ) -> crate::Result<()> {
        if self.finished {
            return Err(Error::new_user_unexpected_event("body after response end"));
        }
        match self.mode {
            Mode::NoBody => {
                if !data.is_empty() {
                    return Err(Error::new_user_unexpected_event(
                        "body bytes on a bodiless status",
                    ));
                }
            }
            Mode::Length(ref mut remaining) => {
                let len = data.len() as u64;
                if len > *remaining {
                    return Err(Error::new_user_unexpected_event(
                        "body longer than declared content-length",
                    ));
                }
                *remaining -= len;
                if !self.is_head {
                    buf.extend_from_slice(data);
                }
                if !more && *remaining != 0 {
                    return Err(Error::new_user_unexpected_event(
                        "body shorter than declared content-length",
                    ));
                }
            }
            Mode::Chunked => {
                if self.is_head {
                    // framing suppressed entirely for HEAD
                } else {
                    if !data.is_empty() {
                        put_chunk_size(buf, data.len());
                        buf.extend_from_slice(data);
                        buf.extend_from_slice(b"\r\n");
                    }
                    if !more {
                        buf.extend_from_slice(b"0\r\n");
                        if !self.trailers {
                            buf.extend_from_slice(b"\r\n");
                        }
                    }
                }
            }
        }
        if !more && !self.trailers {
            self.finished = true;
        }
        Ok(())
    }

    /// Serialize declared trailers after the zero chunk.
    pub(crate) fn encode_trailers(
        &mut self,
        headers: &Headers,
        buf: &mut BytesMut,
    ) -> crate::Result<()> {
        if !self.trailers {
            return Err(Error::new_user_trailers_not_declared());
        }
        if self.finished {
            return Err(Error::new_user_unexpected_event("trailers after response end"));
        }
        if !self.is_head {
            for (name, value) in headers {
                put_header(buf, name.as_str().as_bytes(), value.as_bytes());
            }
            buf.extend_from_slice(b"\r\n");
        }
        self.trailers = false;
        self.finished = true;
        Ok(())
    }
}

/// `HTTP/1.1 100 Continue` interim response.
pub(crate) fn encode_continue(buf: &mut BytesMut) {
    buf.extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
}

/// A complete plain-text error response, used when the failure is the
/// server's to report (parse errors, app failures, stall timeouts).
pub(crate) fn error_response(status: StatusCode) -> Bytes {
    let body = status.canonical_reason().unwrap_or("Error");
    let mut buf = BytesMut::with_capacity(128 + body.len());
    let encoder = Encoder::new(Mode::Length(body.len() as u64), false, false);
    let headers: Headers = vec![(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    )];
    encoder.encode_head(status, &headers, false, &mut buf);
    buf.extend_from_slice(body.as_bytes());
    buf.freeze()
}

fn put_header(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    buf.extend_from_slice(name);
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value);
    buf.extend_from_slice(b"\r\n");
}

/// Writes `{:x}\r\n` without going through a formatter allocation.
fn put_chunk_size(buf: &mut BytesMut, mut n: usize) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut scratch = [0u8; 16];
    let mut i = scratch.len();
    loop {
        i -= 1;
        scratch[i] = DIGITS[n & 0xf];
        n >>= 4;
        if n == 0 {
            break;
        }
    }
    buf.extend_from_slice(&scratch[i..]);
    buf.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderName;

    fn name(n: &str) -> HeaderName {
        HeaderName::from_bytes(n.as_bytes()).unwrap()
    }

    fn value(v: &str) -> HeaderValue {
        HeaderValue::from_str(v).unwrap()
    }

    fn strip_date(raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        text.lines()
            .filter(|l| !l.starts_with("date:"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn content_length_response_bytes() {
        let mut buf = BytesMut::new();
        let mut encoder = Encoder::new(Mode::Length(5), false, false);
        let headers = vec![(name("content-type"), value("text/plain"))];
        encoder.encode_head(StatusCode::OK, &headers, true, &mut buf);
        encoder.encode_body(b"Hello", false, &mut buf).unwrap();
        assert!(encoder.is_finished());

        assert_eq!(
            strip_date(&buf),
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 5\r\n\r\nHello"
        );
    }

    #[test]
    fn chunked_framing_bytes() {
        let mut buf = BytesMut::new();
        let mut encoder = Encoder::new(Mode::Chunked, false, false);
        encoder.encode_head(StatusCode::OK, &vec![], true, &mut buf);
        buf.clear();
        encoder.encode_body(b"Wiki", true, &mut buf).unwrap();
        encoder.encode_body(b"pedia", true, &mut buf).unwrap();
        encoder.encode_body(b"", false, &mut buf).unwrap();
        assert_eq!(&buf[..], b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
        assert!(encoder.is_finished());
    }

    #[test]
    fn declared_trailers_keep_chunk_open() {
        let mut buf = BytesMut::new();
        let mut encoder = Encoder::new(Mode::Chunked, false, true);
        encoder.encode_body(b"x", false, &mut buf).unwrap();
        assert!(!encoder.is_finished());
        assert_eq!(&buf[..], b"1\r\nx\r\n0\r\n");

        buf.clear();
        let trailers = vec![(name("x-checksum"), value("abc"))];
        encoder.encode_trailers(&trailers, &mut buf).unwrap();
        assert_eq!(&buf[..], b"x-checksum: abc\r\n\r\n");
        assert!(encoder.is_finished());
    }

    #[test]
    fn undeclared_trailers_rejected() {
        let mut buf = BytesMut::new();
        let mut encoder = Encoder::new(Mode::Chunked, false, false);
        encoder.encode_body(b"", false, &mut buf).unwrap();
        let err = encoder.encode_trailers(&vec![], &mut buf).unwrap_err();
        assert!(err.is_user());
    }

    #[test]
    fn head_suppresses_body_bytes() {
        let mut buf = BytesMut::new();
        let mut encoder = Encoder::new(Mode::Length(5), true, false);
        let headers = vec![];
        encoder.encode_head(StatusCode::OK, &headers, true, &mut buf);
        let head_len = buf.len();
        encoder.encode_body(b"Hello", false, &mut buf).unwrap();
        assert_eq!(buf.len(), head_len, "no body bytes after the head");
        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("content-length: 5\r\n"));
    }

    #[test]
    fn bodiless_status_rejects_bytes() {
        assert!(Mode::forbids_body(StatusCode::NO_CONTENT));
        assert!(Mode::forbids_body(StatusCode::NOT_MODIFIED));
        assert!(!Mode::forbids_body(StatusCode::OK));

        let mut buf = BytesMut::new();
        let mut encoder = Encoder::new(Mode::NoBody, false, false);
        encoder.encode_head(StatusCode::NO_CONTENT, &vec![], true, &mut buf);
        let err = encoder.encode_body(b"oops", false, &mut buf).unwrap_err();
        assert!(err.is_user());
    }

    #[test]
    fn over_long_body_rejected() {
        let mut buf = BytesMut::new();
        let mut encoder = Encoder::new(Mode::Length(3), false, false);
        let err = encoder.encode_body(b"toolong", false, &mut buf).unwrap_err();
        assert!(err.is_user());
    }

    #[test]
    fn connection_close_added_when_not_keep_alive() {
        let mut buf = BytesMut::new();
        let encoder = Encoder::new(Mode::Length(0), false, false);
        encoder.encode_head(StatusCode::OK, &vec![], false, &mut buf);
        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("connection: close\r\n"));
    }

    #[test]
    fn error_response_is_plain_text() {
        let raw = error_response(StatusCode::INTERNAL_SERVER_ERROR);
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("content-type: text/plain\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("Internal Server Error"));
    }
}
