//! Server-Sent Events serialization.
//!
//! Field order follows the emitter contract: `event`, `data` (one line per
//! newline in the payload), `id`, `retry`, each block terminated by a blank
//! line. Keepalives and bare comments serialize as `:<comment>` lines.

use std::time::Duration;

use bytes::{BufMut, BytesMut};

/// One server-sent event, any subset of fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` — the event type the client listens for.
    pub event: Option<String>,
    /// `data:` — the payload; embedded newlines split across `data:` lines.
    pub data: Option<String>,
    /// `id:` — the last-event-id the client echoes on reconnect.
    pub id: Option<String>,
    /// `retry:` — reconnection delay hint.
    pub retry: Option<Duration>,
}

impl SseEvent {
    pub fn new() -> SseEvent {
        SseEvent::default()
    }

    pub fn event(mut self, event: impl Into<String>) -> SseEvent {
        self.event = Some(event.into());
        self
    }

    pub fn data(mut self, data: impl Into<String>) -> SseEvent {
        self.data = Some(data.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> SseEvent {
        self.id = Some(id.into());
        self
    }

    pub fn retry(mut self, retry: Duration) -> SseEvent {
        self.retry = Some(retry);
        self
    }
}

/// Serialize one event block. An event with no fields produces nothing.
pub(crate) fn serialize(event: &SseEvent, buf: &mut BytesMut) {
    let start = buf.len();
    if let Some(ref name) = event.event {
        put_field(buf, b"event", name);
    }
    if let Some(ref data) = event.data {
        // One `data:` line per payload line; the client re-joins with \n.
        for line in data.split('\n') {
            put_field(buf, b"data", line.strip_suffix('\r').unwrap_or(line));
        }
    }
    if let Some(ref id) = event.id {
        put_field(buf, b"id", id);
    }
    if let Some(retry) = event.retry {
        let mut millis = itoa::Buffer::new();
        put_field(buf, b"retry", millis.format(retry.as_millis() as u64));
    }
    if buf.len() > start {
        buf.put_u8(b'\n');
    }
}

/// Serialize a bare comment block: `:<comment>\n\n`. Used for explicit
/// `sse.comment` events and the keepalive timer.
pub(crate) fn serialize_comment(comment: &str, buf: &mut BytesMut) {
    buf.put_u8(b':');
    buf.extend_from_slice(sanitize(comment).as_bytes());
    buf.extend_from_slice(b"\n\n");
}

fn put_field(buf: &mut BytesMut, name: &[u8], value: &str) {
    buf.extend_from_slice(name);
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(sanitize(value).as_bytes());
    buf.put_u8(b'\n');
}

/// Field values may not carry line breaks; a stray CR/LF would desync the
/// stream framing.
fn sanitize(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains(['\r', '\n']) {
        std::borrow::Cow::Owned(value.replace(['\r', '\n'], ""))
    } else {
        std::borrow::Cow::Borrowed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(event: &SseEvent) -> String {
        let mut buf = BytesMut::new();
        serialize(event, &mut buf);
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn full_event_block() {
        let event = SseEvent::new().event("x").data("a\nb").id("1");
        assert_eq!(render(&event), "event: x\ndata: a\ndata: b\nid: 1\n\n");
    }

    #[test]
    fn data_only() {
        let event = SseEvent::new().data("p1");
        assert_eq!(render(&event), "data: p1\n\n");
    }

    #[test]
    fn crlf_data_splits_cleanly() {
        let event = SseEvent::new().data("a\r\nb");
        assert_eq!(render(&event), "data: a\ndata: b\n\n");
    }

    #[test]
    fn retry_in_milliseconds() {
        let event = SseEvent::new().retry(Duration::from_millis(1500));
        assert_eq!(render(&event), "retry: 1500\n\n");
    }

    #[test]
    fn empty_event_produces_nothing() {
        assert_eq!(render(&SseEvent::new()), "");
    }

    #[test]
    fn comment_block() {
        let mut buf = BytesMut::new();
        serialize_comment("ping", &mut buf);
        assert_eq!(&buf[..], b":ping\n\n");
    }

    #[test]
    fn line_breaks_stripped_from_fields() {
        let event = SseEvent::new().event("x\ny").id("1\r2");
        assert_eq!(render(&event), "event: xy\nid: 12\n\n");
    }
}
