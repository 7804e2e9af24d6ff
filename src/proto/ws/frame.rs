//! RFC 6455 frame parsing and serialization.
//!
//! The parser is incremental over a byte buffer and returns complete,
//! unmasked frames. The writer produces server-to-client frames, which
//! are never masked.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Ws};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_u8(n: u8) -> Option<OpCode> {
        match n {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub(crate) fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// One parsed, unmasked frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) fin: bool,
    pub(crate) opcode: OpCode,
    pub(crate) payload: Bytes,
}

/// Try to parse one client frame off the front of `buf`.
///
/// `Ok(None)` means more bytes are needed. Violations (reserved bits, bad
/// opcodes, unmasked client frames, oversized control frames) are protocol
/// errors that end the session with close code 1002.
pub(crate) fn parse_frame(
    buf: &mut BytesMut,
    max_payload: u64,
) -> crate::Result<Option<Frame>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let b0 = buf[0];
    let b1 = buf[1];

    let fin = b0 & 0x80 != 0;
    if b0 & 0x70 != 0 {
        // No extensions are negotiated, so RSV must be zero.
        return Err(Error::new_ws(Ws::BadFrame));
    }
    let opcode = OpCode::from_u8(b0 & 0x0F).ok_or_else(|| Error::new_ws(Ws::BadFrame))?;
    let masked = b1 & 0x80 != 0;
    if !masked {
        // Client-to-server frames must be masked.
        return Err(Error::new_ws(Ws::BadFrame));
    }

    let mut header_len = 2usize;
    let base_len = (b1 & 0x7F) as u64;
    let payload_len = match base_len {
        126 => {
            header_len += 2;
            if buf.len() < header_len {
                return Ok(None);
            }
            u16::from_be_bytes([buf[2], buf[3]]) as u64
        }
        127 => {
            header_len += 8;
            if buf.len() < header_len {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(Error::new_ws(Ws::BadFrame));
            }
            len
        }
        n => n,
    };

    if opcode.is_control() && (!fin || payload_len > 125) {
        // Control frames may not be fragmented or carry long payloads.
        return Err(Error::new_ws(Ws::BadFrame));
    }
    if payload_len > max_payload {
        return Err(Error::new_ws(Ws::BadFrame));
    }

    let mask_at = header_len;
    header_len += 4;
    let total = header_len as u64 + payload_len;
    if (buf.len() as u64) < total {
        return Ok(None);
    }

    let mut mask = [0u8; 4];
    mask.copy_from_slice(&buf[mask_at..mask_at + 4]);

    buf.advance(header_len);
    let mut payload = buf.split_to(payload_len as usize);
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }

    Ok(Some(Frame {
        fin,
        opcode,
        payload: payload.freeze(),
    }))
}

/// Serialize one server frame. Server-to-client frames carry no mask and
/// are never fragmented.
pub(crate) fn write_frame(opcode: OpCode, payload: &[u8], buf: &mut BytesMut) {
    buf.put_u8(0x80 | opcode.as_u8());
    let len = payload.len();
    if len < 126 {
        buf.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(127);
        buf.put_u64(len as u64);
    }
    buf.extend_from_slice(payload);
}

/// Serialize a close frame with a code and UTF-8 reason.
pub(crate) fn write_close(code: u16, reason: &str, buf: &mut BytesMut) {
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(code);
    // control payloads are capped at 125 bytes; trim the reason to fit
    let reason = if reason.len() > 123 {
        let mut end = 123;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        &reason[..end]
    } else {
        reason
    };
    payload.extend_from_slice(reason.as_bytes());
    write_frame(OpCode::Close, &payload, buf);
}

/// Whether a peer close code is legal on the wire. 1005/1006/1015 are
/// reserved for local use, 1004 and 1012–1014 are not sendable, and
/// anything below 1000 is undefined.
pub(crate) fn close_code_legal(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// Decode a peer close payload into `(code, reason)`.
///
/// Empty payloads mean 1005 (no status present) which is reported to the
/// app as 1000-equivalent per the event contract; a 1-byte payload is a
/// protocol error; an illegal code is a protocol error; an invalid UTF-8
/// reason is a 1007.
pub(crate) fn parse_close(payload: &Bytes) -> crate::Result<(u16, String)> {
    match payload.len() {
        0 => Ok((1000, String::new())),
        1 => Err(Error::new_ws(Ws::BadCloseFrame)),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !close_code_legal(code) {
                return Err(Error::new_ws(Ws::BadCloseFrame));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| Error::new_ws(Ws::InvalidUtf8))?;
            Ok((code, reason.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked(opcode: u8, fin: bool, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(if fin { 0x80 | opcode } else { opcode });
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let len = payload.len();
        if len < 126 {
            buf.put_u8(0x80 | len as u8);
        } else if len <= u16::MAX as usize {
            buf.put_u8(0x80 | 126);
            buf.put_u16(len as u16);
        } else {
            buf.put_u8(0x80 | 127);
            buf.put_u64(len as u64);
        }
        buf.extend_from_slice(&mask);
        for (i, b) in payload.iter().enumerate() {
            buf.put_u8(b ^ mask[i & 3]);
        }
        buf
    }

    #[test]
    fn parses_masked_text_frame() {
        let mut buf = masked(0x1, true, b"hello");
        let frame = parse_frame(&mut buf, u64::MAX).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_needs_more() {
        let full = masked(0x2, true, b"abcdef");
        let mut buf = BytesMut::from(&full[..4]);
        assert!(parse_frame(&mut buf, u64::MAX).unwrap().is_none());
    }

    #[test]
    fn extended_16bit_length() {
        let payload = vec![0xABu8; 300];
        let mut buf = masked(0x2, true, &payload);
        let frame = parse_frame(&mut buf, u64::MAX).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 300);
    }

    #[test]
    fn unmasked_client_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x81);
        buf.put_u8(0x05); // no mask bit
        buf.extend_from_slice(b"hello");
        assert!(parse_frame(&mut buf, u64::MAX).unwrap_err().is_ws());
    }

    #[test]
    fn reserved_bits_rejected() {
        let mut buf = masked(0x1, true, b"x");
        buf[0] |= 0x40;
        assert!(parse_frame(&mut buf, u64::MAX).unwrap_err().is_ws());
    }

    #[test]
    fn fragmented_control_frame_rejected() {
        let mut buf = masked(0x9, false, b"");
        assert!(parse_frame(&mut buf, u64::MAX).unwrap_err().is_ws());
    }

    #[test]
    fn oversized_control_frame_rejected() {
        let payload = vec![0u8; 126];
        let mut buf = masked(0x9, true, &payload);
        assert!(parse_frame(&mut buf, u64::MAX).unwrap_err().is_ws());
    }

    #[test]
    fn server_frames_are_never_masked() {
        let mut buf = BytesMut::new();
        write_frame(OpCode::Text, b"hi", &mut buf);
        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1] & 0x80, 0, "mask bit must not be set");
        assert_eq!(&buf[2..], b"hi");
    }

    #[test]
    fn close_frame_roundtrip() {
        let mut buf = BytesMut::new();
        write_close(1000, "done", &mut buf);
        assert_eq!(buf[0], 0x88);
        assert_eq!(buf[1], 6);
        assert_eq!(&buf[2..4], &1000u16.to_be_bytes());
        assert_eq!(&buf[4..], b"done");
    }

    #[test]
    fn one_byte_close_payload_is_protocol_error() {
        let payload = Bytes::from_static(&[0x03]);
        assert_eq!(parse_close(&payload).unwrap_err().ws_close_code(), 1002);
    }

    #[test]
    fn reserved_close_codes_are_protocol_errors() {
        for code in [999u16, 1005, 1006, 1015, 1012, 1013, 1014, 1004] {
            let payload = Bytes::copy_from_slice(&code.to_be_bytes());
            assert_eq!(
                parse_close(&payload).unwrap_err().ws_close_code(),
                1002,
                "code {} must be illegal",
                code
            );
        }
        for code in [1000u16, 1001, 1003, 1007, 1011, 3000, 4999] {
            let payload = Bytes::copy_from_slice(&code.to_be_bytes());
            assert!(parse_close(&payload).is_ok(), "code {} must be legal", code);
        }
    }

    #[test]
    fn invalid_utf8_close_reason_is_1007() {
        let mut payload = BytesMut::new();
        payload.put_u16(1000);
        payload.extend_from_slice(&[0xFF, 0xFE]);
        assert_eq!(
            parse_close(&payload.freeze()).unwrap_err().ws_close_code(),
            1007
        );
    }

    #[test]
    fn empty_close_payload_defaults_to_1000() {
        assert_eq!(parse_close(&Bytes::new()).unwrap(), (1000, String::new()));
    }
}
