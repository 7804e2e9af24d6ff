//! Decoders to handle different Transfer-Encodings.
//!
//! If a message body does not include a Transfer-Encoding, it *should*
//! include a Content-Length header.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::Parse;

use self::Kind::{Chunked, Length, None as NoBody};

/// Maximum amount of bytes allowed in chunked extensions.
///
/// This limit is applied for the entire body, not per chunk.
const CHUNKED_EXTENSIONS_LIMIT: u64 = 1024 * 16;

/// Maximum number of bytes allowed for all trailer fields.
const TRAILER_LIMIT: usize = 1024 * 16;

/// One step of decoding progress.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded {
    /// A run of body bytes.
    Data(Bytes),
    /// The buffer ran dry mid-message; feed more input and call again.
    Incomplete,
    /// The body is complete. Trailers, if any, were parsed and discarded.
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    /// A decoder for a `Content-Length` body.
    Length(u64),
    /// A decoder for a `Transfer-Encoding: chunked` body.
    Chunked {
        state: ChunkedState,
        chunk_len: u64,
        extensions_cnt: u64,
        trailers_cnt: usize,
        max_chunk_size: u64,
    },
    /// No body bytes expected.
    None,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ChunkedState {
    Start,
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl Decoder {
    pub(crate) fn length(x: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(x),
        }
    }

    pub(crate) fn chunked(max_chunk_size: u64) -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                state: ChunkedState::Start,
                chunk_len: 0,
                extensions_cnt: 0,
                trailers_cnt: 0,
                max_chunk_size,
            },
        }
    }

    pub(crate) fn none() -> Decoder {
        Decoder { kind: Kind::None }
    }

    pub(crate) fn is_complete(&self) -> bool {
        matches!(
            self.kind,
            Length(0)
                | Chunked {
                    state: ChunkedState::End,
                    ..
                }
                | NoBody
        )
    }

    /// Decode as much as possible from the front of `buf`.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded, Parse> {
        match self.kind {
            Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(Decoded::Complete);
                }
                if buf.is_empty() {
                    return Ok(Decoded::Incomplete);
                }
                let take = std::cmp::min(*remaining, buf.len() as u64) as usize;
                *remaining -= take as u64;
                let data = buf.split_to(take).freeze();
                Ok(Decoded::Data(data))
            }
            Chunked {
                ref mut state,
                ref mut chunk_len,
                ref mut extensions_cnt,
                ref mut trailers_cnt,
                max_chunk_size,
            } => {
                loop {
                    if *state == ChunkedState::End {
                        return Ok(Decoded::Complete);
                    }
                    let mut data = None;
                    let next = state.step(
                        buf,
                        chunk_len,
                        extensions_cnt,
                        trailers_cnt,
                        max_chunk_size,
                        &mut data,
                    )?;
                    let next = match next {
                        Some(next) => next,
                        None => return Ok(Decoded::Incomplete),
                    };
                    *state = next;
                    if let Some(data) = data {
                        return Ok(Decoded::Data(data));
                    }
                }
            }
            NoBody => Ok(Decoded::Complete),
        }
    }
}

macro_rules! byte (
    ($buf:ident) => ({
        if $buf.is_empty() {
            return Ok(None);
        }
        $buf.get_u8()
    })
);

impl ChunkedState {
    /// Advance by one state, consuming bytes from `buf`. `Ok(None)` means
    /// the buffer ran dry before the state could complete.
    fn step(
        &self,
        buf: &mut BytesMut,
        size: &mut u64,
        extensions_cnt: &mut u64,
        trailers_cnt: &mut usize,
        max_chunk_size: u64,
        data: &mut Option<Bytes>,
    ) -> Result<Option<ChunkedState>, Parse> {
        use self::ChunkedState::*;
        match *self {
            Start => ChunkedState::read_start(buf, size),
            Size => ChunkedState::read_size(buf, size),
            SizeLws => ChunkedState::read_size_lws(buf),
            Extension => ChunkedState::read_extension(buf, extensions_cnt),
            SizeLf => ChunkedState::read_size_lf(buf, *size, max_chunk_size),
            Body => ChunkedState::read_body(buf, size, data),
            BodyCr => ChunkedState::read_body_cr(buf),
            BodyLf => ChunkedState::read_body_lf(buf),
            Trailer => ChunkedState::read_trailer(buf, trailers_cnt),
            TrailerLf => ChunkedState::read_trailer_lf(buf),
            EndCr => ChunkedState::read_end_cr(buf),
            EndLf => ChunkedState::read_end_lf(buf),
            End => Ok(Some(ChunkedState::End)),
        }
    }

    fn read_start(buf: &mut BytesMut, size: &mut u64) -> Result<Option<ChunkedState>, Parse> {
        // The first character must be a hex digit: a size line such as
        // "xyz" is invalid, never silently zero.
        match byte!(buf) {
            b @ b'0'..=b'9' => *size = (b - b'0') as u64,
            b @ b'a'..=b'f' => *size = (b + 10 - b'a') as u64,
            b @ b'A'..=b'F' => *size = (b + 10 - b'A') as u64,
            _ => return Err(Parse::ChunkSize),
        }
        Ok(Some(ChunkedState::Size))
    }

    fn read_size(buf: &mut BytesMut, size: &mut u64) -> Result<Option<ChunkedState>, Parse> {
        let radix = 16;
        macro_rules! or_overflow {
            ($e:expr) => {
                match $e {
                    Some(val) => val,
                    None => return Err(Parse::ChunkTooLarge),
                }
            };
        }
        match byte!(buf) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            b'\t' | b' ' => return Ok(Some(ChunkedState::SizeLws)),
            b';' => return Ok(Some(ChunkedState::Extension)),
            b'\r' => return Ok(Some(ChunkedState::SizeLf)),
            _ => return Err(Parse::ChunkSize),
        }
        Ok(Some(ChunkedState::Size))
    }

    fn read_size_lws(buf: &mut BytesMut) -> Result<Option<ChunkedState>, Parse> {
        match byte!(buf) {
            // LWS can follow the chunk size, but no more digits can come
            b'\t' | b' ' => Ok(Some(ChunkedState::SizeLws)),
            b';' => Ok(Some(ChunkedState::Extension)),
            b'\r' => Ok(Some(ChunkedState::SizeLf)),
            _ => Err(Parse::ChunkSize),
        }
    }

    fn read_extension(
        buf: &mut BytesMut,
        extensions_cnt: &mut u64,
    ) -> Result<Option<ChunkedState>, Parse> {
        // Extensions are parsed and discarded; they end at the next CRLF.
        // A bare LF inside an extension is rejected outright.
        match byte!(buf) {
            b'\r' => Ok(Some(ChunkedState::SizeLf)),
            b'\n' => Err(Parse::ChunkSize),
            _ => {
                *extensions_cnt += 1;
                if *extensions_cnt >= CHUNKED_EXTENSIONS_LIMIT {
                    Err(Parse::ChunkSize)
                } else {
                    Ok(Some(ChunkedState::Extension))
                }
            }
        }
    }

    fn read_size_lf(
        buf: &mut BytesMut,
        size: u64,
        max_chunk_size: u64,
    ) -> Result<Option<ChunkedState>, Parse> {
        match byte!(buf) {
            b'\n' if size == 0 => Ok(Some(ChunkedState::EndCr)),
            b'\n' => {
                if size > max_chunk_size {
                    return Err(Parse::ChunkTooLarge);
                }
                Ok(Some(ChunkedState::Body))
            }
            _ => Err(Parse::ChunkSize),
        }
    }

    fn read_body(
        buf: &mut BytesMut,
        rem: &mut u64,
        data: &mut Option<Bytes>,
    ) -> Result<Option<ChunkedState>, Parse> {
        if buf.is_empty() {
            return Ok(None);
        }
        let take = std::cmp::min(*rem, buf.len() as u64) as usize;
        *data = Some(buf.split_to(take).freeze());
        *rem -= take as u64;
        if *rem > 0 {
            Ok(Some(ChunkedState::Body))
        } else {
            Ok(Some(ChunkedState::BodyCr))
        }
    }

    fn read_body_cr(buf: &mut BytesMut) -> Result<Option<ChunkedState>, Parse> {
        match byte!(buf) {
            b'\r' => Ok(Some(ChunkedState::BodyLf)),
            _ => Err(Parse::ChunkSize),
        }
    }

    fn read_body_lf(buf: &mut BytesMut) -> Result<Option<ChunkedState>, Parse> {
        match byte!(buf) {
            b'\n' => Ok(Some(ChunkedState::Start)),
            _ => Err(Parse::ChunkSize),
        }
    }

    fn read_trailer(
        buf: &mut BytesMut,
        trailers_cnt: &mut usize,
    ) -> Result<Option<ChunkedState>, Parse> {
        // Trailer fields are consumed but not surfaced.
        *trailers_cnt += 1;
        if *trailers_cnt >= TRAILER_LIMIT {
            return Err(Parse::TooLarge);
        }
        match byte!(buf) {
            b'\r' => Ok(Some(ChunkedState::TrailerLf)),
            _ => Ok(Some(ChunkedState::Trailer)),
        }
    }

    fn read_trailer_lf(buf: &mut BytesMut) -> Result<Option<ChunkedState>, Parse> {
        match byte!(buf) {
            b'\n' => Ok(Some(ChunkedState::EndCr)),
            _ => Err(Parse::ChunkSize),
        }
    }

    fn read_end_cr(buf: &mut BytesMut) -> Result<Option<ChunkedState>, Parse> {
        match byte!(buf) {
            b'\r' => Ok(Some(ChunkedState::EndLf)),
            byte => {
                // Not the final CRLF: a trailer field begins with this byte.
                let _ = byte;
                Ok(Some(ChunkedState::Trailer))
            }
        }
    }

    fn read_end_lf(buf: &mut BytesMut) -> Result<Option<ChunkedState>, Parse> {
        match byte!(buf) {
            b'\n' => Ok(Some(ChunkedState::End)),
            _ => Err(Parse::ChunkSize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut Decoder, input: &[u8]) -> Result<Vec<u8>, Parse> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        loop {
            match decoder.decode(&mut buf)? {
                Decoded::Data(d) => out.extend_from_slice(&d),
                Decoded::Complete => return Ok(out),
                Decoded::Incomplete => panic!("input ended early"),
            }
        }
    }

    #[test]
    fn length_decoder_exact() {
        let mut decoder = Decoder::length(11);
        let out = drain(&mut decoder, b"hello=world").unwrap();
        assert_eq!(out, b"hello=world");
        assert!(decoder.is_complete());
    }

    #[test]
    fn length_decoder_incremental() {
        let mut decoder = Decoder::length(5);
        let mut buf = BytesMut::from(&b"he"[..]);
        matches::assert_matches!(decoder.decode(&mut buf).unwrap(), Decoded::Data(_));
        matches::assert_matches!(decoder.decode(&mut buf).unwrap(), Decoded::Incomplete);
        buf.extend_from_slice(b"llo");
        matches::assert_matches!(decoder.decode(&mut buf).unwrap(), Decoded::Data(_));
        matches::assert_matches!(decoder.decode(&mut buf).unwrap(), Decoded::Complete);
    }

    #[test]
    fn chunked_roundtrip() {
        let mut decoder = Decoder::chunked(u64::MAX);
        let out = drain(&mut decoder, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"Wikipedia");
    }

    #[test]
    fn chunked_extension_discarded() {
        let mut decoder = Decoder::chunked(u64::MAX);
        let out = drain(&mut decoder, b"4;name=value\r\nWiki\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"Wiki");
    }

    #[test]
    fn chunked_trailers_discarded() {
        let mut decoder = Decoder::chunked(u64::MAX);
        let out = drain(
            &mut decoder,
            b"4\r\nWiki\r\n0\r\nExpires: never\r\nx-checksum: 1\r\n\r\n",
        )
        .unwrap();
        assert_eq!(out, b"Wiki");
    }

    #[test]
    fn non_hex_chunk_size_rejected() {
        // "xyz" is not silently treated as zero
        let mut decoder = Decoder::chunked(u64::MAX);
        let mut buf = BytesMut::from(&b"xyz\r\nWiki\r\n0\r\n\r\n"[..]);
        matches::assert_matches!(decoder.decode(&mut buf).unwrap_err(), Parse::ChunkSize);
    }

    #[test]
    fn one_bad_digit_spoils_the_size() {
        let mut decoder = Decoder::chunked(u64::MAX);
        let mut buf = BytesMut::from(&b"4q\r\nWiki\r\n0\r\n\r\n"[..]);
        matches::assert_matches!(decoder.decode(&mut buf).unwrap_err(), Parse::ChunkSize);
    }

    #[test]
    fn chunk_over_limit_rejected() {
        let mut decoder = Decoder::chunked(16);
        let mut buf = BytesMut::from(&b"11\r\n0123456789abcdef!\r\n0\r\n\r\n"[..]);
        matches::assert_matches!(
            decoder.decode(&mut buf).unwrap_err(),
            Parse::ChunkTooLarge
        );
    }

    #[test]
    fn chunk_size_overflow_rejected() {
        let mut decoder = Decoder::chunked(u64::MAX);
        let mut buf = BytesMut::from(&b"ffffffffffffffff0\r\n"[..]);
        matches::assert_matches!(
            decoder.decode(&mut buf).unwrap_err(),
            Parse::ChunkTooLarge
        );
    }

    #[test]
    fn missing_body_crlf_rejected() {
        let mut decoder = Decoder::chunked(u64::MAX);
        let mut buf = BytesMut::from(&b"4\r\nWikiX\r\n0\r\n\r\n"[..]);
        let mut saw_err = false;
        for _ in 0..8 {
            match decoder.decode(&mut buf) {
                Ok(Decoded::Data(_)) => continue,
                Ok(_) => break,
                Err(e) => {
                    matches::assert_matches!(e, Parse::ChunkSize);
                    saw_err = true;
                    break;
                }
            }
        }
        assert!(saw_err);
    }

    #[test]
    fn chunked_incremental_feeding() {
        let mut decoder = Decoder::chunked(u64::MAX);
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for &byte in b"4\r\nWiki\r\n0\r\n\r\n".iter() {
            buf.extend_from_slice(&[byte]);
            loop {
                match decoder.decode(&mut buf).unwrap() {
                    Decoded::Data(d) => out.extend_from_slice(&d),
                    Decoded::Incomplete => break,
                    Decoded::Complete => {
                        assert_eq!(out, b"Wiki");
                        return;
                    }
                }
            }
        }
        panic!("never completed");
    }

    #[test]
    fn empty_body_is_complete() {
        let mut decoder = Decoder::none();
        let mut buf = BytesMut::new();
        assert_eq!(decoder.decode(&mut buf).unwrap(), Decoded::Complete);
        assert!(decoder.is_complete());
    }
}
