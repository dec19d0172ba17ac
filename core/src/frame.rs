//! Length-prefixed message framing, identical to gRPC on the wire.
//!
//! Every message is prefixed by 5 bytes: a compressed flag and a big-endian
//! u32 payload length. The decoder tolerates arbitrary chunking of its input
//! and yields `(compressed, payload)` pairs.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::TripleError;

pub const FRAME_HEADER_LEN: usize = 5;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

const COMPRESSED_FLAG_MASK: u8 = 0x01;
const RESERVED_MASK: u8 = 0xfe;

/// Frame a serialized payload.
pub fn encode_frame(
    payload: &[u8], compressed: bool, max_message_size: usize,
) -> Result<Bytes, TripleError> {
    if payload.len() > max_message_size {
        return Err(TripleError::MalformedFrame(format!(
            "message of {} bytes exceeds limit of {} bytes",
            payload.len(),
            max_message_size
        )));
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(compressed as u8);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

enum DecodeState {
    Header,
    Payload,
}

/// Incremental frame decoder.
///
/// Feed it received chunks and drain with [FrameDecoder::next]. The declared
/// length is checked against `max_message_size` before the payload is
/// buffered, so an oversized frame fails fast.
pub struct FrameDecoder {
    acc: BytesMut,
    state: DecodeState,
    required: usize,
    compressed: bool,
    max_message_size: usize,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            acc: BytesMut::new(),
            state: DecodeState::Header,
            required: FRAME_HEADER_LEN,
            compressed: false,
            max_message_size,
        }
    }

    #[inline]
    pub fn feed(&mut self, chunk: &[u8]) {
        self.acc.extend_from_slice(chunk);
    }

    /// The next complete frame, or None if more input is needed.
    pub fn next(&mut self) -> Result<Option<(bool, Bytes)>, TripleError> {
        while self.acc.len() >= self.required {
            match self.state {
                DecodeState::Header => {
                    let header = self.acc.split_to(FRAME_HEADER_LEN);
                    let flag = header[0];
                    if flag & RESERVED_MASK != 0 {
                        return Err(TripleError::MalformedFrame(format!(
                            "reserved bits set in flag {:#04x}",
                            flag
                        )));
                    }
                    self.compressed = flag & COMPRESSED_FLAG_MASK != 0;
                    let len =
                        u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
                    if len > self.max_message_size {
                        return Err(TripleError::MalformedFrame(format!(
                            "declared length {} exceeds limit of {} bytes",
                            len, self.max_message_size
                        )));
                    }
                    self.required = len;
                    self.state = DecodeState::Payload;
                }
                DecodeState::Payload => {
                    let payload = self.acc.split_to(self.required).freeze();
                    self.required = FRAME_HEADER_LEN;
                    self.state = DecodeState::Header;
                    return Ok(Some((self.compressed, payload)));
                }
            }
        }
        Ok(None)
    }

    /// True when no partial frame is buffered. Checked at end of stream to
    /// catch truncated input.
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.acc.is_empty() && matches!(self.state, DecodeState::Header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(dec: &mut FrameDecoder) -> Vec<(bool, Bytes)> {
        let mut out = Vec::new();
        while let Some(f) = dec.next().expect("decode") {
            out.push(f);
        }
        out
    }

    #[test]
    fn test_round_trip() {
        let payload = b"hello, world".as_slice();
        let frame = encode_frame(payload, false, DEFAULT_MAX_MESSAGE_SIZE).expect("encode");
        assert_eq!(frame.len(), FRAME_HEADER_LEN + payload.len());

        let mut dec = FrameDecoder::new(DEFAULT_MAX_MESSAGE_SIZE);
        dec.feed(&frame);
        let frames = drain(&mut dec);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, false);
        assert_eq!(&frames[0].1[..], payload);
        assert!(dec.is_clean());
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode_frame(b"", false, DEFAULT_MAX_MESSAGE_SIZE).expect("encode");
        assert_eq!(frame.len(), FRAME_HEADER_LEN);
        let mut dec = FrameDecoder::new(DEFAULT_MAX_MESSAGE_SIZE);
        dec.feed(&frame);
        let frames = drain(&mut dec);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].1.is_empty());
    }

    #[test]
    fn test_chunked_input() {
        let mut wire = BytesMut::new();
        for i in 0..5u8 {
            let payload = vec![i; i as usize * 7];
            wire.extend_from_slice(
                &encode_frame(&payload, false, DEFAULT_MAX_MESSAGE_SIZE).unwrap(),
            );
        }
        // feed one byte at a time
        let mut dec = FrameDecoder::new(DEFAULT_MAX_MESSAGE_SIZE);
        let mut got = Vec::new();
        for b in wire.iter() {
            dec.feed(std::slice::from_ref(b));
            got.extend(drain(&mut dec));
        }
        assert_eq!(got.len(), 5);
        for (i, (compressed, payload)) in got.iter().enumerate() {
            assert!(!compressed);
            assert_eq!(payload.len(), i * 7);
        }
        assert!(dec.is_clean());
    }

    #[test]
    fn test_compressed_flag() {
        let frame = encode_frame(b"x", true, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let mut dec = FrameDecoder::new(DEFAULT_MAX_MESSAGE_SIZE);
        dec.feed(&frame);
        let frames = drain(&mut dec);
        assert!(frames[0].0);
    }

    #[test]
    fn test_size_limits() {
        let max = 64;
        assert!(encode_frame(&vec![0u8; 64], false, max).is_ok());
        assert!(matches!(
            encode_frame(&vec![0u8; 65], false, max),
            Err(TripleError::MalformedFrame(_))
        ));

        // decoder rejects the declared length before the payload arrives
        let mut dec = FrameDecoder::new(max);
        let mut header = vec![0u8];
        header.extend_from_slice(&65u32.to_be_bytes());
        dec.feed(&header);
        assert!(matches!(dec.next(), Err(TripleError::MalformedFrame(_))));

        let mut dec = FrameDecoder::new(max);
        let frame = encode_frame(&vec![7u8; 64], false, max).unwrap();
        dec.feed(&frame);
        let (_, payload) = dec.next().unwrap().expect("frame");
        assert_eq!(payload.len(), 64);
    }

    #[test]
    fn test_reserved_bits_rejected() {
        let mut dec = FrameDecoder::new(DEFAULT_MAX_MESSAGE_SIZE);
        dec.feed(&[0x02, 0, 0, 0, 0]);
        assert!(matches!(dec.next(), Err(TripleError::MalformedFrame(_))));
    }

    #[test]
    fn test_partial_frame_not_clean() {
        let frame = encode_frame(b"abcd", false, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let mut dec = FrameDecoder::new(DEFAULT_MAX_MESSAGE_SIZE);
        dec.feed(&frame[..frame.len() - 1]);
        assert!(dec.next().unwrap().is_none());
        assert!(!dec.is_clean());
    }
}
