//! Connect-protocol envelope framing.
//!
//! Every message on a streaming call is prefixed with a 5-byte header:
//! one flags byte followed by the payload length as a big-endian `u32`.
//! Transport chunks do not respect these boundaries, so the decoder keeps
//! a receive buffer and only yields frames once they are complete.

use crate::error::SandgateError;

/// Size of the flags + length prefix.
pub const HEADER_LEN: usize = 5;

/// Payload is compressed with the negotiated encoding.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Frame terminates the stream; its payload is trailer metadata.
pub const FLAG_END_STREAM: u8 = 0x02;

/// Frames larger than this are treated as a framing violation.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// A single decoded frame borrowing from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub flags: u8,
    pub payload: &'a [u8],
}

impl Envelope<'_> {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

/// Outcome of attempting to strip one frame off the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    Frame {
        envelope: Envelope<'a>,
        rest: &'a [u8],
    },
    NeedMoreData,
}

/// Frame an outbound message. Flags are always zero: identity encoding,
/// never an end-of-stream marker.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    encode_with_flags(0, payload)
}

pub(crate) fn encode_with_flags(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(flags);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Strip one complete frame from the front of `buf`, leaving it untouched
/// if the header or payload is still incomplete.
pub fn try_decode_one(buf: &[u8]) -> Decoded<'_> {
    if buf.len() < HEADER_LEN {
        return Decoded::NeedMoreData;
    }
    let len = declared_len(buf);
    if buf.len() < HEADER_LEN + len {
        return Decoded::NeedMoreData;
    }
    let (frame, rest) = buf.split_at(HEADER_LEN + len);
    Decoded::Frame {
        envelope: Envelope {
            flags: frame[0],
            payload: &frame[HEADER_LEN..],
        },
        rest,
    }
}

fn declared_len(buf: &[u8]) -> usize {
    u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize
}

/// An owned frame handed out by [`EnvelopeDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

/// Incremental decoder over a chunked byte stream.
#[derive(Debug, Default)]
pub struct EnvelopeDecoder {
    buf: Vec<u8>,
    violation: Option<String>,
}

impl EnvelopeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transport chunk to the receive buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Decode every complete frame currently buffered, in order.
    ///
    /// A header declaring an impossible length means the framing is lost:
    /// the rest of the buffer is discarded so the caller can keep reading.
    /// Frames complete before the bad header are still returned; the
    /// violation is kept for [`take_violation`](Self::take_violation).
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut consumed = 0;

        loop {
            let remaining = &self.buf[consumed..];
            if remaining.len() >= HEADER_LEN && declared_len(remaining) > MAX_PAYLOAD_LEN {
                self.violation = Some(format!(
                    "frame declares {} bytes (limit {})",
                    declared_len(remaining),
                    MAX_PAYLOAD_LEN
                ));
                consumed = self.buf.len();
                break;
            }

            match try_decode_one(remaining) {
                Decoded::Frame { envelope, rest } => {
                    consumed = self.buf.len() - rest.len();
                    frames.push(Frame {
                        flags: envelope.flags,
                        payload: envelope.payload.to_vec(),
                    });
                }
                Decoded::NeedMoreData => break,
            }
        }

        self.buf.drain(..consumed);
        frames
    }

    /// The most recent framing violation, if one happened since the last call.
    pub fn take_violation(&mut self) -> Option<SandgateError> {
        self.violation.take().map(SandgateError::MalformedStream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(payloads: &[&[u8]]) -> Vec<u8> {
        payloads.iter().flat_map(|p| encode(p)).collect()
    }

    #[test]
    fn test_encode_header() {
        let framed = encode(b"{\"a\":1}");
        assert_eq!(&framed[..5], &[0, 0, 0, 0, 7]);
        assert_eq!(&framed[5..], b"{\"a\":1}");
    }

    #[test]
    fn test_round_trip() {
        let payloads: [&[u8]; 4] = [b"", b"x", b"{\"process\":{}}", &[0xffu8; 300]];
        for payload in payloads {
            let framed = encode(payload);
            match try_decode_one(&framed) {
                Decoded::Frame { envelope, rest } => {
                    assert_eq!(envelope.flags, 0);
                    assert_eq!(envelope.payload, payload);
                    assert_eq!(envelope.payload.len(), payload.len());
                    assert!(rest.is_empty());
                }
                Decoded::NeedMoreData => panic!("complete frame not decoded"),
            }
        }
    }

    #[test]
    fn test_incomplete_header_and_payload() {
        let framed = encode(b"hello");
        assert_eq!(try_decode_one(&framed[..3]), Decoded::NeedMoreData);
        assert_eq!(try_decode_one(&framed[..7]), Decoded::NeedMoreData);
        assert_eq!(try_decode_one(&[]), Decoded::NeedMoreData);
    }

    #[test]
    fn test_remainder_returned() {
        let mut bytes = encode(b"one");
        bytes.extend_from_slice(&encode(b"two")[..4]);
        match try_decode_one(&bytes) {
            Decoded::Frame { envelope, rest } => {
                assert_eq!(envelope.payload, b"one");
                assert_eq!(rest.len(), 4);
            }
            Decoded::NeedMoreData => panic!("expected a frame"),
        }
    }

    #[test]
    fn test_end_stream_flag() {
        let framed = encode_with_flags(FLAG_END_STREAM, b"{}");
        match try_decode_one(&framed) {
            Decoded::Frame { envelope, .. } => {
                assert!(envelope.is_end_stream());
                assert!(!envelope.is_compressed());
            }
            Decoded::NeedMoreData => panic!("expected a frame"),
        }
    }

    #[test]
    fn test_every_split_point_yields_same_frames() {
        let payloads: [&[u8]; 4] = [b"{\"event\":{\"start\":{}}}", b"", b"abc", &[7u8; 40]];
        let bytes = stream_of(&payloads);

        for split in 0..=bytes.len() {
            let mut decoder = EnvelopeDecoder::new();
            let mut frames = Vec::new();
            decoder.push(&bytes[..split]);
            frames.extend(decoder.drain_frames());
            decoder.push(&bytes[split..]);
            frames.extend(decoder.drain_frames());

            assert_eq!(frames.len(), payloads.len(), "split at {}", split);
            for (frame, payload) in frames.iter().zip(payloads.iter()) {
                assert_eq!(frame.payload, *payload);
            }
            assert_eq!(decoder.pending(), 0);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let payloads: [&[u8]; 3] = [b"first", b"second", b"third"];
        let bytes = stream_of(&payloads);
        let mut decoder = EnvelopeDecoder::new();
        let mut frames = Vec::new();
        for b in &bytes {
            decoder.push(std::slice::from_ref(b));
            frames.extend(decoder.drain_frames());
        }
        let got: Vec<&[u8]> = frames.iter().map(|f| f.payload.as_slice()).collect();
        assert_eq!(got, payloads);
    }

    #[test]
    fn test_oversized_frame_is_malformed() {
        let mut decoder = EnvelopeDecoder::new();
        decoder.push(&[0, 0xff, 0xff, 0xff, 0xff, 1, 2, 3]);
        assert!(decoder.drain_frames().is_empty());
        assert!(matches!(
            decoder.take_violation(),
            Some(SandgateError::MalformedStream(_))
        ));
        assert!(decoder.take_violation().is_none());
        assert_eq!(decoder.pending(), 0);

        // Decoding resumes with whatever arrives next
        decoder.push(&encode(b"after"));
        let frames = decoder.drain_frames();
        assert_eq!(frames[0].payload, b"after");
    }

    #[test]
    fn test_good_frames_survive_a_later_violation() {
        let mut decoder = EnvelopeDecoder::new();
        decoder.push(&encode(b"ok"));
        decoder.push(&[0, 0xff, 0xff, 0xff, 0xff]);
        let frames = decoder.drain_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.pending(), 0);
        assert!(decoder.take_violation().is_some());

        // The next chunk decodes in the same call that follows the violation
        decoder.push(&encode(b"next"));
        let frames = decoder.drain_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"next");
        assert!(decoder.take_violation().is_none());
    }
}
