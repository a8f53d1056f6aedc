//! Reassembles the runtime's combined stdout/stderr stream into frames.
//!
//! Wire format, repeated back to back:
//!
//! ```text
//! [0..4)  stream channel, u32 big-endian
//! [4..8)  payload length, u32 big-endian
//! [8..)   payload, exactly `length` bytes
//! ```
//!
//! Chunks arrive at arbitrary boundaries, so parse state survives between
//! calls to [`FrameDemuxer::push`]. A payload is only ever emitted whole.
//! Zero-length frames are emitted too; relays decide whether an empty
//! payload is worth sending.

use bytes::{Buf, Bytes, BytesMut};

pub const HEADER_LEN: usize = 8;

/// One complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Which output channel produced the frame (1 = stdout, 2 = stderr on
    /// Docker). Carried for logging only.
    pub channel: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemuxState {
    AwaitingHeader,
    AwaitingPayload { channel: u32, len: usize },
}

#[derive(Debug)]
pub struct FrameDemuxer {
    state: DemuxState,
    buffer: BytesMut,
}

impl Default for FrameDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDemuxer {
    pub fn new() -> Self {
        Self {
            state: DemuxState::AwaitingHeader,
            buffer: BytesMut::new(),
        }
    }

    /// Append `chunk` and return every frame it completes, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        self.feed(chunk, |frame| frames.push(frame));
        frames
    }

    /// Append `chunk` and hand each completed frame to `emit` as soon as its
    /// last byte is buffered.
    pub fn feed(&mut self, chunk: &[u8], mut emit: impl FnMut(Frame)) {
        self.buffer.extend_from_slice(chunk);

        loop {
            match self.state {
                DemuxState::AwaitingHeader => {
                    if self.buffer.len() < HEADER_LEN {
                        break;
                    }
                    let channel = self.buffer.get_u32();
                    let len = self.buffer.get_u32() as usize;
                    self.state = DemuxState::AwaitingPayload { channel, len };
                }
                DemuxState::AwaitingPayload { channel, len } => {
                    if self.buffer.len() < len {
                        break;
                    }
                    let payload = self.buffer.split_to(len).freeze();
                    self.state = DemuxState::AwaitingHeader;
                    emit(Frame { channel, payload });
                }
            }
        }
    }

    /// Bytes buffered but not yet part of an emitted frame (header bytes of
    /// an already-parsed header are not counted).
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no partial header or payload is outstanding.
    pub fn is_idle(&self) -> bool {
        self.state == DemuxState::AwaitingHeader && self.buffer.is_empty()
    }
}

/// Encode one frame in the runtime's wire format.
#[cfg(test)]
pub fn encode_frame(channel: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&channel.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(frames: &[Frame]) -> Vec<Vec<u8>> {
        frames.iter().map(|f| f.payload.to_vec()).collect()
    }

    #[test]
    fn single_chunk_with_three_frames() {
        let big = vec![b'z'; 130];
        let mut stream = encode_frame(1, b"");
        stream.extend(encode_frame(1, b"hello"));
        stream.extend(encode_frame(2, &big));

        let mut demux = FrameDemuxer::new();
        let frames = demux.push(&stream);

        assert_eq!(payloads(&frames), vec![Vec::new(), b"hello".to_vec(), big]);
        assert_eq!(frames[1].channel, 1);
        assert_eq!(frames[2].channel, 2);
        assert!(demux.is_idle());
    }

    #[test]
    fn header_split_across_chunks() {
        let stream = encode_frame(1, b"abc");
        let mut demux = FrameDemuxer::new();

        assert!(demux.push(&stream[..3]).is_empty());
        assert!(demux.push(&stream[3..7]).is_empty());
        assert_eq!(demux.pending_len(), 7);
        let frames = demux.push(&stream[7..]);
        assert_eq!(payloads(&frames), vec![b"abc".to_vec()]);
        assert!(demux.is_idle());
    }

    #[test]
    fn payload_split_across_chunks() {
        let stream = encode_frame(2, b"split payload");
        let mut demux = FrameDemuxer::new();

        assert!(demux.push(&stream[..10]).is_empty());
        assert!(!demux.is_idle());
        let frames = demux.push(&stream[10..]);
        assert_eq!(payloads(&frames), vec![b"split payload".to_vec()]);
    }

    #[test]
    fn many_zero_length_frames_do_not_recurse() {
        let mut stream = Vec::new();
        for _ in 0..100_000 {
            stream.extend(encode_frame(1, b""));
        }
        stream.extend(encode_frame(1, b"end"));

        let mut demux = FrameDemuxer::new();
        let frames = demux.push(&stream);
        assert_eq!(frames.len(), 100_001);
        assert!(frames[..100_000].iter().all(|f| f.payload.is_empty()));
        assert_eq!(frames[100_000].payload.as_ref(), b"end");
    }

    #[test]
    fn trailing_partial_frame_is_kept() {
        let mut stream = encode_frame(1, b"one");
        let second = encode_frame(1, b"two");
        stream.extend_from_slice(&second[..9]);

        let mut demux = FrameDemuxer::new();
        let frames = demux.push(&stream);
        assert_eq!(payloads(&frames), vec![b"one".to_vec()]);

        let frames = demux.push(&second[9..]);
        assert_eq!(payloads(&frames), vec![b"two".to_vec()]);
    }

    #[test]
    fn arbitrary_chunking_reproduces_payloads() {
        // Deterministic xorshift so the test is reproducible.
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        let mut expected = Vec::new();
        let mut stream = Vec::new();
        for i in 0..200 {
            let len = (next() % 300) as usize;
            let payload: Vec<u8> = (0..len).map(|j| (i + j) as u8).collect();
            let channel = (next() % 3) as u32;
            stream.extend(encode_frame(channel, &payload));
            expected.push(payload);
        }

        for max_chunk in [1usize, 2, 7, 8, 9, 64, 4096] {
            let mut demux = FrameDemuxer::new();
            let mut got = Vec::new();
            let mut offset = 0;
            while offset < stream.len() {
                let take = 1 + (next() as usize % max_chunk);
                let end = (offset + take).min(stream.len());
                demux.feed(&stream[offset..end], |f| got.push(f.payload.to_vec()));
                offset = end;
            }
            assert_eq!(got, expected, "max_chunk = {max_chunk}");
            assert!(demux.is_idle());
        }
    }
}
