// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing codec for the runner protocol (ch. 4.2).
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B LE) | Message payload   |
//! +----------------+-------------------+
//! ```
//!
//! Unlike the big-endian framing convention elsewhere in the ecosystem,
//! this protocol's length prefix (and every other integer on the wire) is
//! little-endian, per ch. 6.

use std::io::{self, Read};

pub const FRAME_HEADER_SIZE: usize = 4;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum ReadState {
    ReadingLength { bytes_read: usize },
    ReadingBody { expected_len: usize, bytes_read: usize },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingLength { bytes_read: 0 }
    }
}

/// Incremental decoder for one connection's byte stream. Retains partial
/// read state across calls so it can be driven from a blocking socket
/// with a read timeout: a timeout surfaces as `Ok(None)` and the caller
/// simply calls `decode` again on the next wake-up.
#[derive(Debug)]
pub struct FrameCodec {
    state: ReadState,
    buffer: Vec<u8>,
    max_size: usize,
    frames_decoded: u64,
    bytes_decoded: u64,
}

impl FrameCodec {
    pub fn new(max_size: usize) -> Self {
        FrameCodec {
            state: ReadState::default(),
            buffer: vec![0u8; FRAME_HEADER_SIZE],
            max_size,
            frames_decoded: 0,
            bytes_decoded: 0,
        }
    }

    pub fn with_default_max() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    pub fn reset(&mut self) {
        self.state = ReadState::default();
        self.buffer.resize(FRAME_HEADER_SIZE, 0);
    }

    pub fn is_partial(&self) -> bool {
        match self.state {
            ReadState::ReadingLength { bytes_read } => bytes_read > 0,
            ReadState::ReadingBody { .. } => true,
        }
    }

    /// `[length: u32 LE][payload]`
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        Self::encode_into(payload, &mut frame);
        frame
    }

    pub fn encode_into(payload: &[u8], buf: &mut Vec<u8>) {
        let len = payload.len() as u32;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(payload);
    }

    /// Try to decode one complete message from `reader`.
    ///
    /// `Ok(Some(data))` - a full message was decoded.
    /// `Ok(None)` - the read timed out / would block; call again later.
    /// `Err(e)` - I/O error, oversized frame, or a clean/partial EOF.
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                ReadState::ReadingLength { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..FRAME_HEADER_SIZE]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                if bytes_read == 0 {
                                    "connection closed"
                                } else {
                                    "incomplete frame header"
                                },
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < FRAME_HEADER_SIZE {
                                self.state = ReadState::ReadingLength { bytes_read: total };
                                continue;
                            }
                            let len = u32::from_le_bytes([
                                self.buffer[0],
                                self.buffer[1],
                                self.buffer[2],
                                self.buffer[3],
                            ]) as usize;
                            if len > self.max_size {
                                self.state = ReadState::default();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("frame too large: {len} bytes (max {})", self.max_size),
                                ));
                            }
                            if len == 0 {
                                self.frames_decoded += 1;
                                self.state = ReadState::default();
                                return Ok(Some(Vec::new()));
                            }
                            self.buffer.resize(len, 0);
                            self.state = ReadState::ReadingBody { expected_len: len, bytes_read: 0 };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                            self.state = ReadState::ReadingLength { bytes_read };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                ReadState::ReadingBody { expected_len, bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..expected_len]) {
                        Ok(0) => {
                            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "incomplete frame body"));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < expected_len {
                                self.state = ReadState::ReadingBody { expected_len, bytes_read: total };
                                continue;
                            }
                            let message = self.buffer[..expected_len].to_vec();
                            self.frames_decoded += 1;
                            self.bytes_decoded += expected_len as u64;
                            self.buffer.resize(FRAME_HEADER_SIZE, 0);
                            self.state = ReadState::default();
                            return Ok(Some(message));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                            self.state = ReadState::ReadingBody { expected_len, bytes_read };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encode_uses_little_endian_length() {
        let frame = FrameCodec::encode(b"hello");
        assert_eq!(&frame[..4], &5u32.to_le_bytes());
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn decode_roundtrips_various_sizes() {
        for size in [0usize, 1, 100, 65535, 200_000] {
            let mut codec = FrameCodec::new(1024 * 1024);
            let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
            let frame = FrameCodec::encode(&payload);
            let mut cursor = Cursor::new(frame);
            let decoded = codec.decode(&mut cursor).unwrap().unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn decode_multiple_messages_in_sequence() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = Vec::new();
        FrameCodec::encode_into(b"first", &mut buf);
        FrameCodec::encode_into(b"second", &mut buf);
        let mut cursor = Cursor::new(buf);
        assert_eq!(codec.decode(&mut cursor).unwrap(), Some(b"first".to_vec()));
        assert_eq!(codec.decode(&mut cursor).unwrap(), Some(b"second".to_vec()));
        assert_eq!(codec.frames_decoded(), 2);
    }

    #[test]
    fn decode_rejects_oversized_frame() {
        let mut codec = FrameCodec::new(10);
        let frame = FrameCodec::encode(b"this message is way too long for the limit");
        let mut cursor = Cursor::new(frame);
        let err = codec.decode(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn decode_partial_header_is_eof_error() {
        let mut codec = FrameCodec::new(1024);
        let frame = FrameCodec::encode(b"hello");
        let mut cursor = Cursor::new(&frame[..2]);
        assert!(codec.decode(&mut cursor).is_err());
    }

    #[test]
    fn reset_clears_partial_state() {
        let mut codec = FrameCodec::new(1024);
        let frame = FrameCodec::encode(b"hello");
        let mut cursor = Cursor::new(&frame[..2]);
        let _ = codec.decode(&mut cursor);
        assert!(codec.is_partial());
        codec.reset();
        assert!(!codec.is_partial());
    }
}
