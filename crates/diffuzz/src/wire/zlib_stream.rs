// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistent zlib stream compression for the wire protocol (ch. 4.2).
//!
//! Client-to-server traffic is always compressed; server-to-client is
//! compressed only when `BuildFlags::compress_recv` is set. Either way one
//! `Compress`/`Decompress` instance lives for the connection's whole
//! lifetime: the deflate dictionary carries over between messages, which
//! is why this sits below `FrameCodec` rather than per-frame — each call
//! flushes with `Flush::Sync` so the peer can decode everything written so
//! far without waiting for the stream to close.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::WireError;

/// Wraps a long-lived `Compress` state, one per connection.
pub struct ZlibSender {
    compress: Compress,
}

impl ZlibSender {
    pub fn new() -> Self {
        ZlibSender {
            compress: Compress::new(Compression::default(), true),
        }
    }

    /// Compress `input`, flushing so the result is a complete, independently
    /// decodable unit while keeping the dictionary alive for the next call.
    pub fn compress_message(&mut self, input: &[u8]) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(input.len() / 2 + 32);
        let before_in = self.compress.total_in();
        let mut offset = 0usize;
        loop {
            let consumed_before = self.compress.total_in() - before_in;
            let remaining_in = &input[consumed_before as usize..];
            let status = self
                .compress
                .compress_vec(remaining_in, &mut out, FlushCompress::Sync)
                .map_err(|e| WireError::Zlib(e.to_string()))?;
            let consumed_now = self.compress.total_in() - before_in;
            offset = consumed_now as usize;
            match status {
                Status::Ok | Status::BufError if offset >= input.len() => break,
                Status::StreamEnd => break,
                _ if offset >= input.len() => break,
                _ => continue,
            }
        }
        let _ = offset;
        Ok(out)
    }
}

impl Default for ZlibSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a long-lived `Decompress` state, one per connection (ch. 4.2: "a
/// single decompressor instance handles the client's lifetime").
pub struct ZlibReceiver {
    decompress: Decompress,
}

impl ZlibReceiver {
    pub fn new() -> Self {
        ZlibReceiver {
            decompress: Decompress::new(true),
        }
    }

    /// Feed a chunk of compressed bytes (as produced by one `compress_message`
    /// call on the peer) and return everything it expands to.
    pub fn decompress_message(&mut self, input: &[u8]) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(input.len() * 2 + 32);
        let before_in = self.decompress.total_in();
        loop {
            let consumed = self.decompress.total_in() - before_in;
            let remaining_in = &input[consumed as usize..];
            if remaining_in.is_empty() {
                break;
            }
            let before_out = out.len();
            let status = self
                .decompress
                .decompress_vec(remaining_in, &mut out, FlushDecompress::Sync)
                .map_err(|e| WireError::Zlib(e.to_string()))?;
            let produced = out.len() - before_out;
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError if produced == 0 && remaining_in.is_empty() => break,
                _ => {
                    if self.decompress.total_in() - before_in >= input.len() as u64 && produced == 0 {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Default for ZlibReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_a_single_message() {
        let mut sender = ZlibSender::new();
        let mut receiver = ZlibReceiver::new();
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let compressed = sender.compress_message(&payload).unwrap();
        let decompressed = receiver.decompress_message(&compressed).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn roundtrips_a_sequence_of_messages_with_shared_dictionary() {
        let mut sender = ZlibSender::new();
        let mut receiver = ZlibReceiver::new();
        let messages: Vec<Vec<u8>> = (0..5)
            .map(|i| format!("message number {i} repeats some common text").into_bytes())
            .collect();
        for msg in &messages {
            let compressed = sender.compress_message(msg).unwrap();
            let decompressed = receiver.decompress_message(&compressed).unwrap();
            assert_eq!(&decompressed, msg);
        }
    }

    #[test]
    fn empty_message_roundtrips() {
        let mut sender = ZlibSender::new();
        let mut receiver = ZlibReceiver::new();
        let compressed = sender.compress_message(b"").unwrap();
        let decompressed = receiver.decompress_message(&compressed).unwrap();
        assert!(decompressed.is_empty());
    }
}
