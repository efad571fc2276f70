// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection handshake (ch. 4.3).
//!
//! Every string on the wire, handshake or otherwise, uses the same
//! `u32 length LE` convention as the outer message framing - there is no
//! separate string type, just a nested length prefix.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::config::Arch;
use crate::error::SessionError;

/// Reported CPU identity, derived straight from the handshake (ch. 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Microarchitecture {
    pub midr: Option<u64>,
    pub model_name: String,
    pub num_cores: u32,
    pub num_sockets: u32,
    pub threads_per_core: u32,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMeta {
    pub hostname: String,
    pub num_cpus: u32,
    pub core_index: u32,
    pub lscpu_text: String,
    pub proc_cpuinfo_text: String,
    pub sys_possible_text: String,
    pub vec_size: u32,
    pub sve_max_size: Option<u32>,
    pub sme_max_size: Option<u32>,
    pub tags: BTreeMap<String, String>,
    pub elf_hash: String,
}

impl ClientMeta {
    /// MIDR for grouping (ch. 4.4), read from `tags["midr"]` if the client
    /// reports it; the server never parses `lscpu_text` itself (ch. 4.3 -
    /// that belongs to build tooling out of scope here).
    pub fn midr(&self) -> Option<u64> {
        self.tags.get("midr").and_then(|s| {
            let trimmed = s.trim_start_matches("0x");
            u64::from_str_radix(trimmed, 16).ok()
        })
    }

    /// Two `ClientMeta`s are "similar" iff their reported microarch model
    /// name tag matches (used to dedup client summaries in reproducer
    /// comments, ch. 3).
    pub fn similar(&self, other: &ClientMeta) -> bool {
        self.tags.get("model_name") == other.tags.get("model_name")
    }

    pub fn identifier(&self) -> (String, u32) {
        (self.hostname.clone(), self.core_index)
    }
}

pub struct HandshakeReply {
    pub max_batch_n: u32,
    pub seed: u64,
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, SessionError> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, SessionError> {
    let len = read_u32(reader)? as usize;
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| SessionError::HandshakeFailed(e.to_string()))
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<(), SessionError> {
    let bytes = s.as_bytes();
    writer
        .write_all(&(bytes.len() as u32).to_le_bytes())
        .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
    writer
        .write_all(bytes)
        .map_err(|e| SessionError::HandshakeFailed(e.to_string()))
}

/// Reads the client's handshake fields off `reader` in protocol order.
pub fn read_handshake<R: Read>(reader: &mut R, arch: Arch) -> Result<ClientMeta, SessionError> {
    let hostname = read_string(reader)?;
    let num_cpus = read_u32(reader)?;
    let core_index = read_u32(reader)?;
    let lscpu_text = read_string(reader)?;
    let proc_cpuinfo_text = read_string(reader)?;
    let sys_possible_text = read_string(reader)?;
    let vec_size = read_u32(reader)?;
    let (sve_max_size, sme_max_size) = if matches!(arch, Arch::Aarch64) {
        (Some(read_u32(reader)?), Some(read_u32(reader)?))
    } else {
        (None, None)
    };
    let tag_count = read_u32(reader)?;
    let mut tags = BTreeMap::new();
    for _ in 0..tag_count {
        let key = read_string(reader)?;
        let value = read_string(reader)?;
        tags.insert(key, value);
    }
    let elf_hash = read_string(reader)?;

    if !tags.contains_key("midr") {
        log::warn!(
            "client {hostname} core {core_index} did not report a midr tag; \
             falling back to hostname+microarch grouping for this session"
        );
    }

    Ok(ClientMeta {
        hostname,
        num_cpus,
        core_index,
        lscpu_text,
        proc_cpuinfo_text,
        sys_possible_text,
        vec_size,
        sve_max_size,
        sme_max_size,
        tags,
        elf_hash,
    })
}

/// Writes the server's handshake reply: `max_batch_n: u32`, `seed: u64`.
pub fn write_handshake_reply<W: Write>(writer: &mut W, reply: &HandshakeReply) -> Result<(), SessionError> {
    writer
        .write_all(&reply.max_batch_n.to_le_bytes())
        .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
    writer
        .write_all(&reply.seed.to_le_bytes())
        .map_err(|e| SessionError::HandshakeFailed(e.to_string()))
}

/// Validates the expected ELF hash against what a session reported;
/// mismatch is fatal for that session only (ch. 4.3).
pub fn check_elf_hash(expected: &str, meta: &ClientMeta) -> Result<(), SessionError> {
    if expected != meta.elf_hash {
        return Err(SessionError::ElfHashMismatch {
            expected: expected.to_string(),
            got: meta.elf_hash.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_test_handshake(arch: Arch, midr_tag: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        write_string(&mut buf, "runner-7").unwrap();
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(&2u32.to_le_bytes());
        write_string(&mut buf, "lscpu output").unwrap();
        write_string(&mut buf, "cpuinfo output").unwrap();
        write_string(&mut buf, "0-3").unwrap();
        buf.extend_from_slice(&16u32.to_le_bytes());
        if matches!(arch, Arch::Aarch64) {
            buf.extend_from_slice(&0u32.to_le_bytes());
            buf.extend_from_slice(&0u32.to_le_bytes());
        }
        if midr_tag {
            buf.extend_from_slice(&1u32.to_le_bytes());
            write_string(&mut buf, "midr").unwrap();
            write_string(&mut buf, "0x410fd080").unwrap();
        } else {
            buf.extend_from_slice(&0u32.to_le_bytes());
        }
        write_string(&mut buf, "deadbeef").unwrap();
        buf
    }

    #[test]
    fn reads_aarch64_handshake_with_midr_tag() {
        let data = write_test_handshake(Arch::Aarch64, true);
        let mut cursor = Cursor::new(data);
        let meta = read_handshake(&mut cursor, Arch::Aarch64).unwrap();
        assert_eq!(meta.hostname, "runner-7");
        assert_eq!(meta.core_index, 2);
        assert_eq!(meta.midr(), Some(0x410f_d080));
        assert_eq!(meta.sve_max_size, Some(0));
    }

    #[test]
    fn missing_midr_tag_is_tolerated() {
        let data = write_test_handshake(Arch::Riscv64, false);
        let mut cursor = Cursor::new(data);
        let meta = read_handshake(&mut cursor, Arch::Riscv64).unwrap();
        assert_eq!(meta.midr(), None);
        assert!(meta.sve_max_size.is_none());
    }

    #[test]
    fn elf_hash_mismatch_is_fatal_for_the_session() {
        let data = write_test_handshake(Arch::Riscv64, false);
        let mut cursor = Cursor::new(data);
        let meta = read_handshake(&mut cursor, Arch::Riscv64).unwrap();
        assert!(check_elf_hash("cafebabe", &meta).is_err());
        assert!(check_elf_hash("deadbeef", &meta).is_ok());
    }

    #[test]
    fn handshake_reply_roundtrips() {
        let mut buf = Vec::new();
        write_handshake_reply(&mut buf, &HandshakeReply { max_batch_n: 512, seed: 0xabcd }).unwrap();
        let mut cursor = Cursor::new(&buf);
        let mut max_batch_bytes = [0u8; 4];
        cursor.read_exact(&mut max_batch_bytes).unwrap();
        let mut seed_bytes = [0u8; 8];
        cursor.read_exact(&mut seed_bytes).unwrap();
        assert_eq!(u32::from_le_bytes(max_batch_bytes), 512);
        assert_eq!(u64::from_le_bytes(seed_bytes), 0xabcd);
    }
}
