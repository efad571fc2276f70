// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `Input` wire encoding (ch. 3, ch. 4.2).
//!
//! The source models these as a class hierarchy with duck-typed `pack`
//! overrides. Here they're one flat enum per logical shape with an
//! explicit discriminant byte, since `(arch, build_flags)` already
//! determine layout unambiguously and a tag byte is cheaper than trying
//! to mirror dynamic dispatch on the wire.

use std::collections::BTreeMap;

use crate::config::{Arch, BuildFlags};
use crate::error::WireError;

const TAG_JUST_SEQ_NUM: u8 = 0;
const TAG_REG_SELECT: u8 = 1;
const TAG_VALUES_FULL: u8 = 2;
const TAG_VALUES_SPARSE: u8 = 3;

/// Filler value used to pad unspecified register slots once a sparse or
/// reg-select input expands to `ValuesFull` (ch. 3: "unspecified slots
/// take a fixed filler").
pub const FILLER_64: u64 = 0x4141_4141_4141_4141;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    JustSeqNum {
        seq_num: u64,
        batch_count: u16,
        seq_len: u8,
        full_seq: bool,
    },
    RegSelect {
        gp_select: Vec<u8>,
        fp_select: Option<Vec<u8>>,
        vec_select: Option<Vec<u8>>,
        instr_seq: Vec<u32>,
        seq_len: u8,
        full_seq: bool,
    },
    ValuesFull {
        gp: Vec<u64>,
        fp: Option<Vec<u64>>,
        vec: Option<Vec<u128>>,
        instr_seq: Vec<u32>,
        seq_len: u8,
        full_seq: bool,
    },
    ValuesSparse {
        gp: BTreeMap<u8, u64>,
        fp: BTreeMap<u8, u64>,
        vec: BTreeMap<u8, u128>,
        instr_seq: Vec<u32>,
        seq_len: u8,
        full_seq: bool,
    },
}

impl Input {
    pub fn seq_len(&self) -> u8 {
        match self {
            Input::JustSeqNum { seq_len, .. }
            | Input::RegSelect { seq_len, .. }
            | Input::ValuesFull { seq_len, .. }
            | Input::ValuesSparse { seq_len, .. } => *seq_len,
        }
    }

    pub fn full_seq(&self) -> bool {
        match self {
            Input::JustSeqNum { full_seq, .. }
            | Input::RegSelect { full_seq, .. }
            | Input::ValuesFull { full_seq, .. }
            | Input::ValuesSparse { full_seq, .. } => *full_seq,
        }
    }

    pub fn pack(&self, arch: Arch, flags: BuildFlags) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Input::JustSeqNum { seq_num, batch_count, seq_len, full_seq } => {
                out.push(TAG_JUST_SEQ_NUM);
                out.extend_from_slice(&seq_num.to_le_bytes());
                out.extend_from_slice(&batch_count.to_le_bytes());
                out.push(*seq_len);
                out.push(*full_seq as u8);
            }
            Input::RegSelect { gp_select, fp_select, vec_select, instr_seq, seq_len, full_seq } => {
                out.push(TAG_REG_SELECT);
                out.extend_from_slice(gp_select);
                if flags.floats {
                    out.extend_from_slice(fp_select.as_deref().unwrap_or_default());
                }
                if flags.vector {
                    let vec_bytes = vec_select.as_deref().unwrap_or_default();
                    out.extend_from_slice(vec_bytes);
                }
                out.push(*seq_len);
                out.push(*full_seq as u8);
                for instr in instr_seq {
                    out.extend_from_slice(&instr.to_le_bytes());
                }
            }
            Input::ValuesFull { gp, fp, vec, instr_seq, seq_len, full_seq } => {
                out.push(TAG_VALUES_FULL);
                pack_values_full_preamble(&mut out, arch, flags, gp, fp.as_deref(), vec.as_deref());
                out.push(*seq_len);
                out.push(*full_seq as u8);
                for instr in instr_seq {
                    out.extend_from_slice(&instr.to_le_bytes());
                }
            }
            Input::ValuesSparse { gp, fp, vec, instr_seq, seq_len, full_seq } => {
                out.push(TAG_VALUES_SPARSE);
                pack_sparse_map(&mut out, gp);
                pack_sparse_map(&mut out, fp);
                pack_sparse_map128(&mut out, vec);
                out.push(*seq_len);
                out.push(*full_seq as u8);
                for instr in instr_seq {
                    out.extend_from_slice(&instr.to_le_bytes());
                }
            }
        }
        out
    }

    pub fn unpack(bytes: &[u8], arch: Arch, flags: BuildFlags) -> Result<(Input, usize), WireError> {
        let mut cursor = Cursor::new(bytes);
        let tag = cursor.u8()?;
        let input = match tag {
            TAG_JUST_SEQ_NUM => {
                let seq_num = cursor.u64()?;
                let batch_count = cursor.u16()?;
                let seq_len = cursor.u8()?;
                let full_seq = cursor.u8()? != 0;
                Input::JustSeqNum { seq_num, batch_count, seq_len, full_seq }
            }
            TAG_REG_SELECT => {
                let gp_select = cursor.bytes(arch.gp_count())?;
                let fp_select = if flags.floats { Some(cursor.bytes(arch.fp_count())?) } else { None };
                let vec_select = if flags.vector {
                    Some(cursor.bytes(arch.vec_count() * (arch.vec_reg_size() / 8))?)
                } else {
                    None
                };
                let seq_len = cursor.u8()?;
                let full_seq = cursor.u8()? != 0;
                let instr_seq = cursor.u32_array(seq_len as usize)?;
                Input::RegSelect { gp_select, fp_select, vec_select, instr_seq, seq_len, full_seq }
            }
            TAG_VALUES_FULL => {
                let (gp, fp, vec) = unpack_values_full_preamble(&mut cursor, arch, flags)?;
                let seq_len = cursor.u8()?;
                let full_seq = cursor.u8()? != 0;
                let instr_seq = cursor.u32_array(seq_len as usize)?;
                Input::ValuesFull { gp, fp, vec, instr_seq, seq_len, full_seq }
            }
            TAG_VALUES_SPARSE => {
                let gp = unpack_sparse_map(&mut cursor)?;
                let fp = unpack_sparse_map(&mut cursor)?;
                let vec = unpack_sparse_map128(&mut cursor)?;
                let seq_len = cursor.u8()?;
                let full_seq = cursor.u8()? != 0;
                let instr_seq = cursor.u32_array(seq_len as usize)?;
                Input::ValuesSparse { gp, fp, vec, instr_seq, seq_len, full_seq }
            }
            other => return Err(WireError::UnknownInputKind(other)),
        };
        Ok((input, cursor.pos))
    }

    /// Expand any variant to `ValuesFull`, filling unspecified registers
    /// with [`FILLER_64`] (ch. 3 invariant).
    pub fn to_values_full(&self, arch: Arch, flags: BuildFlags) -> Input {
        match self {
            Input::ValuesFull { .. } => self.clone(),
            Input::ValuesSparse { gp, fp, vec, instr_seq, seq_len, full_seq } => {
                let gp_full = expand_sparse(gp, arch.gp_count(), FILLER_64);
                let fp_full = if flags.floats {
                    Some(expand_sparse(fp, arch.fp_count(), FILLER_64))
                } else {
                    None
                };
                let vec_full = if flags.vector {
                    Some(expand_sparse128(
                        vec,
                        arch.vec_count(),
                        repeat_u64_to_u128(FILLER_64, arch.vec_reg_size() / 8),
                    ))
                } else {
                    None
                };
                Input::ValuesFull {
                    gp: gp_full,
                    fp: fp_full,
                    vec: vec_full,
                    instr_seq: instr_seq.clone(),
                    seq_len: *seq_len,
                    full_seq: *full_seq,
                }
            }
            Input::RegSelect { .. } | Input::JustSeqNum { .. } => {
                panic!("to_values_full requires pre-resolved register values; use the generator")
            }
        }
    }
}

fn repeat_u64_to_u128(value: u64, words: usize) -> u128 {
    let mut acc: u128 = 0;
    for _ in 0..words {
        acc = (acc << 64) | value as u128;
    }
    acc
}

fn expand_sparse(map: &BTreeMap<u8, u64>, count: usize, filler: u64) -> Vec<u64> {
    (0..count).map(|i| *map.get(&(i as u8)).unwrap_or(&filler)).collect()
}

fn expand_sparse128(map: &BTreeMap<u8, u128>, count: usize, filler: u128) -> Vec<u128> {
    (0..count).map(|i| *map.get(&(i as u8)).unwrap_or(&filler)).collect()
}

fn pack_values_full_preamble(
    out: &mut Vec<u8>,
    arch: Arch,
    flags: BuildFlags,
    gp: &[u64],
    fp: Option<&[u64]>,
    vec: Option<&[u128]>,
) {
    for v in gp {
        out.extend_from_slice(&v.to_le_bytes());
    }
    match arch {
        Arch::Aarch64 => {
            // Two padding u64 slots between the gp block and fp/vec for alignment.
            out.extend_from_slice(&0u64.to_le_bytes());
            if fp.is_some() || vec.is_some() {
                out.extend_from_slice(&0u64.to_le_bytes());
            }
        }
        Arch::Riscv64 => {}
    }
    if flags.floats {
        for v in fp.unwrap_or_default() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        if matches!(arch, Arch::Riscv64) {
            // fcsr padding slot after the fp block.
            out.extend_from_slice(&0u64.to_le_bytes());
        }
    }
    if flags.vector {
        for v in vec.unwrap_or_default() {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

fn unpack_values_full_preamble(
    cursor: &mut Cursor,
    arch: Arch,
    flags: BuildFlags,
) -> Result<(Vec<u64>, Option<Vec<u64>>, Option<Vec<u128>>), WireError> {
    let gp = cursor.u64_array(arch.gp_count())?;
    match arch {
        Arch::Aarch64 => {
            let _ = cursor.u64()?;
            if flags.floats || flags.vector {
                let _ = cursor.u64()?;
            }
        }
        Arch::Riscv64 => {}
    }
    let fp = if flags.floats {
        let values = cursor.u64_array(arch.fp_count())?;
        if matches!(arch, Arch::Riscv64) {
            let _ = cursor.u64()?;
        }
        Some(values)
    } else {
        None
    };
    let vec = if flags.vector {
        Some(cursor.u128_array(arch.vec_count())?)
    } else {
        None
    };
    Ok((gp, fp, vec))
}

fn pack_sparse_map(out: &mut Vec<u8>, map: &BTreeMap<u8, u64>) {
    out.push(map.len() as u8);
    for (idx, value) in map {
        out.push(*idx);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn pack_sparse_map128(out: &mut Vec<u8>, map: &BTreeMap<u8, u128>) {
    out.push(map.len() as u8);
    for (idx, value) in map {
        out.push(*idx);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn unpack_sparse_map(cursor: &mut Cursor) -> Result<BTreeMap<u8, u64>, WireError> {
    let n = cursor.u8()?;
    let mut map = BTreeMap::new();
    for _ in 0..n {
        let idx = cursor.u8()?;
        let value = cursor.u64()?;
        map.insert(idx, value);
    }
    Ok(map)
}

fn unpack_sparse_map128(cursor: &mut Cursor) -> Result<BTreeMap<u8, u128>, WireError> {
    let n = cursor.u8()?;
    let mut map = BTreeMap::new();
    for _ in 0..n {
        let idx = cursor.u8()?;
        let value = cursor.u128()?;
        map.insert(idx, value);
    }
    Ok(map)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.pos + n > self.bytes.len() {
            Err(WireError::Truncated { expected: self.pos + n, actual: self.bytes.len() })
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        let v = self.bytes[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        let v = u16::from_le_bytes(self.bytes[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        let v = u64::from_le_bytes(self.bytes[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn u128(&mut self) -> Result<u128, WireError> {
        self.need(16)?;
        let v = u128::from_le_bytes(self.bytes[self.pos..self.pos + 16].try_into().unwrap());
        self.pos += 16;
        Ok(v)
    }

    fn bytes(&mut self, n: usize) -> Result<Vec<u8>, WireError> {
        self.need(n)?;
        let v = self.bytes[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(v)
    }

    fn u32_array(&mut self, n: usize) -> Result<Vec<u32>, WireError> {
        self.need(n * 4)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(u32::from_le_bytes(self.bytes[self.pos..self.pos + 4].try_into().unwrap()));
            self.pos += 4;
        }
        Ok(out)
    }

    fn u64_array(&mut self, n: usize) -> Result<Vec<u64>, WireError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.u64()?);
        }
        Ok(out)
    }

    fn u128_array(&mut self, n: usize) -> Result<Vec<u128>, WireError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.u128()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn just_seq_num_roundtrips() {
        let arch = Arch::Aarch64;
        let flags = BuildFlags::default();
        let input = Input::JustSeqNum { seq_num: 0xdead_beef, batch_count: 7, seq_len: 3, full_seq: true };
        let bytes = input.pack(arch, flags);
        let (decoded, consumed) = Input::unpack(&bytes, arch, flags).unwrap();
        assert_eq!(decoded, input);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn values_full_roundtrips_aarch64_with_floats() {
        let arch = Arch::Aarch64;
        let mut flags = BuildFlags::default();
        flags.floats = true;
        let input = Input::ValuesFull {
            gp: vec![1; arch.gp_count()],
            fp: Some(vec![2; arch.fp_count()]),
            vec: None,
            instr_seq: vec![0x9100_0420, 0xd503_201f],
            seq_len: 2,
            full_seq: false,
        };
        let bytes = input.pack(arch, flags);
        let (decoded, consumed) = Input::unpack(&bytes, arch, flags).unwrap();
        assert_eq!(decoded, input);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn values_full_roundtrips_riscv64_plain() {
        let arch = Arch::Riscv64;
        let flags = BuildFlags::default();
        let input = Input::ValuesFull {
            gp: vec![0; arch.gp_count()],
            fp: None,
            vec: None,
            instr_seq: vec![0x0000_0013],
            seq_len: 1,
            full_seq: true,
        };
        let bytes = input.pack(arch, flags);
        let (decoded, _) = Input::unpack(&bytes, arch, flags).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn sparse_expands_with_filler_value() {
        let arch = Arch::Riscv64;
        let flags = BuildFlags::default();
        let mut gp = BTreeMap::new();
        gp.insert(0u8, 42u64);
        let sparse = Input::ValuesSparse {
            gp,
            fp: BTreeMap::new(),
            vec: BTreeMap::new(),
            instr_seq: vec![0x13],
            seq_len: 1,
            full_seq: true,
        };
        let full = sparse.to_values_full(arch, flags);
        match full {
            Input::ValuesFull { gp, .. } => {
                assert_eq!(gp[0], 42);
                assert_eq!(gp[1], FILLER_64);
            }
            _ => panic!("expected ValuesFull"),
        }
    }

    #[test]
    fn reg_select_vec_slots_are_sized_in_u64_words_not_bytes() {
        let arch = Arch::Aarch64;
        let mut flags = BuildFlags::default();
        flags.vector = true;
        let vec_select_len = arch.vec_count() * (arch.vec_reg_size() / 8);
        let input = Input::RegSelect {
            gp_select: vec![0; arch.gp_count()],
            fp_select: None,
            vec_select: Some(vec![7; vec_select_len]),
            instr_seq: vec![0x9100_0420],
            seq_len: 1,
            full_seq: true,
        };
        let bytes = input.pack(arch, flags);
        let (decoded, consumed) = Input::unpack(&bytes, arch, flags).unwrap();
        assert_eq!(decoded, input);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let arch = Arch::Aarch64;
        let flags = BuildFlags::default();
        let bytes = [TAG_JUST_SEQ_NUM, 1, 2, 3];
        assert!(Input::unpack(&bytes, arch, flags).is_err());
    }
}
