// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `Result` / `LenientResult` / `FilteredResult` / `MultiResult` (ch. 3, ch. 4.2).

use std::collections::BTreeMap;

use crc32fast::Hasher as Crc32;

use crate::config::{Arch, BuildFlags};
use crate::error::WireError;

type StdResult<T, E> = std::result::Result<T, E>;

pub const MEM_CUT_AT: usize = crate::config::MEM_CUT_AT;

const SIGBUS: u8 = 7;
const SIGSEGV: u8 = 11;
const SIGALRM: u8 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegValue {
    Scalar(u64),
    Vector(u128),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemDiff {
    pub start: u64,
    /// Full size of the changed region; may exceed `val_prefix`'s length.
    pub n: u32,
    pub val_prefix: u128,
    pub crc32: u32,
}

/// One step's worth of runner output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Result {
    pub signum: u8,
    pub cycle_diff: Option<u16>,
    pub instret_diff: Option<u16>,
    pub regs: BTreeMap<u8, RegValue>,
    pub si_addr: u64,
    pub si_pc: u64,
    pub si_code: u32,
    pub mem_diffs: Option<Vec<MemDiff>>,
}

impl Result {
    /// Strict equality: every field must match exactly (ch. 3).
    pub fn strict_eq(&self, other: &Result) -> bool {
        self.signum == other.signum
            && self.si_addr == other.si_addr
            && self.si_pc == other.si_pc
            && self.si_code == other.si_code
            && self.mem_diffs == other.mem_diffs
            && self.regs == other.regs
    }

    pub fn similar(&self, other: &Result) -> bool {
        if self.signum != other.signum || self.si_code != other.si_code {
            return false;
        }
        if self.regs.is_empty() != other.regs.is_empty() {
            return false;
        }
        match (&self.mem_diffs, &other.mem_diffs) {
            (Some(a), Some(b)) if a.is_empty() != b.is_empty() => return false,
            _ => {}
        }
        true
    }

    pub fn decode(data: &[u8], arch: Arch, flags: BuildFlags) -> StdResult<(Result, usize), WireError> {
        let table = reg_table(arch, flags);
        let mut cursor = 0usize;
        let signum = read_u8(data, &mut cursor)?;

        let (cycle_diff, instret_diff) = if flags.meta {
            let cycle = read_u16(data, &mut cursor)?;
            let instret = if matches!(arch, Arch::Riscv64) {
                Some(read_u16(data, &mut cursor)?)
            } else {
                None
            };
            (Some(cycle), instret)
        } else {
            (None, None)
        };

        let regs_changed_count = read_u8(data, &mut cursor)?;
        let mut regs = BTreeMap::new();
        for _ in 0..regs_changed_count {
            let reg_index = read_u8(data, &mut cursor)?;
            let is_vector = table.get(reg_index as usize).map(|(_, v)| *v).unwrap_or(false);
            let value = if is_vector {
                RegValue::Vector(read_u128(data, &mut cursor)?)
            } else {
                RegValue::Scalar(read_u64(data, &mut cursor)?)
            };
            regs.insert(reg_index, value);
        }

        let (si_addr, si_pc, si_code) = if signum != 0 {
            let addr = read_u64(data, &mut cursor)?;
            let pc = read_u64(data, &mut cursor)?;
            let code = read_u32(data, &mut cursor)?;
            (addr, pc, code)
        } else {
            (0, 0, 0)
        };

        let mem_diffs = if flags.check_mem {
            let n_diffs = read_u8(data, &mut cursor)?;
            let mut diffs = Vec::with_capacity(n_diffs as usize);
            for _ in 0..n_diffs {
                let start = read_u64(data, &mut cursor)?;
                let n = read_u32(data, &mut cursor)?;
                let n_cap = (n as usize).min(MEM_CUT_AT);
                let val_prefix = read_uint_le(data, &mut cursor, n_cap)?;
                let crc32 = read_u32(data, &mut cursor)?;
                diffs.push(MemDiff { start, n, val_prefix, crc32 });
            }
            Some(diffs)
        } else {
            None
        };

        Ok((
            Result { signum, cycle_diff, instret_diff, regs, si_addr, si_pc, si_code, mem_diffs },
            cursor,
        ))
    }

    /// `LenientResult`: SIGBUS folds into SIGSEGV; SIGALRM drops all state
    /// that depends on scheduling/timing noise (ch. 4.1/ch. 9).
    pub fn to_lenient(&self) -> Result {
        let mut signum = self.signum;
        if signum == SIGBUS {
            signum = SIGSEGV;
        }
        if signum == SIGALRM {
            return Result {
                signum,
                cycle_diff: self.cycle_diff,
                instret_diff: self.instret_diff,
                regs: BTreeMap::new(),
                si_addr: 0,
                si_pc: 0,
                si_code: 0,
                mem_diffs: Some(Vec::new()),
            };
        }
        Result { signum, ..self.clone() }
    }

    /// Named fields that differ between two results (ch. 4.7 filter
    /// layer). Register diffs are named by their numeric index, since
    /// that's what the per-arch custom filters actually key on.
    pub fn diff_fields(&self, other: &Result) -> std::collections::BTreeSet<String> {
        let mut diffs = std::collections::BTreeSet::new();
        if self.signum != other.signum {
            diffs.insert("signum".to_string());
        }
        if self.signum != 0 && other.signum != 0 {
            if self.si_addr != other.si_addr {
                diffs.insert("si_addr".to_string());
            }
            if self.si_pc != other.si_pc {
                diffs.insert("si_pc".to_string());
            }
            if self.si_code != other.si_code {
                diffs.insert("si_code".to_string());
            }
        }
        let reg_indices: std::collections::BTreeSet<u8> = self.regs.keys().chain(other.regs.keys()).copied().collect();
        for reg in reg_indices {
            if self.regs.get(&reg) != other.regs.get(&reg) {
                diffs.insert(reg.to_string());
            }
        }
        if self.mem_diffs.is_some() || other.mem_diffs.is_some() {
            if self.mem_diffs != other.mem_diffs {
                diffs.insert("mem".to_string());
            }
        }
        diffs
    }
}

/// CRC32 of a memory region, used to cross-check `MemDiff::crc32` (ch. 4.1).
pub fn crc32_of(region: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(region);
    hasher.finalize()
}

/// A filter-aware wrapper: `eq` first asks the filter whether two results
/// should be treated as equal for this input before falling back to
/// `strict_eq`. `hash` is always 0 so cross-filter comparisons never
/// silently diverge in a hash-bucketed collection (ch. 4.6 "filter layer").
pub struct FilteredResult<'a> {
    pub result: Result,
    pub filter: Box<dyn Fn(&Result, &Result) -> bool + 'a>,
}

impl<'a> FilteredResult<'a> {
    pub fn eq(&self, other: &Result) -> bool {
        (self.filter)(&self.result, other) || self.result.strict_eq(other)
    }

    pub const fn hash(&self) -> u64 {
        0
    }
}

/// Ordered per-step results for one input (ch. 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiResult {
    pub results: Vec<Result>,
}

impl MultiResult {
    /// Parses one reply: `[full_seq: u8][seq_len: u8 if full_seq] results...`
    pub fn decode(data: &[u8], arch: Arch, flags: BuildFlags) -> StdResult<(MultiResult, usize), WireError> {
        let mut cursor = 0usize;
        let full_seq = read_u8(data, &mut cursor)? == 1;
        let mut results = Vec::new();
        if full_seq {
            let seq_len = read_u8(data, &mut cursor)?;
            for _ in 0..seq_len {
                let (result, consumed) = Result::decode(&data[cursor..], arch, flags)?;
                cursor += consumed;
                results.push(result);
            }
        } else {
            let (result, consumed) = Result::decode(&data[cursor..], arch, flags)?;
            cursor += consumed;
            results.push(result);
        }
        Ok((MultiResult { results }, cursor))
    }

    /// Parses one ticket's reply as the runner actually sends it: each
    /// single-step `Result` is preceded by its own `u16` length so a
    /// session can skip a malformed step without losing frame sync
    /// (ch. 4.2).
    pub fn decode_ticket_reply(data: &[u8], arch: Arch, flags: BuildFlags) -> StdResult<(MultiResult, usize), WireError> {
        let mut cursor = 0usize;
        let full_seq = read_u8(data, &mut cursor)? == 1;
        let steps = if full_seq { read_u8(data, &mut cursor)? as usize } else { 1 };
        let mut results = Vec::with_capacity(steps);
        for _ in 0..steps {
            let len = read_u16(data, &mut cursor)? as usize;
            need(data, cursor, len)?;
            let (result, consumed) = Result::decode(&data[cursor..cursor + len], arch, flags)?;
            if consumed != len {
                return Err(WireError::Truncated { expected: len, actual: consumed });
            }
            cursor += len;
            results.push(result);
        }
        Ok((MultiResult { results }, cursor))
    }
}

/// Builds the `regs_mapping` index->(name, is_vector) table the source
/// derives from `gp`/`fp`/`vec` register name lists (ch. 4.2: the reg
/// index in a `Result` is positional into this table). Exposed crate-wide
/// since the reproducer writer needs the same names to label registers
/// in the YAML it emits.
pub fn reg_table(arch: Arch, flags: BuildFlags) -> Vec<(&'static str, bool)> {
    let mut table = Vec::new();
    match arch {
        Arch::Riscv64 => {
            for name in RISCV64_GP {
                table.push((*name, false));
            }
            if flags.floats {
                table.push(("fcsr", false));
                for name in RISCV64_FP {
                    table.push((*name, false));
                }
            }
            if flags.vector {
                for name in VEC_NAMES {
                    table.push((*name, true));
                }
            }
        }
        Arch::Aarch64 => {
            for name in AARCH64_GP {
                table.push((*name, false));
            }
            table.push(("pstate", false));
            if flags.vector {
                table.push(("fpsr", false));
                for name in VEC_NAMES {
                    table.push((*name, true));
                }
            } else if flags.floats {
                table.push(("fpsr", false));
                for name in AARCH64_FP {
                    table.push((*name, false));
                }
            }
        }
    }
    table
}

/// Per-category register names, positional into `Input::ValuesFull`'s
/// `gp`/`fp`/`vec` vectors (ch. 4.2, ch. 6 reproducer YAML). Distinct
/// from [`reg_table`], which interleaves categories the way a `Result`'s
/// flat `regs_after` index does.
pub fn gp_names(arch: Arch) -> &'static [&'static str] {
    match arch {
        Arch::Riscv64 => RISCV64_GP,
        Arch::Aarch64 => AARCH64_GP,
    }
}

pub fn fp_names(arch: Arch) -> &'static [&'static str] {
    match arch {
        Arch::Riscv64 => RISCV64_FP,
        Arch::Aarch64 => AARCH64_FP,
    }
}

pub fn vec_names(_arch: Arch) -> &'static [&'static str] {
    VEC_NAMES
}

const RISCV64_GP: &[&str] = &[
    "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5", "a6",
    "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6",
];

const RISCV64_FP: &[&str] = &[
    "ft0", "ft1", "ft2", "ft3", "ft4", "ft5", "ft6", "ft7", "fs0", "fs1", "fa0", "fa1", "fa2",
    "fa3", "fa4", "fa5", "fa6", "fa7", "fs2", "fs3", "fs4", "fs5", "fs6", "fs7", "fs8", "fs9",
    "fs10", "fs11", "ft8", "ft9", "ft10", "ft11",
];

const AARCH64_GP: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp",
];

const AARCH64_FP: &[&str] = &[
    "d0", "d1", "d2", "d3", "d4", "d5", "d6", "d7", "d8", "d9", "d10", "d11", "d12", "d13", "d14",
    "d15", "d16", "d17", "d18", "d19", "d20", "d21", "d22", "d23", "d24", "d25", "d26", "d27",
    "d28", "d29", "d30", "d31",
];

const VEC_NAMES: &[&str] = &[
    "v0", "v1", "v2", "v3", "v4", "v5", "v6", "v7", "v8", "v9", "v10", "v11", "v12", "v13", "v14",
    "v15", "v16", "v17", "v18", "v19", "v20", "v21", "v22", "v23", "v24", "v25", "v26", "v27",
    "v28", "v29", "v30", "v31",
];

fn need(data: &[u8], cursor: usize, n: usize) -> StdResult<(), WireError> {
    if cursor + n > data.len() {
        Err(WireError::Truncated { expected: cursor + n, actual: data.len() })
    } else {
        Ok(())
    }
}

fn read_u8(data: &[u8], cursor: &mut usize) -> StdResult<u8, WireError> {
    need(data, *cursor, 1)?;
    let v = data[*cursor];
    *cursor += 1;
    Ok(v)
}

fn read_u16(data: &[u8], cursor: &mut usize) -> StdResult<u16, WireError> {
    need(data, *cursor, 2)?;
    let v = u16::from_le_bytes(data[*cursor..*cursor + 2].try_into().unwrap());
    *cursor += 2;
    Ok(v)
}

fn read_u32(data: &[u8], cursor: &mut usize) -> StdResult<u32, WireError> {
    need(data, *cursor, 4)?;
    let v = u32::from_le_bytes(data[*cursor..*cursor + 4].try_into().unwrap());
    *cursor += 4;
    Ok(v)
}

fn read_u64(data: &[u8], cursor: &mut usize) -> StdResult<u64, WireError> {
    need(data, *cursor, 8)?;
    let v = u64::from_le_bytes(data[*cursor..*cursor + 8].try_into().unwrap());
    *cursor += 8;
    Ok(v)
}

fn read_u128(data: &[u8], cursor: &mut usize) -> StdResult<u128, WireError> {
    need(data, *cursor, 16)?;
    let v = u128::from_le_bytes(data[*cursor..*cursor + 16].try_into().unwrap());
    *cursor += 16;
    Ok(v)
}

fn read_uint_le(data: &[u8], cursor: &mut usize, n: usize) -> StdResult<u128, WireError> {
    need(data, *cursor, n)?;
    let mut v: u128 = 0;
    for (i, byte) in data[*cursor..*cursor + n].iter().enumerate() {
        v |= (*byte as u128) << (8 * i);
    }
    *cursor += n;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_simple(signum: u8, regs: &[(u8, u64)]) -> Vec<u8> {
        let mut buf = vec![signum];
        buf.push(regs.len() as u8);
        for (idx, value) in regs {
            buf.push(*idx);
            buf.extend_from_slice(&value.to_le_bytes());
        }
        if signum != 0 {
            buf.extend_from_slice(&0x1000u64.to_le_bytes());
            buf.extend_from_slice(&0x2000u64.to_le_bytes());
            buf.extend_from_slice(&1u32.to_le_bytes());
        }
        buf
    }

    #[test]
    fn decodes_a_clean_result_with_no_regs_changed() {
        let data = encode_simple(0, &[]);
        let (result, consumed) = Result::decode(&data, Arch::Aarch64, BuildFlags::default()).unwrap();
        assert_eq!(result.signum, 0);
        assert!(result.regs.is_empty());
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn decodes_a_signal_with_reg_changes() {
        let data = encode_simple(SIGSEGV, &[(0, 0xdead_beef)]);
        let (result, _) = Result::decode(&data, Arch::Aarch64, BuildFlags::default()).unwrap();
        assert_eq!(result.signum, SIGSEGV);
        assert_eq!(result.si_addr, 0x1000);
        assert_eq!(result.regs[&0], RegValue::Scalar(0xdead_beef));
    }

    #[test]
    fn lenient_folds_sigbus_into_sigsegv() {
        let data = encode_simple(SIGBUS, &[]);
        let (result, _) = Result::decode(&data, Arch::Aarch64, BuildFlags::default()).unwrap();
        let lenient = result.to_lenient();
        assert_eq!(lenient.signum, SIGSEGV);
    }

    #[test]
    fn lenient_clears_state_on_sigalrm() {
        let data = encode_simple(SIGALRM, &[(0, 1)]);
        let (result, _) = Result::decode(&data, Arch::Aarch64, BuildFlags::default()).unwrap();
        let lenient = result.to_lenient();
        assert!(lenient.regs.is_empty());
        assert_eq!(lenient.mem_diffs, Some(Vec::new()));
    }

    #[test]
    fn multi_result_decodes_three_steps() {
        let mut buf = vec![1u8, 3u8];
        buf.extend(encode_simple(0, &[]));
        buf.extend(encode_simple(0, &[]));
        buf.extend(encode_simple(0, &[]));
        let (multi, consumed) = MultiResult::decode(&buf, Arch::Aarch64, BuildFlags::default()).unwrap();
        assert_eq!(multi.results.len(), 3);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn ticket_reply_demuxes_length_prefixed_steps() {
        let step = encode_simple(0, &[]);
        let mut buf = vec![1u8, 2u8];
        buf.extend_from_slice(&(step.len() as u16).to_le_bytes());
        buf.extend_from_slice(&step);
        buf.extend_from_slice(&(step.len() as u16).to_le_bytes());
        buf.extend_from_slice(&step);
        let (multi, consumed) =
            MultiResult::decode_ticket_reply(&buf, Arch::Aarch64, BuildFlags::default()).unwrap();
        assert_eq!(multi.results.len(), 2);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn crc32_matches_known_vector() {
        assert_eq!(crc32_of(b""), 0);
        assert_eq!(crc32_of(b"123456789"), 0xCBF4_3926);
    }
}
