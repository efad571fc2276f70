// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-architecture noise filters (ch. 4.7).
//!
//! A filter decides that two results, though not strictly equal, are
//! close enough to treat as equal for clustering purposes — a known
//! source of cross-core non-determinism rather than a real diff.
//!
//! Filters run against the lenient form of each result (SIGBUS folded
//! into SIGSEGV, SIGALRM state cleared), except where a check explicitly
//! needs the raw pre-fold signal to tell SIGBUS apart from a clean exit.

use std::collections::BTreeSet;

use crate::config::Arch;
use crate::wire::{MemDiff, Result};

const SIGBUS: u8 = 7;
const SIGSEGV: u8 = 11;

/// `true` iff `diffs` is non-empty and every member is in `allowed` —
/// i.e. `diffs` is a non-empty subset of `allowed` (mirrors the source's
/// `diffs in signal_powerset(allowed)`).
fn is_nonempty_subset_of(diffs: &BTreeSet<String>, allowed: &[&str]) -> bool {
    !diffs.is_empty() && diffs.iter().all(|d| allowed.contains(&d.as_str()))
}

/// Runs `check(a, b)` against both orderings of `raw1`/`raw2`, the way
/// the source's `filter_bidirectional` lets a one-sided predicate (e.g.
/// "this one crashed, that one didn't") match regardless of which
/// result is `self` and which is `other`.
fn bidirectional(raw1: &Result, raw2: &Result, check: impl Fn(&Result, &Result) -> bool) -> bool {
    check(raw1, raw2) || check(raw2, raw1)
}

/// Whether `raw1`/`raw2` should be treated as equal for clustering
/// purposes, given the target architecture. `raw1`/`raw2` are the
/// un-folded per-step results; lenient folding is applied here.
pub fn filters(arch: Arch, raw1: &Result, raw2: &Result) -> bool {
    let lenient1 = raw1.to_lenient();
    let lenient2 = raw2.to_lenient();
    match arch {
        Arch::Riscv64 => custom_filters_riscv64(&lenient1, &lenient2),
        Arch::Aarch64 => custom_filters_aarch64(raw1, raw2, &lenient1, &lenient2),
    }
}

fn custom_filters_riscv64(lenient1: &Result, lenient2: &Result) -> bool {
    let diffs = lenient1.diff_fields(lenient2);
    is_nonempty_subset_of(&diffs, &["pstate", "si_addr", "si_pc", "si_code"])
}

fn custom_filters_aarch64(raw1: &Result, raw2: &Result, lenient1: &Result, lenient2: &Result) -> bool {
    // Not sure what we should do about OK vs. SIGBUS in general. Hiding
    // it outright is wrong, but it's a frequent enough transient on this
    // fleet that leaving it unfiltered drowns real diffs.
    if bidirectional(raw1, raw2, |a, b| a.signum == SIGBUS && b.signum == 0) {
        return true;
    }

    let diffs = lenient1.diff_fields(lenient2);

    // Any filter based on a differing signum belongs above this line;
    // everything past here assumes the signal already matches.
    if is_nonempty_subset_of(&diffs, &["pstate", "si_addr", "si_pc", "si_code"]) {
        return true;
    }

    // Page-boundary-crossing stores/loads that segfault can leave a
    // trailing few bytes of the write in flight, which shows up as a
    // spurious memory diff right at the boundary. Filters out a mem-only
    // diff when every differing region starts within 32 bytes (the
    // widest store instruction, a vector `stp`) of its own page boundary.
    if lenient1.mem_diffs.is_some()
        && !diffs.is_empty()
        && lenient1.signum == SIGSEGV
        && lenient2.signum == SIGSEGV
        && diffs == BTreeSet::from(["mem".to_string()])
    {
        let page_size = Arch::Aarch64.page_size();
        let symmetric = mem_diff_symmetric_difference(
            lenient1.mem_diffs.as_deref().unwrap_or(&[]),
            lenient2.mem_diffs.as_deref().unwrap_or(&[]),
        );
        let all_near_boundary = symmetric
            .iter()
            .all(|d| (d.start + 32) / page_size != d.start / page_size);
        if all_near_boundary {
            return true;
        }
    }

    false
}

fn mem_diff_symmetric_difference<'a>(a: &'a [MemDiff], b: &'a [MemDiff]) -> Vec<&'a MemDiff> {
    a.iter()
        .filter(|d| !b.contains(d))
        .chain(b.iter().filter(|d| !a.contains(d)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn result(signum: u8, si_addr: u64) -> Result {
        Result { signum, cycle_diff: None, instret_diff: None, regs: BTreeMap::new(), si_addr, si_pc: 0, si_code: 0, mem_diffs: None }
    }

    #[test]
    fn riscv64_filters_away_a_pstate_only_diff() {
        let mut a = result(1, 0x1000);
        a.si_pc = 0x2000;
        let mut b = result(1, 0x3000);
        b.si_pc = 0x2000;
        assert!(custom_filters_riscv64(&a, &b));
    }

    #[test]
    fn riscv64_does_not_filter_a_register_diff() {
        let mut a = result(1, 0x1000);
        a.regs.insert(0, crate::wire::RegValue::Scalar(1));
        let b = result(1, 0x1000);
        assert!(!custom_filters_riscv64(&a, &b));
    }

    #[test]
    fn aarch64_filters_sigbus_vs_clean_exit() {
        let raw1 = result(SIGBUS, 0);
        let raw2 = result(0, 0);
        assert!(filters(Arch::Aarch64, &raw1, &raw2));
        assert!(filters(Arch::Aarch64, &raw2, &raw1));
    }

    #[test]
    fn aarch64_filters_boundary_adjacent_mem_diffs() {
        let mut a = result(SIGSEGV, 0x1000);
        a.si_pc = 0x2000;
        a.mem_diffs = Some(vec![MemDiff { start: 16368, n: 16, val_prefix: 1, crc32: 1 }]);
        let mut b = result(SIGSEGV, 0x1000);
        b.si_pc = 0x2000;
        b.mem_diffs = Some(vec![MemDiff { start: 16368, n: 16, val_prefix: 2, crc32: 2 }]);
        assert!(custom_filters_aarch64(&a, &b, &a.to_lenient(), &b.to_lenient()));
    }

    #[test]
    fn aarch64_does_not_filter_a_mem_diff_far_from_any_boundary() {
        let mut a = result(SIGSEGV, 0x1000);
        a.si_pc = 0x2000;
        a.mem_diffs = Some(vec![MemDiff { start: 256, n: 16, val_prefix: 1, crc32: 1 }]);
        let mut b = result(SIGSEGV, 0x1000);
        b.si_pc = 0x2000;
        b.mem_diffs = Some(vec![MemDiff { start: 256, n: 16, val_prefix: 2, crc32: 2 }]);
        assert!(!custom_filters_aarch64(&a, &b, &a.to_lenient(), &b.to_lenient()));
    }
}
