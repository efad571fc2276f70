// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Offline-seq generator (ch. 4.5).
//!
//! Packs one `JustSeqNum` message per batch instead of a full `RegSelect`,
//! trading network bytes for recomputation: the runner only needs
//! `(seed, seq_num, seq_len)` to reproduce the exact same PRNG draws
//! inline, and the server only expands a seq_num back into real values
//! when a diff actually needs a reproducer. The source does this
//! expansion by shelling out to a co-located `input-generator` binary
//! built from the same PRNG recurrence; since building that binary is out
//! of scope here, [`OfflineSeqGenerator::expand`] recomputes it in
//! process against the shared [`RandomDiffGenerator`] core instead - same
//! math, no subprocess.

use crate::config::BuildFlags;
use crate::error::GeneratorError;
use crate::generator::random_diff::RandomDiffGenerator;
use crate::generator::Generator;
use crate::wire::Input;

pub struct OfflineSeqGenerator {
    inner: RandomDiffGenerator,
    seq_len: u8,
}

impl OfflineSeqGenerator {
    pub fn new(inner: RandomDiffGenerator, seq_len: u8) -> Self {
        OfflineSeqGenerator { inner, seq_len }
    }

    /// Recomputes the real `ValuesFull` input a given `seq_num` packed to,
    /// for use once a diff on that seq_num needs a written reproducer.
    pub fn expand(&self, seq_num: u64) -> Result<Input, GeneratorError> {
        let reg_select = self.inner.seeded_input(seq_num)?;
        Ok(self.inner.resolve(&reg_select))
    }
}

impl Generator for OfflineSeqGenerator {
    fn generate(&self, counter: u64, n: u32) -> Result<Vec<Input>, GeneratorError> {
        Ok(vec![Input::JustSeqNum {
            seq_num: counter,
            batch_count: n as u16,
            seq_len: self.seq_len,
            full_seq: true,
        }])
    }

    fn get_build_flags(&self) -> (Vec<&'static str>, Vec<&'static str>) {
        let (repro, mut non_repro) = self.inner.get_build_flags();
        non_repro.retain(|f| *f != "-DWITH_REGS");
        non_repro.push("-DJUST_SEQ_NUM");
        (repro, non_repro)
    }

    fn expand_inputs_after_exec(&self) -> bool {
        true
    }

    fn expand_for_reproducer(&self, input: &Input) -> Result<Input, GeneratorError> {
        match input {
            Input::JustSeqNum { seq_num, .. } => self.expand(*seq_num),
            other => Ok(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Arch;
    use crate::instr::db::{Instruction, InstructionDb};
    use crate::instr::field::{CombinedMask, Field};
    use std::sync::Arc;

    fn field(msb: u8, lsb: u8, name: Option<&str>, fixed_value: u32, fixed_mask: u32) -> Field {
        Field {
            msb,
            lsb,
            name: name.map(str::to_string),
            fixed_value,
            fixed_mask,
        }
    }

    fn tiny_db() -> Arc<InstructionDb> {
        Arc::new(InstructionDb::new(vec![Instruction {
            mnemonic: "add".to_string(),
            fields: vec![
                field(6, 0, None, 0b011_0011, 0b111_1111),
                field(11, 7, Some("rd"), 0, 0),
                field(19, 15, Some("rs1"), 0, 0),
                field(24, 20, Some("rs2"), 0, 0),
                field(31, 25, None, 0, 0b111_1111),
            ],
            extensions: vec![],
            combined_mask: CombinedMask { mask: 0, value: 0 },
        }]))
    }

    #[test]
    fn generate_emits_a_single_just_seq_num_per_batch() {
        let inner = RandomDiffGenerator::new(tiny_db(), Arch::Riscv64, BuildFlags::default(), 4, 4, 9, false);
        let gen = OfflineSeqGenerator::new(inner, 4);
        let batch = gen.generate(100, 50).unwrap();
        assert_eq!(batch.len(), 1);
        match &batch[0] {
            Input::JustSeqNum { seq_num, batch_count, seq_len, .. } => {
                assert_eq!(*seq_num, 100);
                assert_eq!(*batch_count, 50);
                assert_eq!(*seq_len, 4);
            }
            _ => panic!("expected JustSeqNum"),
        }
    }

    #[test]
    fn build_flags_swap_with_regs_for_just_seq_num() {
        let inner = RandomDiffGenerator::new(tiny_db(), Arch::Riscv64, BuildFlags::default(), 4, 4, 9, false);
        let gen = OfflineSeqGenerator::new(inner, 4);
        let (_, non_repro) = gen.get_build_flags();
        assert!(non_repro.contains(&"-DJUST_SEQ_NUM"));
        assert!(!non_repro.contains(&"-DWITH_REGS"));
    }

    #[test]
    fn expand_inputs_after_exec_is_true() {
        let inner = RandomDiffGenerator::new(tiny_db(), Arch::Riscv64, BuildFlags::default(), 4, 4, 9, false);
        let gen = OfflineSeqGenerator::new(inner, 4);
        assert!(gen.expand_inputs_after_exec());
    }
}
