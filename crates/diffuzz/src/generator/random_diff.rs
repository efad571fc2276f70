// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inline random-diff generator (ch. 4.5).
//!
//! Each batch element gets its own `Mt19937`, seeded from `counter XOR
//! seed` so any element can be regenerated in isolation (needed both to
//! resume a run at an arbitrary counter and to recompute the exact input
//! a reproducer names). The source seeds from an arbitrary-precision
//! Python int; this seeds from the low 32 bits of `counter`, since the
//! generator's RNG is a 32-bit-seeded Mersenne Twister either way.

use std::sync::Arc;

use crate::config::{Arch, BuildFlags};
use crate::error::GeneratorError;
use crate::generator::fuzzing_value_map::{fuzzing_value_map_fp, fuzzing_value_map_gp};
use crate::generator::Generator;
use crate::instr::db::InstructionDb;
use crate::instr::rng::Mt19937;
use crate::wire::Input;

fn combined_seed(seed: u32, counter: u64) -> u32 {
    (counter as u32) ^ seed
}

pub struct RandomDiffGenerator {
    db: Arc<InstructionDb>,
    arch: Arch,
    flags: BuildFlags,
    seq_len: u8,
    num_regs: u32,
    seed: u32,
    weighted: bool,
    compress_send: bool,
}

impl RandomDiffGenerator {
    pub fn new(db: Arc<InstructionDb>, arch: Arch, flags: BuildFlags, seq_len: u8, num_regs: u32, seed: u32, weighted: bool) -> Self {
        RandomDiffGenerator {
            db,
            arch,
            flags,
            seq_len,
            num_regs,
            seed,
            weighted,
            compress_send: true,
        }
    }

    fn choose_mnemonic<'a>(&'a self, rng: &mut Mt19937) -> Option<&'a str> {
        if self.weighted {
            return self.db.choose_mnemonic(rng);
        }
        let names: Vec<&str> = self.db.mnemonics().collect();
        if names.is_empty() {
            return None;
        }
        let idx = rng.randint(0, names.len() as u64 - 1) as usize;
        Some(names[idx])
    }

    /// Builds one `RegSelect` input from a single seeded RNG stream. Public
    /// so the offline-seq generator can recompute the exact same input
    /// from a bare `seq_num` once a reproducer needs its real values.
    pub fn generate_one(&self, rng_seed: u32) -> Result<Input, GeneratorError> {
        let mut rng = Mt19937::new(rng_seed);

        let gp_select: Vec<u8> = (0..self.arch.gp_count())
            .map(|_| rng.randint(0, 255) as u8)
            .collect();
        let fp_select = if self.flags.floats {
            Some((0..self.arch.fp_count()).map(|_| rng.randint(0, 255) as u8).collect())
        } else {
            None
        };
        let vec_select = if self.flags.vector {
            let len = self.arch.vec_count() * (self.arch.vec_reg_size() / 8);
            Some((0..len).map(|_| rng.randint(0, 255) as u8).collect())
        } else {
            None
        };

        let mut instr_seq = Vec::with_capacity(self.seq_len as usize);
        for _ in 0..self.seq_len {
            let mnemonic = self
                .choose_mnemonic(&mut rng)
                .ok_or_else(|| GeneratorError::Db(crate::error::DbError::UnknownMnemonic("<empty db>".into())))?
                .to_string();
            instr_seq.push(self.db.randomly_init(&mnemonic, self.num_regs, &mut rng)?);
        }

        Ok(Input::RegSelect {
            gp_select,
            fp_select,
            vec_select,
            instr_seq,
            seq_len: self.seq_len,
            full_seq: true,
        })
    }

    /// Recomputes the single input a given counter value would have
    /// produced, combining the seed the same way [`Generator::generate`]
    /// does. Used by the offline-seq generator to expand a bare `seq_num`
    /// back into its real input (ch. 4.5).
    pub fn seeded_input(&self, counter: u64) -> Result<Input, GeneratorError> {
        self.generate_one(combined_seed(self.seed, counter))
    }

    /// Resolves `fuzzing_value_map` indices into real register values
    /// (ch. 4.5). Called once a `RegSelect` is about to become a
    /// reproducer's recorded `ValuesFull`.
    pub fn resolve(&self, input: &Input) -> Input {
        let gp_table = fuzzing_value_map_gp();
        let fp_table = fuzzing_value_map_fp();
        match input {
            Input::RegSelect { gp_select, fp_select, vec_select, instr_seq, seq_len, full_seq } => {
                let gp = gp_select.iter().map(|&idx| gp_table[idx as usize]).collect();
                let fp = fp_select
                    .as_ref()
                    .map(|sel| sel.iter().map(|&idx| fp_table[idx as usize]).collect());
                let vec = vec_select.as_ref().map(|sel| {
                    sel.chunks(self.arch.vec_reg_size() / 8)
                        .map(|chunk| {
                            chunk.iter().fold(0u128, |acc, &idx| (acc << 64) | u128::from(gp_table[idx as usize]))
                        })
                        .collect()
                });
                Input::ValuesFull {
                    gp,
                    fp,
                    vec,
                    instr_seq: instr_seq.clone(),
                    seq_len: *seq_len,
                    full_seq: *full_seq,
                }
            }
            other => other.clone(),
        }
    }
}

impl Generator for RandomDiffGenerator {
    fn generate(&self, counter: u64, n: u32) -> Result<Vec<Input>, GeneratorError> {
        (0..u64::from(n))
            .map(|i| self.generate_one(combined_seed(self.seed, counter.wrapping_add(i))))
            .collect()
    }

    fn get_build_flags(&self) -> (Vec<&'static str>, Vec<&'static str>) {
        let mut non_repro = Vec::new();
        if self.compress_send {
            non_repro.push("-DCOMPRESS_RECV");
        }
        non_repro.push("-DWITH_REGS");
        (Vec::new(), non_repro)
    }

    fn expand_for_reproducer(&self, input: &Input) -> Result<Input, GeneratorError> {
        Ok(self.resolve(input))
    }
}
