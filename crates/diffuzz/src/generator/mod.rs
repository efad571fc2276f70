// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deterministic `counter -> Input` generators (ch. 4.5).
//!
//! The source models this as an abstract `Generator`/`DiffFuzzGenerator`
//! class pair; here it's a trait so the scheduler can hold a
//! `Box<dyn Generator>` and stay agnostic to which strategy is wired in.

pub mod fuzzing_value_map;
pub mod offline_seq;
pub mod random_diff;

pub use offline_seq::OfflineSeqGenerator;
pub use random_diff::RandomDiffGenerator;

use crate::config::BuildFlags;
use crate::error::GeneratorError;
use crate::wire::Input;

/// A strategy for turning a monotonic counter into a batch of inputs.
///
/// `generate` must be pure: the same `(counter, n)` pair always produces
/// the same inputs for a generator built with the same seed, since the
/// scheduler relies on this to resume at an arbitrary counter after a
/// restart and to regenerate the exact input a reproducer names.
pub trait Generator: Send + Sync {
    fn generate(&self, counter: u64, n: u32) -> Result<Vec<Input>, GeneratorError>;

    /// `(repro_flags, non_repro_flags)` this generator contributes on top
    /// of whatever the caller already collected (ch. 4.5, ch. 6).
    fn get_build_flags(&self) -> (Vec<&'static str>, Vec<&'static str>) {
        (Vec::new(), Vec::new())
    }

    /// Runs once before the runner binary is built, with the full
    /// resolved flag set. No-op unless a generator needs it (ch. 4.5).
    fn early_init(&mut self, _build_flags: &BuildFlags) -> Result<(), GeneratorError> {
        Ok(())
    }

    /// Runs once after the runner binary is built. No-op unless a
    /// generator needs it (ch. 4.5).
    fn late_init(&mut self, _build_flags: &BuildFlags) -> Result<(), GeneratorError> {
        Ok(())
    }

    /// Whether inputs from this generator need a follow-up expansion to
    /// `ValuesFull` once the runner reports which registers it touched
    /// (ch. 4.5: `expand_inputs_after_exec`).
    fn expand_inputs_after_exec(&self) -> bool {
        false
    }

    /// Resolves a not-yet-resolved input (`RegSelect`, a single-item
    /// `JustSeqNum`) into the real `ValuesFull` a reproducer needs (ch. 4.5,
    /// ch. 4.7). Default assumes `input` is already resolved.
    fn expand_for_reproducer(&self, input: &Input) -> Result<Input, GeneratorError> {
        Ok(input.clone())
    }
}
