// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reproducer data model (ch. 3, ch. 6 "Reproducer YAML").
//!
//! Plain `serde`-derived structs; field order is declaration order, which
//! `serde_yaml` preserves (no alphabetical re-sort, matching the source's
//! `yaml.dump(d, sort_keys=False)`). Hex rendering is a writer-side
//! concern (`super::writer`), not modeled here — these stay ordinary
//! integers so the derive stays simple.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::config::{Arch, BuildFlags};
use crate::instr::InstructionDb;
use crate::session::ClientMeta;
use crate::wire::{fp_names, gp_names, reg_table, vec_names, Input, MemDiff, RegValue, Result};

#[derive(Debug, Clone, Serialize)]
pub struct ReproducerRegs {
    pub gp: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fp: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vec: Option<BTreeMap<String, u128>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReproducerInput {
    pub instr_seq: Vec<u32>,
    /// Our own mask-map disassembly of each word. The source also cross
    /// checks against `capstone`/`mra`; those are external disassembler
    /// bindings this crate doesn't carry, so they're left out here.
    pub dis_opcodes: Vec<String>,
    pub regs: ReproducerRegs,
}

impl ReproducerInput {
    /// Builds from an already-expanded `Input::ValuesFull`. Panics on any
    /// other variant — callers must expand via `Input::to_values_full`
    /// (or a generator's `resolve`) first, same precondition as
    /// `Input::to_values_full` itself documents.
    pub fn from_values_full(db: &InstructionDb, arch: Arch, input: &Input) -> Self {
        let Input::ValuesFull { gp, fp, vec, instr_seq, .. } = input else {
            panic!("reproducer input must be pre-expanded to ValuesFull");
        };

        let dis_opcodes = instr_seq
            .iter()
            .map(|word| db.disassemble(*word).unwrap_or("unknown").to_string())
            .collect();

        let gp = gp_names(arch).iter().zip(gp.iter()).map(|(name, v)| (name.to_string(), *v)).collect();
        let fp = fp.as_ref().map(|values| fp_names(arch).iter().zip(values.iter()).map(|(name, v)| (name.to_string(), *v)).collect());
        let vec = vec.as_ref().map(|values| vec_names(arch).iter().zip(values.iter()).map(|(name, v)| (name.to_string(), *v)).collect());

        ReproducerInput { instr_seq: instr_seq.clone(), dis_opcodes, regs: ReproducerRegs { gp, fp, vec } }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReproducerMemDiff {
    pub start: u64,
    pub n: u32,
    pub val: u128,
    pub checksum: u32,
}

impl From<&MemDiff> for ReproducerMemDiff {
    fn from(d: &MemDiff) -> Self {
        ReproducerMemDiff { start: d.start, n: d.n, val: d.val_prefix, checksum: d.crc32 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReproducerResultFields {
    pub signum: u8,
    pub si_addr: u64,
    pub si_pc: u64,
    pub si_code: u32,
    pub regs_after: BTreeMap<String, u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_diffs: Option<Vec<ReproducerMemDiff>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_diff: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instret_diff: Option<u16>,
}

impl ReproducerResultFields {
    pub fn from_result(result: &Result, arch: Arch, flags: BuildFlags) -> Self {
        let table = reg_table(arch, flags);
        let regs_after = result
            .regs
            .iter()
            .map(|(index, value)| {
                let name = table
                    .get(*index as usize)
                    .map(|(name, _)| name.to_string())
                    .unwrap_or_else(|| index.to_string());
                let value = match value {
                    RegValue::Scalar(v) => *v as u128,
                    RegValue::Vector(v) => *v,
                };
                (name, value)
            })
            .collect();

        ReproducerResultFields {
            signum: result.signum,
            si_addr: result.si_addr,
            si_pc: result.si_pc,
            si_code: result.si_code,
            regs_after,
            mem_diffs: result.mem_diffs.as_ref().map(|diffs| diffs.iter().map(ReproducerMemDiff::from).collect()),
            cycle_diff: result.cycle_diff,
            instret_diff: result.instret_diff,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientMicroarchSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midr: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    pub hostname: String,
    pub num_cpus: u32,
    pub n_core: u32,
    pub microarchitecture: ClientMicroarchSummary,
    pub tags: BTreeMap<String, String>,
}

impl From<&ClientMeta> for ClientSummary {
    fn from(meta: &ClientMeta) -> Self {
        ClientSummary {
            hostname: meta.hostname.clone(),
            num_cpus: meta.num_cpus,
            n_core: meta.core_index,
            microarchitecture: ClientMicroarchSummary { midr: meta.midr(), model_name: meta.tags.get("model_name").cloned() },
            tags: meta.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReproducerResultEntry {
    pub result: ReproducerResultFields,
    pub clients: Vec<ClientSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Mapping {
    pub start: u64,
    pub n: u32,
    pub prot: String,
    pub val: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reproducer {
    pub input: ReproducerInput,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ReproducerResultEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mappings: Vec<Mapping>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<u64>,
    pub arch: String,
    pub flags: Vec<String>,
}

impl Reproducer {
    /// Builds a reproducer from a minimal-diff tree split (ch. 4.7):
    /// `result_to_clients` is a cluster's raw results paired with the
    /// real clients that produced them.
    pub fn build(
        db: &InstructionDb,
        arch: Arch,
        flags: BuildFlags,
        input: &Input,
        counter: Option<u64>,
        result_to_clients: &[(Result, Vec<ClientMeta>)],
        mappings: Vec<Mapping>,
    ) -> Self {
        let full_input = input.to_values_full(arch, flags);
        let input = ReproducerInput::from_values_full(db, arch, &full_input);

        let results = result_to_clients
            .iter()
            .map(|(result, clients)| ReproducerResultEntry {
                result: ReproducerResultFields::from_result(result, arch, flags),
                clients: clients.iter().map(ClientSummary::from).collect(),
            })
            .collect();

        Reproducer {
            input,
            results,
            mappings,
            counter,
            arch: arch.as_str().to_string(),
            flags: flags.repro_flags().into_iter().map(str::to_string).collect(),
        }
    }

    /// Union of every pairwise diff field name across all clusters
    /// (ch. 4.7's "log_repro"/`all_diffs`), used for the comment header.
    pub fn all_diff_field_names(result_to_clients: &[(Result, Vec<ClientMeta>)]) -> BTreeSet<String> {
        let mut diffs = BTreeSet::new();
        for i in 0..result_to_clients.len() {
            for j in (i + 1)..result_to_clients.len() {
                diffs.extend(result_to_clients[i].0.diff_fields(&result_to_clients[j].0));
            }
        }
        diffs
    }
}
