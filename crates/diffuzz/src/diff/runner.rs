// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Diff-fuzz worker: the [`BatchRunner`] that drives the generator, every
//! logical client group, the minimal-diff tree search and the reproducer
//! writer as one unit (ch. 4.6, ch. 4.7).
//!
//! A [`Generator`] may pack more than one logical input per wire message
//! (`ch. 4.5`'s `JustSeqNum`, which carries a whole batch in one message),
//! so a `run_batch` call first schedules each message returned by
//! `generate` once per client group, then walks every virtual item inside
//! that message's reply individually for diffing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{Arch, BuildFlags};
use crate::diff::filters::filters;
use crate::diff::tree::{find_minimal_diff_tree, DiffSplit};
use crate::error::ReproducerError;
use crate::generator::Generator;
use crate::instr::InstructionDb;
use crate::reproducer::{Reproducer, ReproducerWriter};
use crate::scheduler::{BatchOutcome, BatchRunner};
use crate::session::{ClientMeta, MultiClient};
use crate::wire::{FilteredResult, Input, MultiResult, Result};

/// Truncates an already-expanded input's instruction sequence to the first
/// `seq_len` steps, the way a minimal-diff split names how much of the
/// original sequence actually reproduces the disagreement (ch. 4.7).
fn truncate_to_seq_len(input: &Input, seq_len: u8) -> Input {
    match input {
        Input::ValuesFull { gp, fp, vec, instr_seq, full_seq, .. } => Input::ValuesFull {
            gp: gp.clone(),
            fp: fp.clone(),
            vec: vec.clone(),
            instr_seq: instr_seq[..seq_len as usize].to_vec(),
            seq_len,
            full_seq: *full_seq,
        },
        Input::RegSelect { gp_select, fp_select, vec_select, instr_seq, full_seq, .. } => Input::RegSelect {
            gp_select: gp_select.clone(),
            fp_select: fp_select.clone(),
            vec_select: vec_select.clone(),
            instr_seq: instr_seq[..seq_len as usize].to_vec(),
            seq_len,
            full_seq: *full_seq,
        },
        Input::ValuesSparse { gp, fp, vec, instr_seq, full_seq, .. } => Input::ValuesSparse {
            gp: gp.clone(),
            fp: fp.clone(),
            vec: vec.clone(),
            instr_seq: instr_seq[..seq_len as usize].to_vec(),
            seq_len,
            full_seq: *full_seq,
        },
        Input::JustSeqNum { seq_num, batch_count, full_seq, .. } => {
            Input::JustSeqNum { seq_num: *seq_num, batch_count: *batch_count, seq_len, full_seq: *full_seq }
        }
    }
}

/// Rebuilds the single-item input a given virtual slot within a generated
/// message corresponds to. Every variant but `JustSeqNum` already is one
/// item per message (`n_results == 1`, `item == 0`); `JustSeqNum` packs
/// `batch_count` virtual items behind one `seq_num` base (ch. 4.5).
fn item_input(input: &Input, counter: u64, item: u32) -> Input {
    match input {
        Input::JustSeqNum { seq_len, full_seq, .. } => {
            Input::JustSeqNum { seq_num: counter + u64::from(item), batch_count: 1, seq_len: *seq_len, full_seq: *full_seq }
        }
        other => other.clone(),
    }
}

fn n_results_for(input: &Input) -> u32 {
    match input {
        Input::JustSeqNum { batch_count, .. } => u32::from(*batch_count),
        _ => 1,
    }
}

/// The ch. 4.7 diff engine: schedules generated inputs across every client
/// group, clusters their results, and writes a reproducer wherever the
/// minimal-diff tree search still finds a disagreement after filtering.
pub struct DiffFuzzRunner {
    db: Arc<InstructionDb>,
    arch: Arch,
    flags: BuildFlags,
    generator: Box<dyn Generator>,
    clients: Mutex<Vec<Arc<MultiClient>>>,
    writer: ReproducerWriter,
    reproducers_written: AtomicU64,
}

impl DiffFuzzRunner {
    pub fn new(
        db: Arc<InstructionDb>,
        arch: Arch,
        flags: BuildFlags,
        generator: Box<dyn Generator>,
        clients: Vec<Arc<MultiClient>>,
        repro_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        DiffFuzzRunner {
            db,
            arch,
            flags,
            generator,
            clients: Mutex::new(clients),
            writer: ReproducerWriter::new(repro_dir),
            reproducers_written: AtomicU64::new(0),
        }
    }

    fn evict(&self, dead_index: usize) -> usize {
        let mut clients = self.clients.lock().unwrap();
        if dead_index < clients.len() {
            clients.remove(dead_index);
        }
        clients.len()
    }

    /// Runs the minimal-diff tree search over one virtual item's per-step
    /// results and writes a reproducer for every split it reports.
    fn process_item(&self, clients: &[Arc<MultiClient>], step_results: &[Vec<Result>], item: &Input, virtual_counter: u64) {
        let seq_len = item.seq_len();
        let arch = self.arch;
        let client_indices: Vec<usize> = (0..clients.len()).collect();

        // (0, hostname, core_index) for a client with known metadata; a missing
        // sample sorts after every client with one.
        let client_key = |idx: &usize| -> (u8, String, u32) {
            match clients.get(*idx).and_then(|c| c.meta_sample()) {
                Some(meta) => {
                    let (hostname, core_index) = meta.identifier();
                    (0, hostname, core_index)
                }
                None => (1, String::new(), 0),
            }
        };

        let splits = find_minimal_diff_tree(seq_len, client_indices, client_key, |step| {
            let results: Vec<(usize, Result)> =
                (0..clients.len()).map(|c| (c, step_results[c][(step - 1) as usize].clone())).collect();
            let filtered: Vec<(usize, FilteredResult)> = results
                .iter()
                .cloned()
                .map(|(c, r)| (c, FilteredResult { result: r, filter: Box::new(move |a: &Result, b: &Result| filters(arch, a, b)) }))
                .collect();
            (results, filtered)
        });

        for split in splits {
            self.write_split(clients, item, virtual_counter, split);
        }
    }

    fn write_split(&self, clients: &[Arc<MultiClient>], item: &Input, virtual_counter: u64, split: DiffSplit<usize>) {
        let expanded = match self.generator.expand_for_reproducer(item) {
            Ok(expanded) => expanded,
            Err(e) => {
                log::warn!("diff runner: failed to expand counter {virtual_counter} for a reproducer: {e}");
                return;
            }
        };
        let truncated = truncate_to_seq_len(&expanded, split.seq_len);

        let result_to_clients: Vec<(Result, Vec<ClientMeta>)> = split
            .result_to_clients
            .into_iter()
            .map(|(result, client_idxs)| {
                let metas = client_idxs.iter().filter_map(|&idx| clients.get(idx).and_then(|c| c.meta_sample())).collect();
                (result, metas)
            })
            .collect();

        let repro = Reproducer::build(&self.db, self.arch, self.flags, &truncated, Some(virtual_counter), &result_to_clients, Vec::new());

        match self.writer.write(&repro, virtual_counter, &result_to_clients) {
            Ok(_) => {
                self.reproducers_written.fetch_add(1, Ordering::SeqCst);
            }
            Err(ReproducerError::CapReached { cap }) => {
                log::error!("diff runner: reproducer cap of {cap} reached, exiting");
                std::process::exit(1);
            }
            Err(e) => {
                log::warn!("diff runner: failed to write reproducer for counter {virtual_counter}: {e}");
            }
        }
    }
}

impl BatchRunner for DiffFuzzRunner {
    fn run_batch(&self, _worker_index: usize, counter: u64, batch_size: u32) -> BatchOutcome {
        let inputs = self
            .generator
            .generate(counter, batch_size)
            .expect("generator error indicates a configuration bug, not a transient condition");

        let clients = self.clients.lock().unwrap().clone();
        if clients.len() < 2 {
            return BatchOutcome::BelowMinimumClients { remaining: clients.len() };
        }

        let mut item_offset = 0u64;
        let mut executed = 0u64;

        for input in &inputs {
            let n_results = n_results_for(input);
            let payload = input.pack(self.arch, self.flags);

            let mut per_client_results: Vec<Vec<MultiResult>> = Vec::with_capacity(clients.len());
            let mut lost: Option<usize> = None;

            for (idx, client) in clients.iter().enumerate() {
                let Some(ticket) = client.schedule(n_results, payload.clone(), false) else {
                    lost = Some(idx);
                    break;
                };
                match client.get_results(ticket) {
                    Ok(results) => per_client_results.push(results),
                    Err(_) => {
                        lost = Some(idx);
                        break;
                    }
                }
            }

            if let Some(idx) = lost {
                let hostname = clients.get(idx).and_then(|c| c.meta_sample()).map(|m| m.hostname).unwrap_or_else(|| "unknown".to_string());
                let remaining = self.evict(idx);
                if remaining < 2 {
                    return BatchOutcome::BelowMinimumClients { remaining };
                }
                return BatchOutcome::ClientLost {
                    hostname,
                    unrelated: false,
                    executed,
                    resume_at: counter + item_offset,
                    resume_batch_size: (u64::from(batch_size) - item_offset) as u32,
                };
            }

            for j in 0..n_results {
                let virtual_counter = counter + item_offset + u64::from(j);
                let item = item_input(input, counter + item_offset, j);
                let step_results: Vec<Vec<Result>> =
                    per_client_results.iter().map(|client_results| client_results[j as usize].results.clone()).collect();
                self.process_item(&clients, &step_results, &item, virtual_counter);
                executed += 1;
            }
            item_offset += u64::from(n_results.max(1));
        }

        BatchOutcome::Completed { executed }
    }

    fn extra_stats(&self) -> Vec<(String, String)> {
        vec![("Reproducers".to_string(), self.reproducers_written.load(Ordering::SeqCst).to_string())]
    }
}
