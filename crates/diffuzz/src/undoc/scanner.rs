// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sequential undocumented-encoding scanner (ch. 4.8).
//!
//! Walks the 32-bit encoding space in order rather than random-sampling
//! it: every word the instruction database doesn't already recognize is
//! executed on every connected client, and any client that doesn't reply
//! with the expected "illegal opcode" `SIGILL` gets logged - both to its
//! own per-client log and, clustered across clients, as a reproducer. A
//! shared progress file records the last position checkpointed so a scan
//! can resume instead of restarting at zero.
//!
//! Implements [`BatchRunner`] so this drives the same worker-pool/status
//! machinery as the diff engine, rather than its own bespoke loop.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{Arch, BuildFlags};
use crate::error::SessionError;
use crate::instr::InstructionDb;
use crate::reproducer::writer::write_undoc_reproducer;
use crate::reproducer::Reproducer;
use crate::scheduler::{BatchOutcome, BatchRunner};
use crate::session::{ClientMeta, ClientSession};
use crate::wire::{Input, Result, FILLER_64};

/// `signal.SIGILL` - the expected signal for any encoding that's actually
/// undocumented (ch. 4.8).
const SIGILL: u8 = 4;
/// `ILL_ILLOPC` - illegal-opcode `si_code`, the expected reason for that
/// `SIGILL` (ch. 4.8). Any other signal, or the right signal for the
/// wrong reason, means the encoding does something and is worth logging.
const ILL_ILLOPC: u32 = 1;

/// How often the progress file gets a checkpoint line even when nothing
/// was logged, so a resumed scan never has to redo more than this many
/// encodings of dead air.
const PROGRESS_GRANULARITY: u64 = 0xffff;

fn filler_u128() -> u128 {
    (u128::from(FILLER_64) << 64) | u128::from(FILLER_64)
}

/// Key for a client's own deviation log: hostname plus reported model
/// name, so two cores of the same machine share a log but two different
/// machines never collide (ch. 4.8).
fn client_file_key(meta: &ClientMeta) -> String {
    format!("{}-{}", meta.hostname, meta.tags.get("model_name").map(String::as_str).unwrap_or("unknown"))
}

/// Whether `word` is worth executing: the database doesn't already
/// disassemble it, and the optional errata filter doesn't want it
/// skipped either.
fn is_candidate(db: &InstructionDb, filter: Option<&(dyn Fn(u32) -> bool + Send + Sync)>, word: u32) -> bool {
    db.disassemble(word).is_none() && !filter.map(|f| f(word)).unwrap_or(false)
}

/// The progress-file checkpoint bucket a given encoding falls in.
fn progress_bucket(word: u32) -> u64 {
    u64::from(word) / PROGRESS_GRANULARITY
}

/// Why [`UndocScanner::analyze`] couldn't finish a word. Carries only what
/// `analyze` itself knows; `run_batch` fills in the `executed`/resume-range
/// fields a full [`BatchOutcome::ClientLost`] needs.
enum ScanLoss {
    ClientLost { hostname: String, unrelated: bool },
    BelowMinimumClients { remaining: usize },
}

/// Reads the last line of a progress file and parses it as a hex
/// encoding, for `--resume`. Returns `Ok(None)` if the file doesn't
/// exist or has no lines yet.
pub fn resume_start_at(path: &Path) -> std::io::Result<Option<u32>> {
    let Ok(file) = File::open(path) else { return Ok(None) };
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    Ok(last.and_then(|line| u32::from_str_radix(line.trim().trim_start_matches("0x"), 16).ok()))
}

/// Scans the encoding space sequentially, logging any client whose
/// behavior disagrees with "illegal opcode" for an encoding the database
/// doesn't already know (ch. 4.8).
pub struct UndocScanner {
    db: Arc<InstructionDb>,
    arch: Arch,
    flags: BuildFlags,
    clients: Mutex<Vec<Arc<ClientSession>>>,
    filter: Option<Box<dyn Fn(u32) -> bool + Send + Sync>>,
    repro_dir: PathBuf,
    progress_file: Mutex<File>,
    client_files: Mutex<HashMap<String, File>>,
    last_logged: AtomicU64,
    scanned_at: AtomicU64,
    analyzed: AtomicU64,
}

impl UndocScanner {
    pub fn new(
        db: Arc<InstructionDb>,
        arch: Arch,
        flags: BuildFlags,
        clients: Vec<Arc<ClientSession>>,
        output_dir: &Path,
        filter: Option<Box<dyn Fn(u32) -> bool + Send + Sync>>,
    ) -> std::io::Result<Self> {
        if matches!(arch, Arch::Riscv64) {
            log::warn!("undoc scanner: riscv64 walks the encoding space one byte at a time (scan_stride=1), not per 4-byte word");
        }

        let repro_dir = output_dir.join("reproducers");
        fs::create_dir_all(&repro_dir)?;

        let progress_path = output_dir.join("progress");
        let progress_file = OpenOptions::new().create(true).append(true).open(&progress_path)?;

        let mut client_files = HashMap::new();
        for client in &clients {
            let key = client_file_key(&client.meta);
            let file = OpenOptions::new().create(true).append(true).open(output_dir.join(&key))?;
            client_files.insert(key, file);
        }

        Ok(UndocScanner {
            db,
            arch,
            flags,
            clients: Mutex::new(clients),
            filter,
            repro_dir,
            progress_file: Mutex::new(progress_file),
            client_files: Mutex::new(client_files),
            last_logged: AtomicU64::new(0),
            scanned_at: AtomicU64::new(0),
            analyzed: AtomicU64::new(0),
        })
    }

    fn evict(&self, dead: &Arc<ClientSession>) -> usize {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|c| !Arc::ptr_eq(c, dead));
        clients.len()
    }

    fn log_client_hit(&self, meta: &ClientMeta, word: u32) {
        let key = client_file_key(meta);
        let mut files = self.client_files.lock().unwrap();
        let file = files
            .entry(key.clone())
            .or_insert_with(|| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.repro_dir.parent().unwrap_or(&self.repro_dir).join(&key))
                    .expect("undoc client log file must be openable")
            });
        let _ = writeln!(file, "0x{word:08x}");
    }

    /// Appends a progress checkpoint if this encoding logged something, or
    /// if enough encodings have passed since the last checkpoint
    /// (ch. 4.8: written "every ~0xffff encodings" regardless of hits).
    fn update_progress(&self, word: u32, logged: bool) {
        let cur = progress_bucket(word);
        let prev = self.last_logged.load(Ordering::SeqCst);
        if logged || cur != prev {
            self.last_logged.store(cur, Ordering::SeqCst);
            let mut file = self.progress_file.lock().unwrap();
            let _ = writeln!(file, "0x{word:08x}");
        }
    }

    /// Executes one candidate encoding on every live client and reports
    /// any deviation from the illegal-opcode convention.
    fn analyze(&self, word: u32) -> std::result::Result<(), ScanLoss> {
        let input = Input::ValuesFull {
            gp: vec![FILLER_64; self.arch.gp_count()],
            fp: if self.flags.floats { Some(vec![FILLER_64; self.arch.fp_count()]) } else { None },
            vec: if self.flags.vector { Some(vec![filler_u128(); self.arch.vec_count()]) } else { None },
            instr_seq: vec![word],
            seq_len: 1,
            full_seq: true,
        };
        let payload = input.pack(self.arch, self.flags);

        let clients = self.clients.lock().unwrap().clone();
        let tickets: Vec<u64> = clients.iter().map(|c| c.schedule(1, payload.clone(), false)).collect();

        let mut per_client: Vec<(ClientMeta, Result)> = Vec::with_capacity(clients.len());
        for (client, ticket) in clients.iter().zip(tickets) {
            match client.get_results(ticket) {
                Ok(mut multi) => {
                    if let Some(result) = multi.pop().and_then(|m| m.results.into_iter().next()) {
                        per_client.push((client.meta.clone(), result));
                    }
                }
                Err(SessionError::LostClient { unrelated, .. }) => {
                    let remaining = self.evict(client);
                    if remaining < 2 {
                        return Err(ScanLoss::BelowMinimumClients { remaining });
                    }
                    return Err(ScanLoss::ClientLost { hostname: client.meta.hostname.clone(), unrelated });
                }
                Err(_) => continue,
            }
        }

        let mut logged = false;
        for (meta, result) in &per_client {
            if result.signum != SIGILL || result.si_code != ILL_ILLOPC {
                self.log_client_hit(meta, word);
                logged = true;
            }
        }

        if logged {
            self.write_reproducer(word, &input, &per_client);
        }

        self.update_progress(word, logged);
        Ok(())
    }

    fn write_reproducer(&self, word: u32, input: &Input, per_client: &[(ClientMeta, Result)]) {
        let clustered = crate::diff::cluster::cluster(per_client);
        let result_to_clients: Vec<(Result, Vec<ClientMeta>)> =
            clustered.into_iter().map(|(result, metas)| (result.clone(), metas)).collect();

        let repro = Reproducer::build(&self.db, self.arch, self.flags, input, Some(u64::from(word)), &result_to_clients, Vec::new());
        if let Err(e) = write_undoc_reproducer(&self.repro_dir, word, &repro, &result_to_clients) {
            log::warn!("undoc scanner: failed to write reproducer for 0x{word:08x}: {e}");
        }
    }
}

impl BatchRunner for UndocScanner {
    fn run_batch(&self, _worker_index: usize, counter: u64, batch_size: u32) -> BatchOutcome {
        let stride = u64::from(self.arch.scan_stride());
        let until = (counter + u64::from(batch_size)).min(1u64 << 32);

        let mut instr = counter;
        let mut executed = 0u64;
        while instr < until {
            let word = instr as u32;
            if is_candidate(&self.db, self.filter.as_deref(), word) {
                match self.analyze(word) {
                    Ok(()) => executed += 1,
                    Err(ScanLoss::BelowMinimumClients { remaining }) => {
                        self.analyzed.fetch_add(executed, Ordering::SeqCst);
                        return BatchOutcome::BelowMinimumClients { remaining };
                    }
                    Err(ScanLoss::ClientLost { hostname, unrelated }) => {
                        self.analyzed.fetch_add(executed, Ordering::SeqCst);
                        return BatchOutcome::ClientLost {
                            hostname,
                            unrelated,
                            executed,
                            resume_at: instr,
                            resume_batch_size: (until - instr) as u32,
                        };
                    }
                }
            }
            instr += stride;
        }

        self.analyzed.fetch_add(executed, Ordering::SeqCst);
        self.scanned_at.store(until.saturating_sub(1), Ordering::SeqCst);
        BatchOutcome::Completed { executed }
    }

    fn extra_stats(&self) -> Vec<(String, String)> {
        let at = self.scanned_at.load(Ordering::SeqCst);
        let analyzed = self.analyzed.load(Ordering::SeqCst);
        let skipped_pct = if at == 0 { 0.0 } else { 100.0 * (1.0 - analyzed as f64 / at as f64) };
        vec![("At".to_string(), format!("0x{at:08x}")), ("Skipped".to_string(), format!("{skipped_pct:.1}%"))]
    }
}
