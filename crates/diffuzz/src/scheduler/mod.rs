// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker pool driving the fuzz loop (ch. 4.6).
//!
//! Generalizes the source's `FuzzServer`/`Worker` pair (one concrete
//! subclass for diffing, a second for the undocumented-encoding scan) into
//! one scheduler parameterized over a [`BatchRunner`] trait object, so
//! both ch. 4.7's diff engine and ch. 4.8's undoc scanner drive the same
//! worker-pool/degradation/status-line machinery instead of duplicating it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Warm-up delay before the first status line is printed, so the initial
/// rate sample isn't skewed by startup (ch. 4.6).
const WARMUP: Duration = Duration::from_secs(9);
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// What a worker's attempt at one batch produced.
pub enum BatchOutcome {
    /// `executed` inputs were fully processed; resume at the next batch.
    Completed { executed: u64 },
    /// A client died mid-batch: `executed` inputs before the failure are
    /// credited, and `[resume_at, resume_at+resume_batch_size)` is the
    /// still-unexecuted remainder the worker should retry against the
    /// post-eviction client set, instead of claiming a fresh counter range.
    ClientLost { hostname: String, unrelated: bool, executed: u64, resume_at: u64, resume_batch_size: u32 },
    /// Fewer than two sessions remain; this worker has nothing left to
    /// differentially compare against and should exit (ch. 4.6).
    BelowMinimumClients { remaining: usize },
}

/// One fuzzing strategy's per-batch unit of work (ch. 4.7's diff worker,
/// ch. 4.8's undoc scanner).
pub trait BatchRunner: Send + Sync {
    /// Processes `batch_size` inputs starting at `counter` for worker
    /// `worker_index`. Implementations own their own client list and
    /// generator; `counter` is globally unique per call since the
    /// scheduler hands it out under its own lock.
    fn run_batch(&self, worker_index: usize, counter: u64, batch_size: u32) -> BatchOutcome;

    /// Extra `(label, value)` pairs appended to the status line, e.g. the
    /// diff engine's reproducer count or the undoc scanner's skip ratio
    /// (ch. 4.6).
    fn extra_stats(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Formats a duration as `NdNhNmNs`, dropping leading zero components
/// (ch. 4.6).
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (days, rest) = (total / 86_400, total % 86_400);
    let (hours, rest) = (rest / 3_600, rest % 3_600);
    let (minutes, seconds) = (rest / 60, rest % 60);

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d"));
    }
    if days > 0 || hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if days > 0 || hours > 0 || minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    out.push_str(&format!("{seconds}s"));
    out
}

/// Drives a worker pool over a [`BatchRunner`], printing a periodic status
/// line the way ch. 4.6 describes: cleared and rewritten in place, and
/// serialized against ad hoc worker console output so the two never
/// interleave.
pub struct FuzzScheduler {
    counter: AtomicU64,
    executed_counter: AtomicU64,
    finished: AtomicBool,
    print_lock: Mutex<()>,
    batch_size: u32,
    until: Option<u64>,
    warmup: Duration,
    status_interval: Duration,
}

impl FuzzScheduler {
    pub fn new(start_counter: u64, batch_size: u32, until: Option<u64>) -> Self {
        FuzzScheduler {
            counter: AtomicU64::new(start_counter),
            executed_counter: AtomicU64::new(start_counter),
            finished: AtomicBool::new(false),
            print_lock: Mutex::new(()),
            batch_size,
            until,
            warmup: WARMUP,
            status_interval: STATUS_INTERVAL,
        }
    }

    /// Builds a scheduler with custom status-line timing, for callers
    /// (unit tests, the binary crate's own integration tests) that don't
    /// want to wait out the real `WARMUP` delay.
    pub fn with_intervals(start_counter: u64, batch_size: u32, until: Option<u64>, warmup: Duration, status_interval: Duration) -> Self {
        let mut scheduler = Self::new(start_counter, batch_size, until);
        scheduler.warmup = warmup;
        scheduler.status_interval = status_interval;
        scheduler
    }

    /// Prints `msg`, holding the same lock the status line uses, so worker
    /// output is never interleaved with a status refresh (ch. 4.6).
    pub fn print(&self, msg: &str) {
        let _guard = self.print_lock.lock().unwrap();
        println!("\x1b[K{msg}");
    }

    /// Total inputs credited as executed so far (ch. 4.6).
    pub fn executed_count(&self) -> u64 {
        self.executed_counter.load(Ordering::SeqCst)
    }

    fn claim_batch(&self) -> u64 {
        self.counter.fetch_add(u64::from(self.batch_size), Ordering::SeqCst)
    }

    /// Spawns `num_workers` worker threads plus one status-printing
    /// thread, and blocks until every worker exits (ch. 4.6).
    pub fn run(&self, runner: Arc<dyn BatchRunner>, num_workers: usize) {
        let start_counter = self.executed_counter.load(Ordering::SeqCst);

        thread::scope(|scope| {
            for w in 0..num_workers {
                let runner = Arc::clone(&runner);
                scope.spawn(move || self.worker_loop(w, &*runner));
            }

            scope.spawn(|| self.status_loop(&*runner, start_counter));
        });
    }

    fn worker_loop(&self, worker_index: usize, runner: &dyn BatchRunner) {
        loop {
            if self.finished.load(Ordering::SeqCst) {
                return;
            }
            let counter = self.claim_batch();
            if let Some(until) = self.until {
                if counter >= until {
                    self.finished.store(true, Ordering::SeqCst);
                    return;
                }
            }

            if self.run_claimed_range(worker_index, runner, counter, self.batch_size) {
                return;
            }
        }
    }

    /// Drives one claimed `[counter, counter+batch_size)` range to
    /// completion, retrying the still-unexecuted remainder in place
    /// whenever a client dies mid-batch (ch. 4.6) rather than abandoning it
    /// to a freshly claimed range. Returns `true` if the worker should exit.
    fn run_claimed_range(&self, worker_index: usize, runner: &dyn BatchRunner, mut counter: u64, mut batch_size: u32) -> bool {
        loop {
            match runner.run_batch(worker_index, counter, batch_size) {
                BatchOutcome::Completed { executed } => {
                    self.executed_counter.fetch_add(executed, Ordering::SeqCst);
                    return false;
                }
                BatchOutcome::ClientLost { hostname, unrelated, executed, resume_at, resume_batch_size } => {
                    if executed > 0 {
                        self.executed_counter.fetch_add(executed, Ordering::SeqCst);
                    }
                    if !unrelated {
                        self.print(&format!(
                            "worker {worker_index:3} lost client {hostname} at counter {counter}"
                        ));
                    } else if worker_index == 0 {
                        self.print(&format!(
                            "worker {worker_index:3} lost client {hostname} at counter {counter} (unrelated)"
                        ));
                    }
                    counter = resume_at;
                    batch_size = resume_batch_size;
                }
                BatchOutcome::BelowMinimumClients { remaining } => {
                    self.print(&format!(
                        "quitting worker {worker_index:3}: only {remaining} client(s) remain"
                    ));
                    return true;
                }
            }
        }
    }

    fn status_loop(&self, runner: &dyn BatchRunner, start_counter: u64) {
        thread::sleep(self.warmup);
        let start = Instant::now();
        loop {
            thread::sleep(self.status_interval);
            if self.finished.load(Ordering::SeqCst) {
                return;
            }

            let executed = self.executed_counter.load(Ordering::SeqCst);
            let elapsed = start.elapsed();
            let elapsed_secs = elapsed.as_secs().max(1);
            let rate = (executed - start_counter) / elapsed_secs;

            let mut fields = vec![
                ("Counter".to_string(), executed.to_string()),
                ("Elapsed".to_string(), format_elapsed(elapsed)),
                ("Inp/s".to_string(), rate.to_string()),
            ];
            fields.extend(runner.extra_stats());

            let line: Vec<String> = fields.into_iter().map(|(k, v)| format!("{k}: {v}")).collect();
            let _guard = self.print_lock.lock().unwrap();
            print!("\x1b[K{}\r", line.join(" | "));
            use std::io::Write;
            let _ = std::io::stdout().flush();
        }
    }
}
