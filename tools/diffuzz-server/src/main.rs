// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! diffuzz-server - distributed differential instruction fuzzer server
//!
//! Two entrypoints behind one binary: `diff-fuzz` runs the fuzz scheduler
//! against the diff engine, `undoc-scan` runs the sequential
//! undocumented-encoding scanner. Both accept runner connections on the
//! same handshake protocol and drive the same worker-pool machinery
//! through a shared `BatchRunner`.

mod bootstrap;

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use diffuzz::config::{Arch, BuildFlags, GroupBy, RuntimeConfig};
use diffuzz::diff::DiffFuzzRunner;
use diffuzz::generator::{Generator, OfflineSeqGenerator, RandomDiffGenerator};
use diffuzz::instr::{fixture, InstructionDb};
use diffuzz::scheduler::{BatchRunner, FuzzScheduler};
use diffuzz::undoc::{resume_start_at, UndocScanner};

/// Distributed differential instruction fuzzer server
#[derive(Parser, Debug)]
#[command(name = "diffuzz-server")]
#[command(version)]
#[command(about = "Differential fuzz CPU hardware across a fleet of runner connections")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Target instruction set architecture under test
    #[arg(long, global = true, default_value = "aarch64")]
    arch: Arch,

    /// Address to accept runner connections on
    #[arg(long, global = true, default_value = "0.0.0.0:9999")]
    listen: String,

    /// Number of runner connections to wait for before starting
    #[arg(long, global = true, default_value_t = 2)]
    num_clients: usize,

    /// PRNG seed
    #[arg(long, global = true, default_value_t = 0)]
    seed: u32,

    /// Instruction sequence length per generated input
    #[arg(long, global = true, default_value_t = 3)]
    seq_len: u8,

    /// How connected sessions are grouped into logical clients
    #[arg(long, global = true, default_value = "hostname-microarch")]
    group_by: GroupBy,

    /// Expected ELF hash of the runner binary; sessions reporting any other hash are rejected
    #[arg(long, global = true)]
    elf_hash: Option<String>,

    /// Stop once the counter reaches this value
    #[arg(long, global = true)]
    until: Option<u64>,

    /// Counter value to start at (e.g. to resume a diff-fuzz run by hand)
    #[arg(long, global = true, default_value_t = 0)]
    start_counter: u64,

    /// Number of worker threads; defaults to RuntimeConfig's 50, forced to 1 by --single-step
    #[arg(long, global = true)]
    num_workers: Option<usize>,

    /// Run a single worker thread for step-by-step debugging
    #[arg(long, global = true)]
    single_step: bool,

    /// Output directory for reproducers and progress files
    #[arg(long, global = true, default_value = "diffuzz-out")]
    output_dir: PathBuf,

    /// Resume into an existing output directory instead of moving it aside
    #[arg(long, global = true)]
    resume: bool,

    /// YAML/JSON instruction DB file, overriding the embedded fixture set
    #[arg(long, global = true)]
    db_file: Option<PathBuf>,

    #[arg(long, global = true)]
    check_mem: bool,
    #[arg(long, global = true)]
    auto_map_mem: bool,
    #[arg(long, global = true)]
    vector: bool,
    #[arg(long, global = true)]
    floats: bool,
    #[arg(long, global = true)]
    meta: bool,
    #[arg(long, global = true)]
    compress_recv: bool,
    #[arg(long, global = true)]
    single_thread: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the fuzz scheduler against the diff engine
    DiffFuzz {
        /// General-purpose registers randomized per generated input
        #[arg(long, default_value_t = 4)]
        num_regs: u32,

        /// Weight mnemonic choice by the DB's extension-derived weights
        #[arg(long)]
        weighted: bool,

        /// Send only a seq_num per batch element, recomputing real values locally
        #[arg(long)]
        offline_seq: bool,

        /// Inputs generated per worker turn
        #[arg(long, default_value_t = 64)]
        batch_size: u32,
    },

    /// Runs the sequential undocumented-encoding scanner
    UndocScan {
        /// Encodings scanned per worker turn
        #[arg(long, default_value_t = diffuzz::config::UNDOC_BATCH_SIZE)]
        batch_size: u32,
    },
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    bootstrap::raise_nofile_limit();
    bootstrap::prepare_output_dir(&args.output_dir, args.resume)?;

    ctrlc::set_handler(|| {
        log::info!("received interrupt, exiting");
        std::process::exit(0);
    })?;

    let db = load_db(args)?;
    let listener = TcpListener::bind(&args.listen)?;
    let base_flags = build_flags(args);

    match &args.command {
        Command::DiffFuzz { num_regs, weighted, offline_seq, batch_size } => {
            run_diff_fuzz(args, base_flags, db, &listener, *num_regs, *weighted, *offline_seq, *batch_size)
        }
        Command::UndocScan { batch_size } => run_undoc_scan(args, base_flags, db, &listener, *batch_size),
    }
}

fn load_db(args: &Args) -> Result<Arc<InstructionDb>, Box<dyn std::error::Error>> {
    if let Some(path) = &args.db_file {
        let text = std::fs::read_to_string(path)?;
        let db = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => fixture::load_json(&text)?,
            _ => fixture::load_yaml(&text)?,
        };
        Ok(Arc::new(db))
    } else {
        Ok(Arc::new(match args.arch {
            Arch::Aarch64 => fixture::embedded_aarch64(),
            Arch::Riscv64 => fixture::embedded_riscv64(),
        }))
    }
}

fn build_flags(args: &Args) -> BuildFlags {
    BuildFlags {
        meta: args.meta,
        check_mem: args.check_mem,
        auto_map_mem: args.auto_map_mem,
        vector: args.vector,
        floats: args.floats,
        with_regs: false,
        with_full_regs: false,
        just_seq_num: false,
        compress_recv: args.compress_recv,
        single_thread: args.single_thread,
        max_seq_len: args.seq_len,
    }
}

fn worker_count(args: &Args) -> usize {
    if args.single_step {
        return 1;
    }
    args.num_workers.unwrap_or_else(|| RuntimeConfig::new(args.arch, args.seed).effective_worker_count())
}

fn run_diff_fuzz(
    args: &Args,
    mut flags: BuildFlags,
    db: Arc<InstructionDb>,
    listener: &TcpListener,
    num_regs: u32,
    weighted: bool,
    offline_seq: bool,
    batch_size: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    if offline_seq {
        flags.just_seq_num = true;
    } else {
        flags.with_regs = true;
    }

    let sessions =
        bootstrap::accept_sessions(listener, args.arch, flags, batch_size, u64::from(args.seed), args.elf_hash.as_deref(), args.num_clients);
    let groups = bootstrap::group_sessions(sessions, args.group_by);
    if groups.len() < 2 {
        return Err(format!("need at least two client groups to diff against, got {}", groups.len()).into());
    }

    let inner = RandomDiffGenerator::new(db.clone(), args.arch, flags, args.seq_len, num_regs, args.seed, weighted);
    let generator: Box<dyn Generator> =
        if offline_seq { Box::new(OfflineSeqGenerator::new(inner, args.seq_len)) } else { Box::new(inner) };

    let repro_dir = args.output_dir.join("reproducers");
    let runner: Arc<dyn BatchRunner> = Arc::new(DiffFuzzRunner::new(db, args.arch, flags, generator, groups, repro_dir));

    let scheduler = FuzzScheduler::new(args.start_counter, batch_size, args.until);
    scheduler.run(runner, worker_count(args));
    Ok(())
}

fn run_undoc_scan(
    args: &Args,
    flags: BuildFlags,
    db: Arc<InstructionDb>,
    listener: &TcpListener,
    batch_size: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    if !flags.check_mem || !matches!(args.group_by, GroupBy::HostnameMicroarch) {
        return Err("undoc-scan requires --check-mem and --group-by hostname-microarch".into());
    }

    let sessions =
        bootstrap::accept_sessions(listener, args.arch, flags, batch_size, u64::from(args.seed), args.elf_hash.as_deref(), args.num_clients);

    let progress_path = args.output_dir.join("progress");
    let start_counter = if args.resume {
        resume_start_at(&progress_path)?.map(u64::from).unwrap_or(args.start_counter)
    } else {
        args.start_counter
    };

    let scanner = UndocScanner::new(db, args.arch, flags, sessions, &args.output_dir, None)?;
    let runner: Arc<dyn BatchRunner> = Arc::new(scanner);

    // The encoding space is 32 bits; never run past it even without --until.
    let until = args.until.unwrap_or(1u64 << 32);
    let scheduler = FuzzScheduler::new(start_counter, batch_size, Some(until));
    scheduler.run(runner, worker_count(args));
    Ok(())
}
