// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Canonical reproducer writer (ch. 4.7, ch. 6 "Reproducer YAML").
//!
//! Two things the plain `serde_yaml` serialization of [`Reproducer`] can't
//! do on its own: hex-rendered integers and a `# ...` comment preamble.
//! Both are handled here as a post-processing pass over the serialized
//! tree rather than in `model.rs`, so the model stays a plain derive.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_yaml::Value;

use crate::config::REPRODUCER_CAP;
use crate::error::ReproducerError;
use crate::session::ClientMeta;
use crate::wire::Result;

use super::model::Reproducer;

/// Rewrites every integer scalar in a serialized tree to a `0x...`-prefixed
/// string, mirroring the source's global `hexint_presenter` registered for
/// `int` (every integer dumped through `yaml.dump` takes this form, not
/// just a chosen few fields).
fn hexify(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::String(format!("0x{u:x}"))
            } else if let Some(i) = n.as_i64() {
                if i < 0 {
                    Value::String(format!("-0x{:x}", -i as i128))
                } else {
                    Value::String(format!("0x{i:x}"))
                }
            } else {
                Value::Number(n)
            }
        }
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(hexify).collect()),
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in map {
                out.insert(hexify(k), hexify(v));
            }
            Value::Mapping(out)
        }
        other => other,
    }
}

/// Renders a reproducer to the hex-integer YAML body (no comment header).
pub fn to_hex_yaml(repro: &Reproducer) -> Result_<String> {
    let value = serde_yaml::to_value(repro)?;
    let hexed = hexify(value);
    Ok(serde_yaml::to_string(&hexed)?)
}

type Result_<T> = std::result::Result<T, ReproducerError>;

/// One line per cluster: its clients plus a short result summary, used in
/// the `to_yaml_with_comments` preamble (ch. 4.7's `result_to_clients_to_str`).
fn cluster_header(result: &Result, clients: &[ClientMeta]) -> String {
    let client_names: Vec<String> = clients
        .iter()
        .map(|c| format!("{}(core {})", c.hostname, c.core_index))
        .collect();
    format!("{}: signum={}", client_names.join(", "), result.signum)
}

/// The `# ...`-prefixed comment block prepended above the YAML body: the
/// set of field names that differ across every pair of clusters, then one
/// header line per cluster (ch. 4.7).
pub fn comment_header(result_to_clients: &[(Result, Vec<ClientMeta>)]) -> String {
    let diffs = Reproducer::all_diff_field_names(result_to_clients);
    let diff_lines: Vec<String> = diffs.iter().map(|d| format!("{d} differs")).collect();
    let cluster_lines: Vec<String> = result_to_clients.iter().map(|(r, c)| cluster_header(r, c)).collect();

    let mut lines = diff_lines;
    lines.push(String::new());
    lines.extend(cluster_lines);
    lines.iter().map(|l| format!("# {l}").trim_end().to_string()).collect::<Vec<_>>().join("\n")
}

/// Monotonic reproducer filename: `reproducer-<repro_n:08>-<counter:012>.yaml`.
pub fn filename(repro_n: u64, counter: u64) -> String {
    format!("reproducer-{repro_n:08}-{counter:012}.yaml")
}

/// Writes one undocumented-encoding reproducer, named by the encoding
/// itself rather than a monotonic counter (ch. 4.8). No cap applies here:
/// the encoding space already bounds how many of these can ever exist.
pub fn write_undoc_reproducer(
    dir: &Path,
    instr: u32,
    repro: &Reproducer,
    result_to_clients: &[(Result, Vec<ClientMeta>)],
) -> Result_<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("0x{instr:08x}.yaml"));
    let body = format!("{}\n\n{}", comment_header(result_to_clients), to_hex_yaml(repro)?);
    fs::write(&path, body)?;
    Ok(path)
}

/// Writes reproducers under a fixed output directory, tracking the
/// monotonic `repro_n` counter and the hard cap on total files written
/// (ch. 4.7: "Around 1GB" in the source's comment, ~300,000 files).
pub struct ReproducerWriter {
    dir: PathBuf,
    repro_n: AtomicU64,
    cap: u64,
}

impl ReproducerWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ReproducerWriter { dir: dir.into(), repro_n: AtomicU64::new(0), cap: REPRODUCER_CAP }
    }

    #[cfg(test)]
    fn with_cap(dir: impl Into<PathBuf>, cap: u64) -> Self {
        ReproducerWriter { dir: dir.into(), repro_n: AtomicU64::new(0), cap }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes one reproducer and returns its path. Returns
    /// `ReproducerError::CapReached` once the cap is hit; the caller (the
    /// scheduler's degradation path, ch. 4.6) is responsible for exiting.
    pub fn write(&self, repro: &Reproducer, counter: u64, result_to_clients: &[(Result, Vec<ClientMeta>)]) -> Result_<PathBuf> {
        let repro_n = self.repro_n.fetch_add(1, Ordering::SeqCst) + 1;
        if repro_n > self.cap {
            return Err(ReproducerError::CapReached { cap: self.cap });
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(filename(repro_n, counter));
        let body = format!("{}\n\n{}", comment_header(result_to_clients), to_hex_yaml(repro)?);
        fs::write(&path, body)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Arch, BuildFlags};
    use crate::instr::{CombinedMask, Field, Instruction, InstructionDb};
    use crate::wire::Input;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn tiny_db() -> InstructionDb {
        let instr = Instruction {
            mnemonic: "nop".to_string(),
            fields: vec![Field { msb: 31, lsb: 0, name: None, fixed_value: 0x1f2003d5, fixed_mask: 0xffff_ffff }],
            extensions: vec!["base".to_string()],
            combined_mask: CombinedMask { mask: 0, value: 0 },
        };
        InstructionDb::new(vec![instr])
    }

    fn client(hostname: &str) -> ClientMeta {
        ClientMeta {
            hostname: hostname.to_string(),
            num_cpus: 4,
            core_index: 0,
            lscpu_text: String::new(),
            proc_cpuinfo_text: String::new(),
            sys_possible_text: String::new(),
            vec_size: 0,
            sve_max_size: None,
            sme_max_size: None,
            tags: BTreeMap::new(),
            elf_hash: "deadbeef".to_string(),
        }
    }

    fn result(signum: u8) -> Result {
        Result { signum, cycle_diff: None, instret_diff: None, regs: BTreeMap::new(), si_addr: 0xdead, si_pc: 0, si_code: 0, mem_diffs: None }
    }

    fn sample_repro(db: &InstructionDb) -> (Reproducer, Vec<(Result, Vec<ClientMeta>)>) {
        let input = Input::ValuesFull { gp: vec![0; Arch::Aarch64.gp_count()], fp: None, vec: None, instr_seq: vec![0x1f2003d5], seq_len: 1, full_seq: true };
        let entries = vec![(result(0), vec![client("a")]), (result(11), vec![client("b")])];
        let repro = Reproducer::build(db, Arch::Aarch64, BuildFlags::default(), &input, Some(7), &entries, Vec::new());
        (repro, entries)
    }

    #[test]
    fn hexifies_every_integer_scalar() {
        let db = tiny_db();
        let (repro, _) = sample_repro(&db);
        let yaml = to_hex_yaml(&repro).unwrap();
        assert!(yaml.contains("0x1f2003d5") || yaml.contains("0x1f2003d5".to_string().as_str()));
        assert!(yaml.contains("0x7")); // counter: 7
        assert!(!yaml.contains(": 7\n"));
    }

    #[test]
    fn comment_header_lists_signum_diff_and_both_clusters() {
        let db = tiny_db();
        let (_, entries) = sample_repro(&db);
        let header = comment_header(&entries);
        assert!(header.contains("# signum differs"));
        assert!(header.contains("a(core 0)"));
        assert!(header.contains("b(core 0)"));
    }

    #[test]
    fn filename_is_zero_padded_and_monotonic() {
        assert_eq!(filename(1, 42), "reproducer-00000001-000000000042.yaml");
    }

    #[test]
    fn writer_writes_to_disk_and_increments_counter() {
        let db = tiny_db();
        let (repro, entries) = sample_repro(&db);
        let dir = tempdir().unwrap();
        let writer = ReproducerWriter::new(dir.path().join("reproducers"));
        let path1 = writer.write(&repro, 1, &entries).unwrap();
        let path2 = writer.write(&repro, 2, &entries).unwrap();
        assert!(path1.exists());
        assert!(path2.exists());
        assert_ne!(path1, path2);
        assert!(path1.to_string_lossy().contains("reproducer-00000001-"));
        assert!(path2.to_string_lossy().contains("reproducer-00000002-"));
    }

    #[test]
    fn writer_errors_once_cap_is_reached() {
        let db = tiny_db();
        let (repro, entries) = sample_repro(&db);
        let dir = tempdir().unwrap();
        let writer = ReproducerWriter::with_cap(dir.path().join("reproducers"), 1);
        assert!(writer.write(&repro, 1, &entries).is_ok());
        assert!(matches!(writer.write(&repro, 2, &entries), Err(ReproducerError::CapReached { cap: 1 })));
    }
}
