// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Instruction database: mask-map disassembly index, random instantiation,
//! field get/set, canonical enumeration.

use std::collections::HashMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::instr::field::{classify_field, CombinedMask, Field, FieldKind};
use crate::instr::rng::Mt19937;

/// Number of least-constrained bits selected for the mask-map bucket key.
const ABS_MASK_BITS: u32 = 11;

/// Mnemonic pairs allowed to share a mask-map slot (ch. 4.1 collision
/// policy). On RISC-V, `c.ld`/`c.flw` are genuinely ambiguous without
/// extension context; the source silences the assertion for this pair.
const MASK_MAP_ALLOW_LIST: &[(&str, &str)] = &[("c.ld", "c.flw")];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub mnemonic: String,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(skip)]
    pub combined_mask: CombinedMask,
}

impl Instruction {
    fn finalize(mut self) -> Self {
        self.combined_mask = CombinedMask::from_fields(&self.fields);
        self
    }

    pub fn variable_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| !f.is_fixed())
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.name.as_deref() == Some(name))
    }
}

/// One bucket entry: an instruction's own `(mask, value)` pair plus the
/// mnemonic it resolves to, sorted within a bucket by descending
/// `popcount(mask)` so the most specific encoding wins.
#[derive(Debug, Clone)]
struct MaskMapEntry {
    mask: u32,
    value: u32,
    mnemonic: String,
}

#[derive(Debug, Default)]
pub struct InstructionDb {
    instructions: HashMap<String, Instruction>,
    abs_mask: u32,
    mask_map: HashMap<u32, Vec<MaskMapEntry>>,
    weights: Option<WeightedChoice>,
}

impl InstructionDb {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        let mut db = InstructionDb {
            instructions: instructions
                .into_iter()
                .map(|i| (i.mnemonic.clone(), i.finalize()))
                .collect(),
            abs_mask: 0,
            mask_map: HashMap::new(),
            weights: None,
        };
        db.update_maps();
        db
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn mnemonics(&self) -> impl Iterator<Item = &str> {
        self.instructions.keys().map(String::as_str)
    }

    pub fn get(&self, mnemonic: &str) -> Option<&Instruction> {
        self.instructions.get(mnemonic)
    }

    /// Remove instructions from the DB and rebuild the mask-map.
    pub fn remove(&mut self, mnemonics: &[&str]) {
        for m in mnemonics {
            self.instructions.remove(*m);
        }
        self.update_maps();
    }

    /// Recompute `abs_mask` and the two-level mask-map. Called on
    /// construction and after every mutation.
    fn update_maps(&mut self) {
        self.abs_mask = Self::pick_abs_mask(self.instructions.values());
        self.mask_map = Self::build_mask_map(self.instructions.values(), self.abs_mask);
    }

    fn pick_abs_mask<'a>(instructions: impl Iterator<Item = &'a Instruction> + Clone) -> u32 {
        let mut unconstrained = [0u32; 32];
        let mut count = 0u32;
        for instr in instructions.clone() {
            count += 1;
            for (bit, slot) in unconstrained.iter_mut().enumerate() {
                if instr.combined_mask.mask & (1 << bit) == 0 {
                    *slot += 1;
                }
            }
        }
        if count == 0 {
            return 0;
        }
        let mut bits: Vec<u32> = (0..32).collect();
        // Descending unconstrained-count, ties broken by ascending bit
        // index for a deterministic, reproducible abs_mask across runs.
        bits.sort_by(|&a, &b| {
            unconstrained[b as usize]
                .cmp(&unconstrained[a as usize])
                .then(a.cmp(&b))
        });
        bits.into_iter()
            .take(ABS_MASK_BITS as usize)
            .fold(0u32, |acc, bit| acc | (1 << bit))
    }

    fn build_mask_map<'a>(
        instructions: impl Iterator<Item = &'a Instruction>,
        abs_mask: u32,
    ) -> HashMap<u32, Vec<MaskMapEntry>> {
        let mut map: HashMap<u32, Vec<MaskMapEntry>> = HashMap::new();
        for instr in instructions {
            let cm = instr.combined_mask;
            let free_bits = abs_mask & !cm.mask;
            let base = cm.value & abs_mask;
            for_each_submask(free_bits, |subset| {
                let abs_value = base | subset;
                let bucket = map.entry(abs_value).or_default();
                if let Some(existing) = bucket
                    .iter()
                    .find(|e| e.mask == cm.mask && e.value == cm.value)
                {
                    if existing.mnemonic != instr.mnemonic && !allowed_collision(&existing.mnemonic, &instr.mnemonic) {
                        warn!(
                            "mask-map collision at abs_value=0x{:08x}: {} and {} share an encoding",
                            abs_value, existing.mnemonic, instr.mnemonic
                        );
                    }
                    return;
                }
                bucket.push(MaskMapEntry {
                    mask: cm.mask,
                    value: cm.value,
                    mnemonic: instr.mnemonic.clone(),
                });
            });
        }
        for bucket in map.values_mut() {
            bucket.sort_by(|a, b| b.mask.count_ones().cmp(&a.mask.count_ones()));
        }
        map
    }

    /// Look up the mnemonic a 32-bit word disassembles to, or `None` if it
    /// matches no known encoding. Never raises: unknown encodings are
    /// exactly what the undoc scanner (ch. 4.8) is looking for.
    pub fn disassemble(&self, word: u32) -> Option<&str> {
        let abs_value = word & self.abs_mask;
        let bucket = self.mask_map.get(&abs_value)?;
        bucket
            .iter()
            .find(|e| word & e.mask == e.value)
            .map(|e| e.mnemonic.as_str())
    }

    /// Start from the instruction's fixed encoding with every variable
    /// field zeroed.
    pub fn init(&self, mnemonic: &str) -> Result<u32, DbError> {
        self.get(mnemonic)
            .map(|i| i.combined_mask.value)
            .ok_or_else(|| DbError::UnknownMnemonic(mnemonic.to_string()))
    }

    pub fn set_field(&self, encoding: u32, mnemonic: &str, name: &str, value: u32) -> Result<u32, DbError> {
        let instr = self
            .get(mnemonic)
            .ok_or_else(|| DbError::UnknownMnemonic(mnemonic.to_string()))?;
        let field = instr.field(name).ok_or_else(|| DbError::UnknownField {
            mnemonic: mnemonic.to_string(),
            field: name.to_string(),
        })?;
        field.set(encoding, value)
    }

    /// Randomly instantiate `mnemonic`, biasing register fields toward a
    /// working set of `num_regs` registers and named immediates toward
    /// "interesting" values (ch. 4.1).
    pub fn randomly_init(&self, mnemonic: &str, num_regs: u32, rng: &mut Mt19937) -> Result<u32, DbError> {
        let instr = self
            .get(mnemonic)
            .ok_or_else(|| DbError::UnknownMnemonic(mnemonic.to_string()))?;
        let mut word = instr.combined_mask.value;
        for field in instr.variable_fields() {
            let bits = field.width();
            let kind = classify_field(field.name.as_deref(), bits);
            let value = match kind {
                FieldKind::Register => {
                    let field_max = (1u64 << bits) - 1;
                    if rng.randint(0, u64::from(num_regs)) == 0 {
                        rng.randint(0, field_max) as u32
                    } else {
                        rng.randint(0, (u64::from(num_regs) - 1).min(field_max)) as u32
                    }
                }
                FieldKind::SignedImmediate => crate::instr::immediate::signed_interesting(rng, bits),
                FieldKind::UnsignedImmediate => crate::instr::immediate::unsigned_interesting(rng, bits),
                FieldKind::Other => rng.randint(0, (1u64 << bits) - 1) as u32,
            };
            word = field.set(word, value)?;
        }
        Ok(word)
    }

    /// Choose a mnemonic, weighted if `weighted_choice` weights were
    /// supplied, uniform otherwise.
    pub fn choose_mnemonic(&self, rng: &mut Mt19937) -> Option<&str> {
        if let Some(weights) = &self.weights {
            return weights.choose(rng);
        }
        let names: Vec<&str> = self.mnemonics().collect();
        if names.is_empty() {
            return None;
        }
        let idx = rng.randint(0, names.len() as u64 - 1) as usize;
        Some(names[idx])
    }

    /// Precompute weighted selection from per-mnemonic observation counts.
    /// Unseen instructions inherit the minimum weight. Winsorizes the top
    /// 50% of weights, then rescales so `max/min == 10`.
    pub fn set_weights(&mut self, counts: &HashMap<String, f64>) {
        self.weights = Some(WeightedChoice::build(self.mnemonics().map(String::from).collect(), counts));
    }
}

fn allowed_collision(a: &str, b: &str) -> bool {
    MASK_MAP_ALLOW_LIST
        .iter()
        .any(|(x, y)| (*x == a && *y == b) || (*x == b && *y == a))
}

/// Call `f` with every value obtainable by turning a subset of the set
/// bits of `mask` on (submask enumeration, including the empty subset).
fn for_each_submask(mask: u32, mut f: impl FnMut(u32)) {
    let mut sub = mask;
    loop {
        f(sub);
        if sub == 0 {
            break;
        }
        sub = (sub - 1) & mask;
    }
}

#[derive(Debug)]
struct WeightedChoice {
    mnemonics: Vec<String>,
    cumulative: Vec<f64>,
}

impl WeightedChoice {
    fn build(mnemonics: Vec<String>, counts: &HashMap<String, f64>) -> Self {
        let mut weights: Vec<f64> = mnemonics
            .iter()
            .map(|m| counts.get(m).copied().unwrap_or(0.0))
            .collect();

        let mut sorted = weights.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        if !sorted.is_empty() {
            let cutoff_idx = sorted.len() / 2;
            let cap = sorted[cutoff_idx.min(sorted.len() - 1)];
            for w in weights.iter_mut() {
                if *w > cap {
                    *w = cap;
                }
            }
        }

        let max_w = weights.iter().cloned().fold(f64::MIN, f64::max).max(1.0);
        let min_w = weights
            .iter()
            .cloned()
            .filter(|w| *w > 0.0)
            .fold(f64::MAX, f64::min);
        let min_w = if min_w.is_finite() { min_w } else { 1.0 };

        let inverted: Vec<f64> = weights
            .iter()
            .map(|&w| {
                let w = if w <= 0.0 { min_w } else { w };
                if (max_w - min_w).abs() < f64::EPSILON {
                    1.0
                } else {
                    let exponent = (max_w / min_w).log10().max(f64::EPSILON);
                    (max_w / w).powf(1.0 / exponent)
                }
            })
            .collect();

        let mut cumulative = Vec::with_capacity(inverted.len());
        let mut running = 0.0;
        for w in inverted {
            running += w;
            cumulative.push(running);
        }

        WeightedChoice {
            mnemonics,
            cumulative,
        }
    }

    fn choose(&self, rng: &mut Mt19937) -> Option<&str> {
        if self.cumulative.is_empty() {
            return None;
        }
        let total = *self.cumulative.last().unwrap();
        let target = (rng.randint(0, 1_000_000) as f64 / 1_000_000.0) * total;
        let idx = self
            .cumulative
            .partition_point(|&c| c < target)
            .min(self.mnemonics.len() - 1);
        Some(self.mnemonics[idx].as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(msb: u8, lsb: u8, name: Option<&str>, fv: u32, fm: u32) -> Field {
        Field {
            msb,
            lsb,
            name: name.map(String::from),
            fixed_value: fv,
            fixed_mask: fm,
        }
    }

    fn add_instr() -> Instruction {
        // AArch64 ADD (immediate), 32-bit fixed opcode bits 31:22, rest variable.
        Instruction {
            mnemonic: "add".to_string(),
            fields: vec![
                field(31, 22, None, 0b1001_0001_00, 0b11_1111_1111),
                field(21, 10, Some("imm12"), 0, 0),
                field(9, 5, Some("rn"), 0, 0),
                field(4, 0, Some("rd"), 0, 0),
            ],
            extensions: vec!["base".to_string()],
            combined_mask: CombinedMask { mask: 0, value: 0 },
        }
    }

    fn sub_instr() -> Instruction {
        Instruction {
            mnemonic: "sub".to_string(),
            fields: vec![
                field(31, 22, None, 0b1101_0001_00, 0b11_1111_1111),
                field(21, 10, Some("imm12"), 0, 0),
                field(9, 5, Some("rn"), 0, 0),
                field(4, 0, Some("rd"), 0, 0),
            ],
            extensions: vec!["base".to_string()],
            combined_mask: CombinedMask { mask: 0, value: 0 },
        }
    }

    #[test]
    fn disassemble_finds_canonical_encoding_after_rebuild() {
        let mut db = InstructionDb::new(vec![add_instr(), sub_instr()]);
        for mnemonic in ["add", "sub"] {
            let word = db.init(mnemonic).unwrap();
            assert_eq!(db.disassemble(word), Some(mnemonic));
        }
        db.remove(&["sub"]);
        assert_eq!(db.disassemble(db.init("add").unwrap()), Some("add"));
        assert!(db.get("sub").is_none());
    }

    #[test]
    fn randomly_init_preserves_fixed_bits_and_field_widths() {
        let db = InstructionDb::new(vec![add_instr()]);
        let mut rng = Mt19937::new(123);
        for _ in 0..200 {
            let word = db.randomly_init("add", 4, &mut rng).unwrap();
            let instr = db.get("add").unwrap();
            assert_eq!(word & instr.combined_mask.mask, instr.combined_mask.value);
            let imm = instr.field("imm12").unwrap().extract(word);
            assert!(imm <= 0xFFF);
        }
    }

    #[test]
    fn randomly_init_is_deterministic_for_fixed_seed() {
        let db = InstructionDb::new(vec![add_instr()]);
        let mut rng_a = Mt19937::new(7);
        let mut rng_b = Mt19937::new(7);
        for _ in 0..50 {
            assert_eq!(
                db.randomly_init("add", 4, &mut rng_a).unwrap(),
                db.randomly_init("add", 4, &mut rng_b).unwrap()
            );
        }
    }

    #[test]
    fn decoder_completeness_over_random_words() {
        let db = InstructionDb::new(vec![add_instr(), sub_instr()]);
        let mut rng = Mt19937::new(99);
        for _ in 0..5000 {
            let word = rng.randint(0, u32::MAX as u64) as u32;
            if let Some(mnemonic) = db.disassemble(word) {
                let instr = db.get(mnemonic).unwrap();
                assert!(instr.combined_mask.matches(word));
            }
        }
    }

    #[test]
    fn unknown_mnemonic_is_an_error() {
        let db = InstructionDb::new(vec![add_instr()]);
        assert!(db.init("frobnicate").is_err());
    }
}
