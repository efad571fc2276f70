// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-subsystem error types.
//!
//! One `thiserror` enum per major boundary rather than a single crate-wide
//! error, matching how the workspace's service crates each own their
//! error type. Only the handshake and DB-load paths ever turn an error
//! into a process exit (ch. 7); everywhere else these propagate to the
//! scheduler's degradation logic.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown architecture: {0}")]
    UnknownArch(String),

    #[error("unknown grouping predicate: {0}")]
    UnknownGroupBy(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("unknown mnemonic: {0}")]
    UnknownMnemonic(String),

    #[error("unknown field {field} on {mnemonic}")]
    UnknownField { mnemonic: String, field: String },

    #[error("value {value:#x} exceeds width of field {field} ({bits} bits)")]
    ValueTooWide { field: String, value: u64, bits: u32 },

    #[error(
        "mask-map collision for 0x{abs_mask_value:08x}: {first} and {second} share an encoding"
    )]
    MaskMapCollision {
        abs_mask_value: u32,
        first: String,
        second: String,
    },

    #[error("failed to load instruction DB: {0}")]
    Load(String),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame exceeds maximum length: {0} bytes")]
    FrameTooLarge(usize),

    #[error("zlib stream error: {0}")]
    Zlib(String),

    #[error("truncated message: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown input discriminant: {0}")]
    UnknownInputKind(u8),

    #[error("unknown register index: {0}")]
    UnknownRegIndex(u8),
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("offline generator invoked before late_init completed")]
    NotLateInitialized,

    #[error("input-generator helper exited with status {0:?}")]
    HelperFailed(Option<i32>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ReproducerError {
    #[error("I/O error writing reproducer: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("reproducer cap of {cap} reached")]
    CapReached { cap: u64 },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("session lost: ticket={ticket} unrelated={unrelated}")]
    LostClient { ticket: u64, unrelated: bool },

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("elf hash mismatch: expected {expected}, got {got}")]
    ElfHashMismatch { expected: String, got: String },

    #[error("group lost: all member sessions are dead")]
    GroupLost,

    #[error("member lost: one session in the group died, others remain")]
    MemberLost,

    #[error("scheduling would exceed in-flight byte budget")]
    BackpressureExceeded,
}
