// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client session state machine and multi-client grouping (ch. 4.3, 4.4).

pub mod client_session;
pub mod handshake;
pub mod multi_client;

pub use client_session::{ClientSession, SessionState};
pub use handshake::{check_elf_hash, read_handshake, write_handshake_reply, ClientMeta, HandshakeReply, Microarchitecture};
pub use multi_client::{LossKind, MultiClient};
