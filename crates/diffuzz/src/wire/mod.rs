// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire protocol: length-prefixed framing, zlib streaming, and the
//! `Input`/`Result` codecs that ride on top of it (ch. 4.2).

pub mod frame;
pub mod input;
pub mod result;
pub mod zlib_stream;

pub use frame::FrameCodec;
pub use input::{Input, FILLER_64};
pub use result::{fp_names, gp_names, reg_table, vec_names, FilteredResult, MemDiff, MultiResult, RegValue, Result};
pub use zlib_stream::{ZlibReceiver, ZlibSender};
