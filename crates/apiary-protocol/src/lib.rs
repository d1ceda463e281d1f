// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Apiary Protocol - supervisor/worker communication layer
//!
//! This crate provides the wire protocol between the apiary supervisor and
//! the worker processes it drives:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     apiary-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: heartbeat / terminate / invoke / push /         │
//! │             error / release                                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Control Plane: JSON command + reply envelopes              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: length-prefixed frames over any byte pipe       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Layers
//!
//! ## Frames (`frame`)
//!
//! `[u32 length][u16 code][body]` over anything implementing
//! `AsyncRead`/`AsyncWrite`. The supervisor pairs each worker with an
//! in-process duplex pipe; nothing here depends on that choice.
//!
//! ## RPC messages (`rpc`)
//!
//! Typed view of the frame codes. Session-scoped messages carry a 64-bit
//! session id assigned by the supervisor; chunks for one session arrive in
//! emission order, with `release` (or `error`) last.
//!
//! ## Control plane (`control`)
//!
//! JSON envelopes carried in `invoke` payloads: `auto`, `manual`, `once`,
//! `stop`, `terminate`. Each future-carrying command produces exactly one
//! [`Reply`], pushed back on the same session.
//!
//! ## Event bus (`bus`)
//!
//! Two-frame publications `[scheduler-key, dict]` with a deterministic
//! binary dictionary codec and a size-limited decoder.

pub mod bus;
pub mod control;
pub mod frame;
pub mod rpc;

// Re-export main types
pub use bus::{BusError, BusEvent, Dict};
pub use control::{Command, FutureInfo, Reply, ReplyError, Request};
pub use frame::{Code, Frame, FrameError, FramedStream, MAX_FRAME_SIZE, read_frame, write_frame};
pub use rpc::{Message, read_message, write_message};
