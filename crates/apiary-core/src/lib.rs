// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Apiary Core - Plugin Execution Engine
//!
//! This crate runs user-defined data sources ("plugins") inside isolated
//! worker threads, schedules their fetches, routes requests to them and
//! publishes their output on a message bus.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Clients                                      │
//! │                 (router / front-end, out of scope)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                   │ push / drop
//!                                   ▼
//! ┌───────────────────────┐  reaper notices  ┌─────────────────────────────┐
//! │   Engine (per target) │◄─────────────────│        Workers              │
//! │   slave pool          │                  │  (one thread + one loop     │
//! │   session dispatch    │  framed RPC over │   per slave: the overseer)  │
//! │                       │──────────────────►                             │
//! └───────────┬───────────┘  in-proc pipes   └──────────────┬──────────────┘
//!             │                                             │
//!             ▼                                             ▼
//! ┌───────────────────────┐                  ┌─────────────────────────────┐
//! │       Storage         │                  │         Event bus           │
//! │ (schedule records)    │                  │  [key, dict] publications   │
//! └───────────────────────┘                  └─────────────────────────────┘
//! ```
//!
//! # Request flow
//!
//! 1. A request enters [`engine::Engine::push`] with a result sink.
//! 2. The engine selects or spawns the slave for the request's thread id and
//!    assigns a fresh session id.
//! 3. The slave forwards the request as an `invoke` over the transport.
//! 4. The worker's [`overseer::Overseer`] installs a scheduler (or performs
//!    a one-shot fetch) and pushes the reply back as session chunks; a
//!    `release` closes the session.
//! 5. Scheduler fires publish `[key, dict]` events on the outbound bus.
//!
//! # Slave state machine
//!
//! ```text
//!             first heartbeat             graceful terminate
//!  ┌─────────┐ ────────────► ┌────────┐ ────────────────────► ┌──────────┐
//!  │ UNKNOWN │               │ ACTIVE │                        │ INACTIVE │
//!  └────┬────┘ ◄──────────── └───┬────┘ (pending flushed)      └────┬─────┘
//!       │        heartbeat       │                                  │
//!       │                        │ heartbeat deadline /             │ worker
//!       │                        │ suicide / transport error        │ exits
//!       ▼                        ▼                                  ▼
//!  ┌──────────────────────────────────────────────────────────────────────┐
//!  │                            DEAD (terminal)                           │
//!  │          all sessions failed, engine notified to reap                │
//!  └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Timers
//!
//! | Timer | Where | Default | On fire |
//! |-------|-------|---------|---------|
//! | Heartbeat interval | worker | 5 s | emit `heartbeat` |
//! | Heartbeat deadline | slave | 30 s | slave dies, sessions fail |
//! | Idle deadline | slave | 600 s | graceful terminate when no sessions |
//! | Suicide deadline | worker | 600 s | reaper notice, worker exits |
//!
//! # Configuration
//!
//! Loaded from `APIARY_*` environment variables, see [`config::Config`].

#![deny(missing_docs)]

/// Timing and capacity configuration.
pub mod config;

/// The per-target engine: slave pool, dispatch, reaping.
pub mod engine;

/// Error types with stable string and wire code mappings.
pub mod error;

/// The worker-side event loop owning a plugin and its schedulers.
pub mod overseer;

/// The plugin boundary: capabilities, fetch/reschedule, factory.
pub mod plugin;

/// Scheduler variants (automatic, manual) and their keys.
pub mod scheduler;

/// Sessions and their result sinks.
pub mod session;

/// Supervisor-side worker handles and the slave state machine.
pub mod slave;

/// Durable storage interface and backends.
pub mod storage;

pub use config::Config;
pub use engine::{Engine, EngineBuilder};
pub use error::EngineError;
pub use overseer::{Overseer, ReaperNotice};
pub use plugin::{Capabilities, Dict, Plugin, PluginError, PluginFactory};
pub use scheduler::Scheduler;
pub use session::{SessionEvent, SessionSink};
pub use slave::SlaveState;
pub use storage::{MemoryStorage, SqliteStorage, Storage};
