// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime tuning knobs, loadable from environment variables.

use std::time::Duration;

/// Timing and capacity configuration shared by engines, slaves and workers.
#[derive(Debug, Clone)]
pub struct Config {
    /// How often a worker emits a heartbeat.
    pub heartbeat_interval: Duration,
    /// How long a slave waits for a heartbeat before declaring the worker dead.
    pub heartbeat_timeout: Duration,
    /// How long a slave with no sessions lives before a graceful terminate.
    pub idle_timeout: Duration,
    /// How long a worker with no schedulers lives before killing itself.
    pub suicide_timeout: Duration,
    /// Depth of the per-slave command queue; the transport high-water mark.
    pub command_queue_depth: usize,
    /// Size of the in-memory byte pipe between supervisor and worker.
    pub transport_buffer_bytes: usize,
    /// Depth of the outbound event-bus channel.
    pub bus_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            suicide_timeout: Duration::from_secs(600),
            command_queue_depth: 128,
            transport_buffer_bytes: 64 * 1024,
            bus_queue_depth: 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables with defaults.
    ///
    /// Optional (with defaults):
    /// - `APIARY_HEARTBEAT_INTERVAL_MS`: worker heartbeat period (default: 5000)
    /// - `APIARY_HEARTBEAT_TIMEOUT_MS`: slave liveness deadline (default: 30000)
    /// - `APIARY_IDLE_TIMEOUT_MS`: slave idle deadline (default: 600000)
    /// - `APIARY_SUICIDE_TIMEOUT_MS`: worker idle self-destruct (default: 600000)
    /// - `APIARY_COMMAND_QUEUE_DEPTH`: per-slave queue depth (default: 128)
    /// - `APIARY_TRANSPORT_BUFFER`: transport pipe size in bytes (default: 65536)
    /// - `APIARY_BUS_QUEUE_DEPTH`: event-bus channel depth (default: 1024)
    pub fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();

        Ok(Self {
            heartbeat_interval: duration_var(
                "APIARY_HEARTBEAT_INTERVAL_MS",
                default.heartbeat_interval,
            )?,
            heartbeat_timeout: duration_var(
                "APIARY_HEARTBEAT_TIMEOUT_MS",
                default.heartbeat_timeout,
            )?,
            idle_timeout: duration_var("APIARY_IDLE_TIMEOUT_MS", default.idle_timeout)?,
            suicide_timeout: duration_var("APIARY_SUICIDE_TIMEOUT_MS", default.suicide_timeout)?,
            command_queue_depth: usize_var(
                "APIARY_COMMAND_QUEUE_DEPTH",
                default.command_queue_depth,
            )?,
            transport_buffer_bytes: usize_var(
                "APIARY_TRANSPORT_BUFFER",
                default.transport_buffer_bytes,
            )?,
            bus_queue_depth: usize_var("APIARY_BUS_QUEUE_DEPTH", default.bus_queue_depth)?,
        })
    }
}

fn duration_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let ms: u64 = raw
                .parse()
                .map_err(|_| ConfigError::Invalid(name, "must be milliseconds"))?;
            if ms == 0 {
                return Err(ConfigError::Invalid(name, "must be positive"));
            }
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(default),
    }
}

fn usize_var(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let value: usize = raw
                .parse()
                .map_err(|_| ConfigError::Invalid(name, "must be a positive integer"))?;
            if value == 0 {
                return Err(ConfigError::Invalid(name, "must be positive"));
            }
            Ok(value)
        }
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
