// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The plugin boundary.
//!
//! A plugin is a user-supplied data source living inside a worker. The core
//! treats its output as opaque bytes; the only structure it relies on is the
//! capability set, the content hash (scheduler keys derive from it) and the
//! fetch/reschedule contract.

use async_trait::async_trait;

pub use apiary_protocol::bus::Dict;

/// Capability bitset advertised by a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    /// No optional capabilities.
    pub const NONE: Capabilities = Capabilities(0);
    /// The plugin can pace its own fetches via `reschedule`.
    pub const MANUAL: Capabilities = Capabilities(1);

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

/// Failure reported by a plugin. The core never interprets the message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct PluginError(String);

impl PluginError {
    /// Wrap a plugin diagnostic.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A user-defined data source instantiated inside a worker.
///
/// Implementations never observe concurrency: the owning worker runs a
/// single-threaded loop and every call completes before the next begins.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// The target URI this instance was created for.
    fn uri(&self) -> &str;

    /// Stable content hash derived from the plugin's code and configuration.
    fn hash(&self) -> &str;

    /// Optional capabilities. Defaults to none.
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    /// Produce the next batch of results.
    async fn fetch(&mut self) -> Result<Dict, PluginError>;

    /// Next fire time for manually-paced plugins, in seconds on the caller's
    /// monotonic timebase. Only consulted when [`Capabilities::MANUAL`] is
    /// advertised; the default fires immediately.
    fn reschedule(&mut self, now: f64) -> f64 {
        now
    }
}

/// Instantiates plugins for a target. The dynamic module registry behind
/// this trait is outside the core.
pub trait PluginFactory: Send + Sync {
    /// Create a fresh plugin instance for `target`.
    fn instantiate(&self, target: &str) -> Result<Box<dyn Plugin>, PluginError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_contains() {
        assert!(Capabilities::MANUAL.contains(Capabilities::MANUAL));
        assert!(Capabilities::MANUAL.contains(Capabilities::NONE));
        assert!(!Capabilities::NONE.contains(Capabilities::MANUAL));
    }

    #[test]
    fn test_capabilities_union() {
        let combined = Capabilities::NONE | Capabilities::MANUAL;
        assert!(combined.contains(Capabilities::MANUAL));
    }

    #[test]
    fn test_plugin_error_display() {
        let error = PluginError::new("upstream returned 503");
        assert_eq!(error.to_string(), "upstream returned 503");
    }
}
