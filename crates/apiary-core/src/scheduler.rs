// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler variants driving periodic plugin fetches.
//!
//! A scheduler is pure timing policy: it owns its key and decides when the
//! next fetch happens. The worker's event loop owns firing, fetch caching
//! and publication. Two requests producing the same key share a scheduler.

use serde_json::Value;

use crate::error::EngineError;
use crate::plugin::{Capabilities, Plugin};

/// A scheduling policy bound to one plugin hash.
#[derive(Debug)]
pub enum Scheduler {
    /// Fixed-interval firing.
    Auto(AutoScheduler),
    /// Plugin-paced firing.
    Manual(ManualScheduler),
}

impl Scheduler {
    /// Build an automatic scheduler from request arguments.
    ///
    /// `args.interval` is milliseconds and must be a positive integer.
    pub fn auto(hash: &str, args: &Value) -> Result<Self, EngineError> {
        let interval_ms = args
            .get("interval")
            .and_then(Value::as_i64)
            .ok_or_else(|| EngineError::InvalidArgument {
                reason: "interval is required".to_string(),
            })?;

        if interval_ms <= 0 {
            return Err(EngineError::InvalidArgument {
                reason: "interval must be positive".to_string(),
            });
        }

        let interval = interval_ms as f64 / 1000.0;

        Ok(Scheduler::Auto(AutoScheduler {
            key: format!("auto:{}@{:?}", hash, interval),
            interval,
        }))
    }

    /// Build a manual scheduler. The plugin must advertise MANUAL.
    pub fn manual(plugin: &dyn Plugin, _args: &Value) -> Result<Self, EngineError> {
        if !plugin.capabilities().contains(Capabilities::MANUAL) {
            return Err(EngineError::CapabilityMissing {
                capability: "manual scheduling".to_string(),
            });
        }

        Ok(Scheduler::Manual(ManualScheduler {
            key: format!("manual:{}", plugin.hash()),
        }))
    }

    /// The deterministic key identifying this scheduler.
    pub fn key(&self) -> &str {
        match self {
            Scheduler::Auto(s) => &s.key,
            Scheduler::Manual(s) => &s.key,
        }
    }

    /// Compute the next fire time, in seconds on the loop's timebase.
    pub fn reschedule(&mut self, plugin: &mut dyn Plugin, now: f64) -> f64 {
        match self {
            Scheduler::Auto(s) => now + s.interval,
            // A plugin cannot schedule into the past.
            Scheduler::Manual(_) => plugin.reschedule(now).max(now),
        }
    }
}

/// Fires every fixed interval.
#[derive(Debug)]
pub struct AutoScheduler {
    key: String,
    interval: f64,
}

/// Fires whenever the plugin asks to.
#[derive(Debug)]
pub struct ManualScheduler {
    key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Dict, PluginError};
    use async_trait::async_trait;
    use serde_json::json;

    struct FakePlugin {
        capabilities: Capabilities,
        next: f64,
    }

    #[async_trait]
    impl Plugin for FakePlugin {
        fn uri(&self) -> &str {
            "fake://plugin"
        }

        fn hash(&self) -> &str {
            "H"
        }

        fn capabilities(&self) -> Capabilities {
            self.capabilities
        }

        async fn fetch(&mut self) -> Result<Dict, PluginError> {
            Ok(Dict::new())
        }

        fn reschedule(&mut self, _now: f64) -> f64 {
            self.next
        }
    }

    #[test]
    fn test_auto_key_format() {
        let scheduler = Scheduler::auto("H", &json!({"interval": 1000})).unwrap();
        assert_eq!(scheduler.key(), "auto:H@1.0");

        let scheduler = Scheduler::auto("H", &json!({"interval": 250})).unwrap();
        assert_eq!(scheduler.key(), "auto:H@0.25");
    }

    #[test]
    fn test_auto_requires_positive_interval() {
        let err = Scheduler::auto("H", &json!({"interval": 0})).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ARGUMENT");

        let err = Scheduler::auto("H", &json!({"interval": -5})).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ARGUMENT");

        let err = Scheduler::auto("H", &json!({})).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_auto_reschedule_adds_interval() {
        let mut plugin = FakePlugin {
            capabilities: Capabilities::NONE,
            next: 0.0,
        };
        let mut scheduler = Scheduler::auto("H", &json!({"interval": 2000})).unwrap();
        assert_eq!(scheduler.reschedule(&mut plugin, 10.0), 12.0);
    }

    #[test]
    fn test_manual_requires_capability() {
        let plugin = FakePlugin {
            capabilities: Capabilities::NONE,
            next: 0.0,
        };
        let err = Scheduler::manual(&plugin, &json!({})).unwrap_err();
        assert_eq!(err.error_code(), "CAPABILITY_MISSING");
    }

    #[test]
    fn test_manual_key_format() {
        let plugin = FakePlugin {
            capabilities: Capabilities::MANUAL,
            next: 0.0,
        };
        let scheduler = Scheduler::manual(&plugin, &json!({})).unwrap();
        assert_eq!(scheduler.key(), "manual:H");
    }

    #[test]
    fn test_manual_never_schedules_into_the_past() {
        let mut plugin = FakePlugin {
            capabilities: Capabilities::MANUAL,
            next: 3.0,
        };
        let mut scheduler = Scheduler::manual(&plugin, &json!({})).unwrap();

        // Plugin asks for a time after now: honored.
        assert_eq!(scheduler.reschedule(&mut plugin, 1.0), 3.0);
        // Plugin asks for a time before now: clamped to now.
        assert_eq!(scheduler.reschedule(&mut plugin, 5.0), 5.0);
    }
}
