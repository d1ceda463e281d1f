// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for apiary-core integration tests.
//!
//! Provides a scripted plugin, a factory producing it and helpers for
//! reading reply envelopes off session sinks.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use apiary_core::config::Config;
use apiary_core::plugin::{Capabilities, Dict, Plugin, PluginError, PluginFactory};
use apiary_core::session::SessionEvent;
use apiary_protocol::control::Reply;

/// What the scripted plugin does on `fetch`.
#[derive(Clone)]
pub enum FetchBehavior {
    /// Return the same dictionary every time.
    Static(Dict),
    /// Return an empty dictionary (suppresses publication).
    Empty,
    /// Raise with the given diagnostic.
    Fail(String),
    /// Never return; simulates a wedged plugin.
    Hang,
}

/// A scripted plugin for driving the core in tests.
pub struct TestPlugin {
    uri: String,
    hash: String,
    capabilities: Capabilities,
    behavior: FetchBehavior,
    /// Seconds between manual fires.
    reschedule_delay: f64,
    fetches: Arc<AtomicUsize>,
}

#[async_trait]
impl Plugin for TestPlugin {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn hash(&self) -> &str {
        &self.hash
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn fetch(&mut self) -> Result<Dict, PluginError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            FetchBehavior::Static(dict) => Ok(dict.clone()),
            FetchBehavior::Empty => Ok(Dict::new()),
            FetchBehavior::Fail(reason) => Err(PluginError::new(reason.clone())),
            FetchBehavior::Hang => std::future::pending().await,
        }
    }

    fn reschedule(&mut self, now: f64) -> f64 {
        now + self.reschedule_delay
    }
}

/// Factory handing out [`TestPlugin`] instances sharing one fetch counter.
pub struct TestFactory {
    hash: String,
    capabilities: Capabilities,
    behavior: FetchBehavior,
    reschedule_delay: f64,
    fetches: Arc<AtomicUsize>,
    fail_instantiate: bool,
}

impl TestFactory {
    pub fn new(behavior: FetchBehavior) -> Self {
        Self {
            hash: "H".to_string(),
            capabilities: Capabilities::NONE,
            behavior,
            reschedule_delay: 0.0,
            fetches: Arc::new(AtomicUsize::new(0)),
            fail_instantiate: false,
        }
    }

    pub fn manual(mut self, reschedule_delay: f64) -> Self {
        self.capabilities = Capabilities::MANUAL;
        self.reschedule_delay = reschedule_delay;
        self
    }

    pub fn failing_to_instantiate(mut self) -> Self {
        self.fail_instantiate = true;
        self
    }

    /// Total `fetch` calls across every instance this factory produced.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl PluginFactory for TestFactory {
    fn instantiate(&self, target: &str) -> Result<Box<dyn Plugin>, PluginError> {
        if self.fail_instantiate {
            return Err(PluginError::new(format!(
                "no module registered for '{}'",
                target
            )));
        }

        Ok(Box::new(TestPlugin {
            uri: target.to_string(),
            hash: self.hash.clone(),
            capabilities: self.capabilities,
            behavior: self.behavior.clone(),
            reschedule_delay: self.reschedule_delay,
            fetches: self.fetches.clone(),
        }))
    }
}

/// Install a subscriber once so `RUST_LOG=debug cargo test` shows core logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A dictionary with predictable content.
pub fn sample_dict() -> Dict {
    let mut dict = Dict::new();
    dict.insert("metric".to_string(), b"42".to_vec());
    dict
}

/// Configuration with short deadlines so tests run in wall-clock
/// milliseconds instead of minutes.
pub fn fast_config() -> Config {
    Config {
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(400),
        idle_timeout: Duration::from_secs(60),
        suicide_timeout: Duration::from_secs(60),
        ..Config::default()
    }
}

/// Upper bound for anything that should happen "promptly" in a test.
pub const WAIT: Duration = Duration::from_secs(5);

/// Read the single reply for a control command: one chunk carrying the
/// envelope, then a normal close.
pub async fn expect_reply(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Reply {
    let event = timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for reply")
        .expect("session closed without a reply");

    let reply = match event {
        SessionEvent::Chunk(chunk) => Reply::from_bytes(&chunk).expect("malformed reply envelope"),
        other => panic!("expected a reply chunk, got {:?}", other),
    };

    let event = timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for session close")
        .expect("session dropped without a close");
    assert!(
        matches!(event, SessionEvent::Close),
        "expected close after the reply, got {:?}",
        event
    );

    reply
}

/// Read the terminal error of a failed session.
pub async fn expect_failure(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> String {
    let event = timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for failure")
        .expect("session closed without a failure");

    match event {
        SessionEvent::Error(error) => error.error_code().to_string(),
        other => panic!("expected a session error, got {:?}", other),
    }
}
