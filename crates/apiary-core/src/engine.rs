// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The per-target engine.
//!
//! An engine owns a pool of slaves for one target URI, dispatches requests
//! to them as sessions and reaps workers that died. The slave table is only
//! ever touched by the task driving the engine; everything else (worker
//! deaths, chunk deliveries) arrives through channels.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use apiary_protocol::bus::BusEvent;
use apiary_protocol::control::{Command, FutureInfo, Request};

use crate::config::Config;
use crate::error::EngineError;
use crate::overseer::ReaperNotice;
use crate::plugin::PluginFactory;
use crate::session::{Session, SessionSink};
use crate::slave::{self, SlaveHandle};
use crate::storage::{MemoryStorage, Storage};

/// Thread id used when a request names none.
pub const DEFAULT_THREAD: &str = "default";

/// Builder for creating an [`Engine`].
pub struct EngineBuilder {
    target: Option<String>,
    factory: Option<Arc<dyn PluginFactory>>,
    storage: Option<Arc<dyn Storage>>,
    bus: Option<mpsc::Sender<BusEvent>>,
    config: Config,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("target", &self.target)
            .field("factory", &self.factory.as_ref().map(|_| "..."))
            .field("storage", &self.storage.as_ref().map(|_| "..."))
            .field("bus", &self.bus.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            target: None,
            factory: None,
            storage: None,
            bus: None,
            config: Config::default(),
        }
    }
}

impl EngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target URI this engine serves (required).
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the plugin factory (required).
    pub fn factory(mut self, factory: Arc<dyn PluginFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the storage backend.
    ///
    /// Default: an in-memory store.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the outbound event-bus sender.
    ///
    /// When absent the engine creates an internal channel; read it with
    /// [`Engine::take_events`].
    pub fn bus(mut self, bus: mpsc::Sender<BusEvent>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Override the timing configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Build the engine.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<Engine> {
        let target = self
            .target
            .ok_or_else(|| anyhow::anyhow!("target is required"))?;
        let factory = self
            .factory
            .ok_or_else(|| anyhow::anyhow!("factory is required"))?;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        let (bus, bus_rx) = match self.bus {
            Some(bus) => (bus, None),
            None => {
                let (tx, rx) = mpsc::channel(self.config.bus_queue_depth);
                (tx, Some(rx))
            }
        };

        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();

        info!(target_uri = %target, "engine starting");

        Ok(Engine {
            target,
            factory,
            storage,
            bus,
            bus_rx,
            config: self.config,
            slaves: HashMap::new(),
            next_session_id: 0,
            reaper_tx,
            reaper_rx,
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("target", &self.target).finish_non_exhaustive()
    }
}

/// Per-target collection of slaves and the dispatcher on top of them.
pub struct Engine {
    target: String,
    factory: Arc<dyn PluginFactory>,
    storage: Arc<dyn Storage>,
    bus: mpsc::Sender<BusEvent>,
    bus_rx: Option<mpsc::Receiver<BusEvent>>,
    config: Config,
    slaves: HashMap<String, SlaveHandle>,
    next_session_id: u64,
    reaper_tx: mpsc::UnboundedSender<ReaperNotice>,
    reaper_rx: mpsc::UnboundedReceiver<ReaperNotice>,
}

impl Engine {
    /// Create a new builder for configuring an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The target URI this engine serves.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Number of live slaves in the pool.
    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    /// Take the internal event-bus receiver, if the builder created one.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<BusEvent>> {
        self.bus_rx.take()
    }

    /// Dispatch a request: select or spawn the slave for the request's
    /// thread id, allocate a session and send the command.
    ///
    /// `args` carries `type` (`auto`/`manual`/`once`, default `once`),
    /// `token`, optionally `thread`, plus the policy parameters. Failures to
    /// instantiate the plugin or spawn the worker fail the sink
    /// synchronously and leave no partial slave behind.
    pub fn push(&mut self, sink: SessionSink, args: Value) {
        let command = match build_command(&args) {
            Ok(command) => command,
            Err(error) => {
                sink.fail(error);
                return;
            }
        };

        let thread_id = thread_id_of(&args);
        if let Err(error) = self.ensure_slave(&thread_id) {
            sink.fail(error);
            return;
        }

        self.dispatch(&thread_id, sink, command);
    }

    /// Ask the slave for the request's thread id to stop the scheduler named
    /// by `args.key`. Fails the sink with `NOT_FOUND` when no such slave
    /// exists.
    pub fn drop_scheduler(&mut self, sink: SessionSink, args: Value) {
        let thread_id = thread_id_of(&args);

        if !self.slaves.contains_key(&thread_id) {
            sink.fail(EngineError::NotFound { thread_id });
            return;
        }

        let request = Request {
            future: FutureInfo {
                token: token_of(&args),
            },
            args,
        };
        self.dispatch(&thread_id, sink, Command::Stop(request));
    }

    /// Remove a slave the engine has determined is dead. A missing slave is
    /// a no-op.
    pub async fn kill(&mut self, thread_id: &str) {
        let Some(handle) = self.slaves.remove(thread_id) else {
            debug!(target_uri = %self.target, thread_id, "found an orphan while reaping");
            return;
        };

        info!(target_uri = %self.target, thread_id, slave = %handle.id, "killing slave");
        handle.discard().await;
    }

    /// Drain pending reaper notices, killing each dead slave. Returns how
    /// many were reaped.
    pub async fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Ok(notice) = self.reaper_rx.try_recv() {
            debug!(engine = %notice.engine, thread = %notice.thread, "reaper notice");
            self.kill(&notice.thread).await;
            reaped += 1;
        }
        reaped
    }

    /// Wait for the next worker death. The caller follows up with
    /// [`Engine::kill`]; useful when the engine task folds reaping into its
    /// own select loop.
    pub async fn departed(&mut self) -> Option<ReaperNotice> {
        self.reaper_rx.recv().await
    }

    /// Gracefully shut down every slave and join its worker.
    pub async fn terminate(&mut self) {
        info!(target_uri = %self.target, slaves = self.slaves.len(), "engine terminating");

        for (thread_id, handle) in self.slaves.drain() {
            debug!(thread_id = %thread_id, "terminating slave");
            handle.terminate().await;
            handle.shutdown().await;
        }
    }

    fn ensure_slave(&mut self, thread_id: &str) -> Result<(), EngineError> {
        if self.slaves.contains_key(thread_id) {
            return Ok(());
        }

        let plugin = self
            .factory
            .instantiate(&self.target)
            .map_err(|e| EngineError::PluginFailure {
                reason: e.to_string(),
            })?;

        let handle = slave::spawn(
            &self.target,
            thread_id,
            plugin,
            self.storage.clone(),
            self.bus.clone(),
            self.reaper_tx.clone(),
            &self.config,
        )?;

        self.slaves.insert(thread_id.to_string(), handle);
        Ok(())
    }

    fn dispatch(&mut self, thread_id: &str, sink: SessionSink, command: Command) {
        let payload = match command.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                sink.fail(EngineError::from(e));
                return;
            }
        };

        let Some(handle) = self.slaves.get(thread_id) else {
            sink.fail(EngineError::NotFound {
                thread_id: thread_id.to_string(),
            });
            return;
        };

        self.next_session_id += 1;
        let session = Session::new(self.next_session_id, sink);
        handle.assign(session, Bytes::from(payload));
    }
}

fn thread_id_of(args: &Value) -> String {
    args.get("thread")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_THREAD)
        .to_string()
}

fn token_of(args: &Value) -> String {
    args.get("token")
        .and_then(Value::as_str)
        .unwrap_or("anonymous")
        .to_string()
}

fn build_command(args: &Value) -> Result<Command, EngineError> {
    let kind = args.get("type").and_then(Value::as_str).unwrap_or("once");
    let request = Request {
        future: FutureInfo {
            token: token_of(args),
        },
        args: args.clone(),
    };

    match kind {
        "auto" => Ok(Command::Auto(request)),
        "manual" => Ok(Command::Manual(request)),
        "once" => Ok(Command::Once(request)),
        other => {
            warn!(kind = other, "unknown request type");
            Err(EngineError::InvalidArgument {
                reason: format!("unknown request type '{}'", other),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Dict, Plugin, PluginError};
    use async_trait::async_trait;

    struct NullPlugin;

    #[async_trait]
    impl Plugin for NullPlugin {
        fn uri(&self) -> &str {
            "null://"
        }

        fn hash(&self) -> &str {
            "0"
        }

        async fn fetch(&mut self) -> Result<Dict, PluginError> {
            Ok(Dict::new())
        }
    }

    struct NullFactory;

    impl PluginFactory for NullFactory {
        fn instantiate(&self, _target: &str) -> Result<Box<dyn Plugin>, PluginError> {
            Ok(Box::new(NullPlugin))
        }
    }

    #[test]
    fn test_builder_requires_target() {
        let result = EngineBuilder::new().factory(Arc::new(NullFactory)).build();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("target"));
    }

    #[test]
    fn test_builder_requires_factory() {
        let result = EngineBuilder::new().target("null://").build();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("factory"));
    }

    #[tokio::test]
    async fn test_builder_defaults() {
        let mut engine = Engine::builder()
            .target("null://")
            .factory(Arc::new(NullFactory))
            .build()
            .unwrap();

        assert_eq!(engine.target(), "null://");
        assert_eq!(engine.slave_count(), 0);
        // No explicit bus, so the internal receiver is available exactly once.
        assert!(engine.take_events().is_some());
        assert!(engine.take_events().is_none());
    }

    #[test]
    fn test_builder_debug_hides_collaborators() {
        let builder = EngineBuilder::new()
            .target("null://")
            .factory(Arc::new(NullFactory));
        let debug = format!("{:?}", builder);
        assert!(debug.contains("EngineBuilder"));
        assert!(debug.contains("..."));
    }

    #[test]
    fn test_build_command_rejects_unknown_type() {
        let err = build_command(&serde_json::json!({"type": "reboot"})).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_thread_id_defaults() {
        assert_eq!(thread_id_of(&serde_json::json!({})), "default");
        assert_eq!(thread_id_of(&serde_json::json!({"thread": "aux"})), "aux");
    }
}
