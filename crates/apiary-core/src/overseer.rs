// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The worker-side event loop.
//!
//! An overseer owns one plugin instance and every scheduler driving it. It
//! runs single-threaded inside the worker: control ingress, scheduler
//! firing, heartbeats and the idle self-destruct all interleave on one loop,
//! so plugin code never observes concurrency.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

use apiary_protocol::bus::{BusEvent, Dict, encode_dict};
use apiary_protocol::control::{Command, Reply, Request};
use apiary_protocol::frame::FrameError;
use apiary_protocol::rpc::{Message, read_message, terminate, write_message};

use crate::config::Config;
use crate::error::EngineError;
use crate::plugin::Plugin;
use crate::scheduler::Scheduler;
use crate::storage::Storage;

/// Notice that a worker died and its slave should be reaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperNotice {
    /// Target URI of the owning engine.
    pub engine: String,
    /// Thread id of the dead worker.
    pub thread: String,
}

/// How a loop turn ended.
enum Flow {
    Continue,
    /// Supervisor asked for a graceful shutdown.
    Graceful,
    /// The idle self-destruct fired.
    Suicide,
    /// The plugin raised; the worker must die and say why.
    PluginDead(String),
    /// The supervisor side of the transport went away.
    Detached,
}

struct ScheduleEntry {
    scheduler: Scheduler,
    /// Next fire time, seconds on the loop timebase.
    next_fire: f64,
}

/// Worker-resident supervisor of one plugin and its schedulers.
pub struct Overseer {
    target: String,
    thread_id: String,
    plugin: Box<dyn Plugin>,
    storage: Arc<dyn Storage>,
    bus: mpsc::Sender<BusEvent>,
    reaper: mpsc::UnboundedSender<ReaperNotice>,
    config: Config,
    table: HashMap<String, ScheduleEntry>,
    /// `(caller-token, scheduler-key)` pairs; duplicates collapse.
    subscriptions: HashSet<(String, String)>,
    /// Fetch result for the current loop turn. Cleared before every turn so
    /// schedulers firing on one tick share a single plugin fetch.
    cache: Option<Dict>,
    epoch: Instant,
    idle_deadline: Option<Instant>,
}

enum ScheduleKind {
    Auto,
    Manual,
}

impl Overseer {
    /// Create an overseer for one worker.
    pub fn new(
        target: impl Into<String>,
        thread_id: impl Into<String>,
        plugin: Box<dyn Plugin>,
        storage: Arc<dyn Storage>,
        bus: mpsc::Sender<BusEvent>,
        reaper: mpsc::UnboundedSender<ReaperNotice>,
        config: Config,
    ) -> Self {
        Self {
            target: target.into(),
            thread_id: thread_id.into(),
            plugin,
            storage,
            bus,
            reaper,
            config,
            table: HashMap::new(),
            subscriptions: HashSet::new(),
            cache: None,
            epoch: Instant::now(),
            idle_deadline: None,
        }
    }

    /// Run the event loop until shutdown. Consumes the overseer; the worker
    /// exits when this returns.
    pub async fn run(mut self, transport: DuplexStream) {
        let (mut rd, mut wr) = tokio::io::split(transport);
        let mut heartbeat = time::interval(self.config.heartbeat_interval);

        self.epoch = Instant::now();
        // The scheduler table is empty at boot, so the self-destruct starts armed.
        self.idle_deadline = Some(self.epoch + self.config.suicide_timeout);

        info!(target_uri = %self.target, thread = %self.thread_id, "worker loop started");

        let outcome = loop {
            // Pre-turn hook: invalidate the fetch cache.
            self.cache = None;

            let fire_at = self.next_fire_deadline();
            let idle_at = self.idle_deadline;

            tokio::select! {
                biased;

                message = read_message(&mut rd) => match message {
                    Ok(message) => match self.on_message(message, &mut wr).await {
                        Flow::Continue => {}
                        flow => break flow,
                    },
                    Err(FrameError::ConnectionClosed) => break Flow::Detached,
                    Err(e) => {
                        error!(error = %e, "transport codec failure");
                        break Flow::Detached;
                    }
                },

                _ = heartbeat.tick() => {
                    if write_message(&mut wr, Message::Heartbeat).await.is_err() {
                        break Flow::Detached;
                    }
                }

                _ = sleep_maybe(fire_at) => {
                    match self.on_tick().await {
                        Flow::Continue => {}
                        flow => break flow,
                    }
                }

                _ = sleep_maybe(idle_at) => break Flow::Suicide,
            }
        };

        match outcome {
            Flow::Continue => unreachable!("loop only breaks with a terminal flow"),
            Flow::Graceful => {
                info!(target_uri = %self.target, "terminating");
                self.table.clear();
                self.subscriptions.clear();
                self.cancel_queued(&mut rd, &mut wr).await;
            }
            Flow::Suicide => {
                info!(target_uri = %self.target, "idle for too long, committing suicide");
                self.notify_reaper();
            }
            Flow::PluginDead(reason) => {
                let _ = write_message(
                    &mut wr,
                    Message::Terminate {
                        code: terminate::ABNORMAL,
                        reason: reason.clone(),
                    },
                )
                .await;
                self.notify_reaper();
            }
            Flow::Detached => {
                debug!(target_uri = %self.target, "supervisor detached");
            }
        }

        info!(target_uri = %self.target, thread = %self.thread_id, "worker loop stopped");
    }

    async fn on_message(
        &mut self,
        message: Message,
        wr: &mut WriteHalf<DuplexStream>,
    ) -> Flow {
        match message {
            Message::Invoke {
                session_id,
                payload,
            } => self.on_invoke(session_id, &payload, wr).await,
            Message::Terminate { code, reason } => {
                debug!(code, reason = %reason, "terminate received");
                Flow::Graceful
            }
            Message::Release { session_id } => {
                // The supervisor lost interest in a session; nothing to tear
                // down on this side, replies are fire-and-forget.
                debug!(session_id, "session released by supervisor");
                Flow::Continue
            }
            other => {
                warn!(code = ?other.code(), "unexpected message from supervisor");
                Flow::Continue
            }
        }
    }

    async fn on_invoke(
        &mut self,
        session_id: u64,
        payload: &[u8],
        wr: &mut WriteHalf<DuplexStream>,
    ) -> Flow {
        let command = match Command::from_bytes(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(session_id, error = %e, "malformed control payload");
                let error = EngineError::from(e);
                let message = Message::Error {
                    session_id,
                    code: error.wire_code(),
                    reason: error.to_string(),
                };
                if write_message(wr, message).await.is_err() {
                    return Flow::Detached;
                }
                return Flow::Continue;
            }
        };

        match command {
            Command::Auto(request) => {
                self.schedule(ScheduleKind::Auto, session_id, request, wr)
                    .await
            }
            Command::Manual(request) => {
                self.schedule(ScheduleKind::Manual, session_id, request, wr)
                    .await
            }
            Command::Once(request) => self.once(session_id, request, wr).await,
            Command::Stop(request) => self.stop(session_id, request, wr).await,
            Command::Terminate => Flow::Graceful,
        }
    }

    /// Install a scheduler, subscribe the caller and persist the request.
    async fn schedule(
        &mut self,
        kind: ScheduleKind,
        session_id: u64,
        request: Request,
        wr: &mut WriteHalf<DuplexStream>,
    ) -> Flow {
        let token = request.future.token.clone();

        let built = match kind {
            ScheduleKind::Auto => Scheduler::auto(self.plugin.hash(), &request.args),
            ScheduleKind::Manual => Scheduler::manual(self.plugin.as_ref(), &request.args),
        };
        let mut scheduler = match built {
            Ok(scheduler) => scheduler,
            Err(e) => {
                let reply = Reply::error(&token, e.error_code(), e.to_string());
                return self.reply(session_id, reply, wr).await;
            }
        };
        let key = scheduler.key().to_string();

        if !self.table.contains_key(&key) {
            // Start before insert: the first deadline is computed up front so
            // a failure here leaves no orphan table entry.
            let now = self.now();
            let next_fire = scheduler.reschedule(self.plugin.as_mut(), now);
            self.table.insert(
                key.clone(),
                ScheduleEntry {
                    scheduler,
                    next_fire,
                },
            );

            if self.idle_deadline.take().is_some() {
                debug!(target_uri = %self.target, "suicide timer stopped");
            }
        }

        if self.subscriptions.insert((token.clone(), key.clone())) {
            debug!(token = %token, key = %key, "subscribed");
        }

        let transient = request
            .args
            .get("transient")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !transient
            && let Err(e) = self.persist(&key, &token, &request.args).await
        {
            // Persistence is advisory; the schedule itself stands.
            warn!(key = %key, error = %e, "failed to persist schedule record");
        }

        self.reply(session_id, Reply::key(&token, &key), wr).await
    }

    /// Perform a single fetch and reply with the result.
    async fn once(
        &mut self,
        session_id: u64,
        request: Request,
        wr: &mut WriteHalf<DuplexStream>,
    ) -> Flow {
        let token = request.future.token;

        match self.fetch().await {
            Ok(dict) => {
                let mut result = serde_json::Map::new();
                for (k, v) in &dict {
                    result.insert(k.clone(), Value::String(BASE64.encode(v)));
                }

                // Rearm the stall timer if it's active.
                if self.idle_deadline.is_some() {
                    self.idle_deadline = Some(Instant::now() + self.config.suicide_timeout);
                    debug!(target_uri = %self.target, "suicide timer rearmed");
                }

                self.reply(session_id, Reply::result(token, Value::Object(result)), wr)
                    .await
            }
            Err(e) => {
                // The caller learns the diagnostic before the worker dies.
                let reply = Reply::error(&token, e.error_code(), e.to_string());
                if let Flow::Detached = self.reply(session_id, reply, wr).await {
                    return Flow::Detached;
                }
                Flow::PluginDead(e.to_string())
            }
        }
    }

    /// Dispose a scheduler by key once its last subscriber unsubscribes.
    async fn stop(
        &mut self,
        session_id: u64,
        request: Request,
        wr: &mut WriteHalf<DuplexStream>,
    ) -> Flow {
        let token = request.future.token.clone();

        let key = match request.args.get("key").and_then(Value::as_str) {
            Some(key) => key.to_string(),
            None => {
                let reply = Reply::error(&token, "INVALID_ARGUMENT", "key is required");
                return self.reply(session_id, reply, wr).await;
            }
        };

        if !self.table.contains_key(&key) {
            let reply = Reply::error(
                &token,
                "NOT_FOUND",
                format!("no scheduler for key '{}'", key),
            );
            return self.reply(session_id, reply, wr).await;
        }

        self.subscriptions.remove(&(token.clone(), key.clone()));
        let remaining = self.subscriptions.iter().filter(|(_, k)| *k == key).count();

        if remaining == 0 {
            self.table.remove(&key);
            info!(key = %key, "scheduler disposed");

            if self.table.is_empty() {
                self.idle_deadline = Some(Instant::now() + self.config.suicide_timeout);
                debug!(target_uri = %self.target, "suicide timer armed");
            }
        }

        self.reply(session_id, Reply::key(token, key), wr).await
    }

    /// Fire every due scheduler. At most one plugin fetch happens per turn.
    async fn on_tick(&mut self) -> Flow {
        let now = self.now();
        let due: Vec<String> = self
            .table
            .iter()
            .filter(|(_, entry)| entry.next_fire <= now)
            .map(|(key, _)| key.clone())
            .collect();

        if due.is_empty() {
            return Flow::Continue;
        }

        let dict = match self.fetch().await {
            Ok(dict) => dict,
            Err(e) => return Flow::PluginDead(e.to_string()),
        };

        // An empty dict suppresses publication entirely.
        let payload = if dict.is_empty() {
            None
        } else {
            match encode_dict(&dict) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    error!(error = %e, "failed to encode fetch result");
                    None
                }
            }
        };

        for key in due {
            if let Some(payload) = &payload {
                let event = BusEvent {
                    key: key.clone(),
                    payload: payload.clone(),
                };
                if self.bus.try_send(event).is_err() {
                    warn!(key = %key, "event bus full, dropping publication");
                }
            }

            let Some(entry) = self.table.get_mut(&key) else {
                continue;
            };
            entry.next_fire = entry.scheduler.reschedule(self.plugin.as_mut(), now);
        }

        Flow::Continue
    }

    /// Fetch through the per-turn cache.
    async fn fetch(&mut self) -> Result<Dict, EngineError> {
        if let Some(cache) = &self.cache {
            return Ok(cache.clone());
        }

        match self.plugin.fetch().await {
            Ok(dict) => {
                self.cache = Some(dict.clone());
                Ok(dict)
            }
            Err(e) => {
                error!(plugin = %self.plugin.uri(), error = %e, "plugin fetch raised");
                Err(EngineError::PluginFailure {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Write an idempotent schedule record keyed by `digest(key + token)`.
    async fn persist(&self, key: &str, token: &str, args: &Value) -> Result<(), EngineError> {
        let object_id = format!("{:x}", Sha256::digest(format!("{}{}", key, token)));

        if self.storage.exists(&object_id).await? {
            return Ok(());
        }

        let record = json!({
            "url": self.plugin.uri(),
            "args": args,
            "token": token,
        });
        let bytes = serde_json::to_vec(&record)?;
        self.storage.put(&object_id, &bytes).await?;

        Ok(())
    }

    /// Send the single reply for a future-carrying command: one push with
    /// the envelope, then a release closing the session.
    async fn reply(
        &mut self,
        session_id: u64,
        reply: Reply,
        wr: &mut WriteHalf<DuplexStream>,
    ) -> Flow {
        let bytes = match reply.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(session_id, error = %e, "failed to encode reply");
                return Flow::Continue;
            }
        };

        let push = Message::Push {
            session_id,
            chunk: Bytes::from(bytes),
        };
        if write_message(wr, push).await.is_err() {
            return Flow::Detached;
        }
        if write_message(wr, Message::Release { session_id }).await.is_err() {
            return Flow::Detached;
        }

        Flow::Continue
    }

    /// Reply `CANCELLED` to commands already queued on the pipe at shutdown.
    async fn cancel_queued(
        &mut self,
        rd: &mut ReadHalf<DuplexStream>,
        wr: &mut WriteHalf<DuplexStream>,
    ) {
        while let Ok(Ok(message)) = time::timeout(Duration::ZERO, read_message(rd)).await {
            if let Message::Invoke {
                session_id,
                payload,
            } = message
                && let Ok(command) = Command::from_bytes(&payload)
                && let Some(token) = command.token()
            {
                let error = EngineError::Cancelled;
                let reply = Reply::error(token, error.error_code(), error.to_string());
                if let Flow::Detached = self.reply(session_id, reply, wr).await {
                    return;
                }
            }
        }
    }

    fn notify_reaper(&self) {
        let notice = ReaperNotice {
            engine: self.target.clone(),
            thread: self.thread_id.clone(),
        };
        if self.reaper.send(notice).is_err() {
            debug!(target_uri = %self.target, "reaper channel closed");
        }
    }

    fn next_fire_deadline(&self) -> Option<Instant> {
        self.table
            .values()
            .map(|entry| entry.next_fire)
            .min_by(|a, b| a.total_cmp(b))
            .map(|secs| self.epoch + Duration::from_secs_f64(secs.max(0.0)))
    }

    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Sleep until `at`, or forever when there is no deadline.
async fn sleep_maybe(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
