// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor-side worker handles.
//!
//! A slave represents one worker to its engine: it spawns the worker thread,
//! owns the transport and the session map, watches the heartbeat and idle
//! deadlines, and demultiplexes inbound RPC by session id. The engine talks
//! to it through a bounded command queue; the queue depth is the transport
//! high-water mark.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{self, DuplexStream, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use apiary_protocol::bus::BusEvent;
use apiary_protocol::frame::FrameError;
use apiary_protocol::rpc::{Message, read_message, terminate, write_message};

use crate::config::Config;
use crate::error::EngineError;
use crate::overseer::{Overseer, ReaperNotice};
use crate::plugin::Plugin;
use crate::session::Session;
use crate::storage::Storage;

/// Lifecycle of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    /// Spawned, no heartbeat seen yet. Sessions queue until activation.
    Unknown,
    /// Heartbeating; sessions flow.
    Active,
    /// Gracefully terminating; no new sessions accepted.
    Inactive,
    /// Terminal. A dead slave owns no sessions.
    Dead,
}

/// Commands the engine posts to a slave driver.
pub(crate) enum SlaveCommand {
    /// Dispatch a session with its control payload.
    Assign { session: Session, payload: Bytes },
    /// Begin a graceful shutdown.
    Terminate,
}

/// Engine-owned handle for one worker.
pub(crate) struct SlaveHandle {
    pub(crate) id: uuid::Uuid,
    cmd_tx: mpsc::Sender<SlaveCommand>,
    driver: tokio::task::JoinHandle<()>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SlaveHandle {
    /// Post a session to the driver. Overflow and closure fail the session
    /// synchronously instead of blocking the engine.
    pub(crate) fn assign(&self, session: Session, payload: Bytes) {
        match self.cmd_tx.try_send(SlaveCommand::Assign { session, payload }) {
            Ok(()) => {}
            Err(err) => {
                let (command, error) = match err {
                    mpsc::error::TrySendError::Full(command) => {
                        warn!(slave = %self.id, "command queue full");
                        (command, EngineError::Overloaded)
                    }
                    mpsc::error::TrySendError::Closed(command) => (
                        command,
                        EngineError::WorkerGone {
                            reason: "worker is shutting down".to_string(),
                        },
                    ),
                };
                if let SlaveCommand::Assign { session, .. } = command {
                    session.sink.fail(error);
                }
            }
        }
    }

    /// Ask the driver for a graceful shutdown.
    pub(crate) async fn terminate(&self) {
        let _ = self.cmd_tx.send(SlaveCommand::Terminate).await;
    }

    /// Tear down after a graceful terminate: close the command queue, wait
    /// for the driver to drain the worker, join the worker thread.
    pub(crate) async fn shutdown(self) {
        let SlaveHandle {
            id,
            cmd_tx,
            driver,
            worker,
        } = self;

        drop(cmd_tx);
        if driver.await.is_err() {
            error!(slave = %id, "slave driver panicked");
        }
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            error!(slave = %id, "worker thread panicked");
        }
    }

    /// Tear down a slave that died. A worker stuck inside plugin code can
    /// never be joined; it is detached instead of deadlocking the engine.
    pub(crate) async fn discard(self) {
        let SlaveHandle {
            id,
            cmd_tx,
            driver,
            worker,
        } = self;

        drop(cmd_tx);
        if driver.await.is_err() {
            error!(slave = %id, "slave driver panicked");
        }
        if let Some(worker) = worker {
            if worker.is_finished() {
                if worker.join().is_err() {
                    error!(slave = %id, "worker thread panicked");
                }
            } else {
                warn!(slave = %id, "detaching unresponsive worker thread");
            }
        }
    }
}

/// Spawn a worker thread for `plugin` and the driver task supervising it.
pub(crate) fn spawn(
    target: &str,
    thread_id: &str,
    plugin: Box<dyn Plugin>,
    storage: Arc<dyn Storage>,
    bus: mpsc::Sender<BusEvent>,
    reaper: mpsc::UnboundedSender<ReaperNotice>,
    config: &Config,
) -> Result<SlaveHandle, EngineError> {
    let id = uuid::Uuid::new_v4();
    let (supervisor_pipe, worker_pipe) = io::duplex(config.transport_buffer_bytes);

    let overseer = Overseer::new(
        target,
        thread_id,
        plugin,
        storage,
        bus,
        reaper.clone(),
        config.clone(),
    );

    let worker = thread::Builder::new()
        .name(format!("apiary-worker-{}", id))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "failed to build worker runtime");
                    return;
                }
            };
            runtime.block_on(overseer.run(worker_pipe));
        })
        .map_err(|e| EngineError::WorkerGone {
            reason: format!("failed to spawn worker thread: {}", e),
        })?;

    debug!(slave = %id, thread_id, "worker thread spawned");

    let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue_depth);
    let slave = Slave::new(id, target, thread_id, reaper, config.clone());
    let driver = tokio::spawn(slave.run(supervisor_pipe, cmd_rx));

    Ok(SlaveHandle {
        id,
        cmd_tx,
        driver,
        worker: Some(worker),
    })
}

/// Driver-owned slave state.
struct Slave {
    id: uuid::Uuid,
    target: String,
    thread_id: String,
    state: SlaveState,
    sessions: HashMap<u64, Session>,
    /// Sessions assigned before the first heartbeat.
    pending: VecDeque<(Session, Bytes)>,
    reaper: mpsc::UnboundedSender<ReaperNotice>,
    config: Config,
    heartbeat_deadline: Instant,
    idle_deadline: Instant,
}

impl Slave {
    fn new(
        id: uuid::Uuid,
        target: &str,
        thread_id: &str,
        reaper: mpsc::UnboundedSender<ReaperNotice>,
        config: Config,
    ) -> Self {
        Self {
            id,
            target: target.to_string(),
            thread_id: thread_id.to_string(),
            state: SlaveState::Unknown,
            sessions: HashMap::new(),
            pending: VecDeque::new(),
            reaper,
            config,
            heartbeat_deadline: Instant::now(),
            idle_deadline: Instant::now(),
        }
    }

    async fn run(mut self, transport: DuplexStream, mut cmd_rx: mpsc::Receiver<SlaveCommand>) {
        let (mut rd, mut wr) = io::split(transport);

        self.heartbeat_deadline = Instant::now() + self.config.heartbeat_timeout;
        self.idle_deadline = Instant::now() + self.config.idle_timeout;

        debug!(slave = %self.id, thread_id = %self.thread_id, "slave driver started");

        let mut cmd_closed = false;

        loop {
            tokio::select! {
                biased;

                command = cmd_rx.recv(), if !cmd_closed => match command {
                    Some(SlaveCommand::Assign { session, payload }) => {
                        if !self.on_assign(session, payload, &mut wr).await {
                            break;
                        }
                    }
                    Some(SlaveCommand::Terminate) => self.terminate(&mut wr).await,
                    None => {
                        // The engine dropped the handle. A terminating slave
                        // keeps draining the worker; anything else just stops.
                        cmd_closed = true;
                        if self.state != SlaveState::Inactive {
                            break;
                        }
                    }
                },

                message = read_message(&mut rd) => match message {
                    Ok(message) => {
                        if !self.on_message(message, &mut wr).await {
                            break;
                        }
                    }
                    Err(FrameError::ConnectionClosed) => {
                        self.on_disconnect();
                        break;
                    }
                    Err(e) => {
                        // The worker cannot report a codec failure itself.
                        self.die(format!("transport error: {}", e), true);
                        break;
                    }
                },

                _ = time::sleep_until(self.heartbeat_deadline) => {
                    self.die("heartbeat deadline elapsed".to_string(), true);
                    break;
                }

                _ = time::sleep_until(self.idle_deadline) => {
                    self.on_idle(&mut wr).await;
                }
            }
        }

        debug!(slave = %self.id, state = ?self.state, "slave driver stopped");
    }

    /// Returns false when the driver must stop.
    async fn on_assign(
        &mut self,
        session: Session,
        payload: Bytes,
        wr: &mut WriteHalf<DuplexStream>,
    ) -> bool {
        match self.state {
            SlaveState::Unknown => {
                debug!(slave = %self.id, session_id = session.id, "queueing session until activation");
                self.pending.push_back((session, payload));
                true
            }
            SlaveState::Active => self.dispatch(session, payload, wr).await,
            SlaveState::Inactive => {
                session.sink.fail(EngineError::Overloaded);
                true
            }
            SlaveState::Dead => {
                session.sink.fail(EngineError::WorkerGone {
                    reason: "worker is dead".to_string(),
                });
                true
            }
        }
    }

    /// Insert into the session map, send the invoke, rearm the idle timer.
    async fn dispatch(
        &mut self,
        session: Session,
        payload: Bytes,
        wr: &mut WriteHalf<DuplexStream>,
    ) -> bool {
        let message = Message::Invoke {
            session_id: session.id,
            payload,
        };
        self.sessions.insert(session.id, session);
        self.idle_deadline = Instant::now() + self.config.idle_timeout;

        match write_message(wr, message).await {
            Ok(()) => true,
            Err(e) => {
                self.die(format!("transport write failed: {}", e), true);
                false
            }
        }
    }

    /// Returns false when the driver must stop.
    async fn on_message(&mut self, message: Message, wr: &mut WriteHalf<DuplexStream>) -> bool {
        match message {
            Message::Heartbeat => self.on_heartbeat(wr).await,
            Message::Push { session_id, chunk } => {
                match self.sessions.get(&session_id) {
                    Some(session) => session.sink.chunk(chunk),
                    None => debug!(slave = %self.id, session_id, "chunk for unknown session discarded"),
                }
                true
            }
            Message::Error {
                session_id,
                code,
                reason,
            } => {
                if let Some(session) = self.sessions.remove(&session_id) {
                    session.sink.fail(EngineError::from_wire(code, &reason));
                }
                true
            }
            Message::Release { session_id } => {
                if let Some(session) = self.sessions.remove(&session_id) {
                    session.sink.close();
                }
                true
            }
            Message::Terminate { code, reason } => {
                // Worker suicide. It has already posted its reaper notice.
                self.die(format!("worker suicide ({}): {}", code, reason), false);
                false
            }
            Message::Invoke { session_id, .. } => {
                warn!(slave = %self.id, session_id, "unexpected invoke from worker");
                true
            }
        }
    }

    async fn on_heartbeat(&mut self, wr: &mut WriteHalf<DuplexStream>) -> bool {
        match self.state {
            SlaveState::Unknown => {
                debug!(slave = %self.id, "slave activated");
                self.state = SlaveState::Active;
                self.heartbeat_deadline = Instant::now() + self.config.heartbeat_timeout;

                while let Some((session, payload)) = self.pending.pop_front() {
                    if !self.dispatch(session, payload, wr).await {
                        return false;
                    }
                }
                true
            }
            SlaveState::Active => {
                self.heartbeat_deadline = Instant::now() + self.config.heartbeat_timeout;
                true
            }
            // Stale beats after a terminate carry no information.
            SlaveState::Inactive | SlaveState::Dead => true,
        }
    }

    /// The idle timer fired: an empty slave is terminated, a busy one rearms.
    async fn on_idle(&mut self, wr: &mut WriteHalf<DuplexStream>) {
        if self.state == SlaveState::Active && self.sessions.is_empty() && self.pending.is_empty() {
            info!(slave = %self.id, "idle for too long, terminating");
            self.terminate(wr).await;
        } else {
            self.idle_deadline = Instant::now() + self.config.idle_timeout;
        }
    }

    /// Graceful shutdown: flush the pending queue, tell the worker, wait for
    /// it to drain and close the pipe.
    async fn terminate(&mut self, wr: &mut WriteHalf<DuplexStream>) {
        if matches!(self.state, SlaveState::Inactive | SlaveState::Dead) {
            return;
        }

        info!(slave = %self.id, "terminating gracefully");
        self.state = SlaveState::Inactive;

        // Pending sessions never reached the worker.
        while let Some((session, _)) = self.pending.pop_front() {
            session.sink.fail(EngineError::Overloaded);
        }

        self.heartbeat_deadline = Instant::now() + Duration::from_secs(86400 * 365 * 30);
        self.idle_deadline = Instant::now() + Duration::from_secs(86400 * 365 * 30);

        let message = Message::Terminate {
            code: terminate::NORMAL,
            reason: String::new(),
        };
        if write_message(wr, message).await.is_err() {
            self.die("transport write failed during terminate".to_string(), true);
        }
    }

    /// The worker closed its end of the pipe.
    fn on_disconnect(&mut self) {
        match self.state {
            SlaveState::Inactive => {
                // Clean exit after a graceful terminate. In-flight replies
                // have drained; whatever is left was interrupted.
                for (_, session) in self.sessions.drain() {
                    session.sink.fail(EngineError::Cancelled);
                }
                debug!(slave = %self.id, "worker exited after terminate");
            }
            SlaveState::Dead => {}
            SlaveState::Unknown | SlaveState::Active => {
                // A worker that dies by itself posts its own reaper notice
                // right before closing the pipe; no second notice here.
                self.die("worker closed the transport".to_string(), false);
            }
        }
    }

    /// Transition to `Dead`: fail every session, optionally tell the reaper.
    fn die(&mut self, reason: String, notify: bool) {
        warn!(slave = %self.id, reason = %reason, "slave died");
        self.state = SlaveState::Dead;

        let error = EngineError::WorkerGone { reason };
        for (_, session) in self.sessions.drain() {
            session.sink.fail(error.clone());
        }
        while let Some((session, _)) = self.pending.pop_front() {
            session.sink.fail(error.clone());
        }

        if notify {
            let notice = ReaperNotice {
                engine: self.target.clone(),
                thread: self.thread_id.clone(),
            };
            let _ = self.reaper.send(notice);
        }
    }
}
