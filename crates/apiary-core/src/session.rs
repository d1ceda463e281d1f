// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sessions: the lifetime of one dispatched request.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::EngineError;

/// What a session sink observes, in order: zero or more chunks, then exactly
/// one terminal event.
#[derive(Debug)]
pub enum SessionEvent {
    /// One result chunk, in worker emission order.
    Chunk(Bytes),
    /// Normal end-of-stream.
    Close,
    /// Abnormal termination.
    Error(EngineError),
}

/// Caller-supplied result sink for one request.
#[derive(Debug, Clone)]
pub struct SessionSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionSink {
    /// Create a sink and the receiver the caller reads results from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver a result chunk. A dropped receiver is not an error; the
    /// caller simply stopped listening.
    pub fn chunk(&self, chunk: Bytes) {
        let _ = self.tx.send(SessionEvent::Chunk(chunk));
    }

    /// Terminate normally.
    pub fn close(&self) {
        let _ = self.tx.send(SessionEvent::Close);
    }

    /// Terminate with a failure.
    pub fn fail(&self, error: EngineError) {
        let _ = self.tx.send(SessionEvent::Error(error));
    }
}

/// One live request inside a slave's session map.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) id: u64,
    pub(crate) sink: SessionSink,
    #[allow(dead_code)]
    pub(crate) birth: Instant,
}

impl Session {
    pub(crate) fn new(id: u64, sink: SessionSink) -> Self {
        Self {
            id,
            sink,
            birth: Instant::now(),
        }
    }
}
