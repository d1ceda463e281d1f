// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane envelopes carried inside `invoke` payloads.
//!
//! The supervisor talks to a worker's event loop in JSON-shaped commands.
//! Every command except `terminate` carries a future token; the worker
//! answers each such command with exactly one [`Reply`] on the session that
//! delivered it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The caller-side completion handle attached to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FutureInfo {
    /// Opaque caller token, also used to track subscriptions.
    pub token: String,
}

/// Body shared by all future-carrying commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Completion handle for the reply.
    pub future: FutureInfo,
    /// Command arguments; interpretation depends on the command.
    #[serde(default)]
    pub args: Value,
}

impl Request {
    /// Convenience constructor for tests and the dispatch layer.
    pub fn new(token: impl Into<String>, args: Value) -> Self {
        Self {
            future: FutureInfo {
                token: token.into(),
            },
            args,
        }
    }
}

/// A control command for the worker's event loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    /// Install a fixed-interval scheduler. `args.interval` is milliseconds.
    Auto(Request),
    /// Install a plugin-paced scheduler. The plugin must advertise MANUAL.
    Manual(Request),
    /// Perform a single fetch and reply with the result.
    Once(Request),
    /// Dispose the scheduler named by `args.key`.
    Stop(Request),
    /// Shut the worker down gracefully. Carries no future and gets no reply.
    Terminate,
}

impl Command {
    /// Serialize to the wire representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the wire representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// The future token, if this command carries one.
    pub fn token(&self) -> Option<&str> {
        match self {
            Command::Auto(r) | Command::Manual(r) | Command::Once(r) | Command::Stop(r) => {
                Some(&r.future.token)
            }
            Command::Terminate => None,
        }
    }
}

/// Error half of a [`Reply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    /// Stable error code, e.g. `INVALID_ARGUMENT`.
    pub code: String,
    /// Human-readable diagnostic.
    pub message: String,
}

/// The single reply produced for a future-carrying command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// Token of the future this reply completes.
    pub token: String,
    /// Scheduler key, present for successful `auto`/`manual`/`stop`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Fetch result, present for successful `once`. Values are base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Diagnostic, present when the command failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl Reply {
    /// Successful schedule/stop reply carrying the scheduler key.
    pub fn key(token: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            key: Some(key.into()),
            result: None,
            error: None,
        }
    }

    /// Successful one-shot reply carrying the fetch result.
    pub fn result(token: impl Into<String>, result: Value) -> Self {
        Self {
            token: token.into(),
            key: None,
            result: Some(result),
            error: None,
        }
    }

    /// Failure reply with a stable code and a diagnostic.
    pub fn error(
        token: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            key: None,
            result: None,
            error: Some(ReplyError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// True when the command failed.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Serialize to the wire representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the wire representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
