// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the engine core.
//!
//! Provides a unified error type that maps to reply-envelope error codes and
//! to the numeric codes carried by wire `error` messages.

use std::fmt;

use apiary_protocol::control::ReplyError;
use apiary_protocol::frame::FrameError;

use crate::storage::StorageError;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while dispatching requests and driving workers.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// Malformed or missing scheduler parameters.
    InvalidArgument {
        /// What was wrong with the arguments.
        reason: String,
    },

    /// The plugin does not support the requested scheduling policy.
    CapabilityMissing {
        /// The capability that was required.
        capability: String,
    },

    /// No slave exists for the given thread id.
    NotFound {
        /// The thread id that was looked up.
        thread_id: String,
    },

    /// The worker died or announced its own death.
    WorkerGone {
        /// Why the worker is gone.
        reason: String,
    },

    /// A send hit the transport high-water mark.
    Overloaded,

    /// The plugin fetch raised; the worker is terminating.
    PluginFailure {
        /// The plugin's diagnostic.
        reason: String,
    },

    /// Protocol framing or codec failure.
    Transport {
        /// Codec-level details.
        details: String,
    },

    /// The durable store was unreachable; advisory only.
    StorageUnavailable {
        /// Store-level details.
        details: String,
    },

    /// An in-flight operation was interrupted by shutdown.
    Cancelled,
}

impl EngineError {
    /// Stable string code, used in control-plane reply envelopes.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::CapabilityMissing { .. } => "CAPABILITY_MISSING",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::WorkerGone { .. } => "WORKER_GONE",
            Self::Overloaded => "OVERLOADED",
            Self::PluginFailure { .. } => "PLUGIN_FAILURE",
            Self::Transport { .. } => "TRANSPORT",
            Self::StorageUnavailable { .. } => "STORAGE_UNAVAILABLE",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Stable numeric code, used on the wire by `error` messages.
    pub fn wire_code(&self) -> u32 {
        match self {
            Self::InvalidArgument { .. } => 1,
            Self::CapabilityMissing { .. } => 2,
            Self::NotFound { .. } => 3,
            Self::WorkerGone { .. } => 4,
            Self::Overloaded => 5,
            Self::PluginFailure { .. } => 6,
            Self::Transport { .. } => 7,
            Self::StorageUnavailable { .. } => 8,
            Self::Cancelled => 9,
        }
    }

    /// Rebuild an error from a wire `(code, reason)` pair.
    ///
    /// Unknown codes degrade to [`EngineError::Transport`] so a newer worker
    /// never crashes an older supervisor.
    pub fn from_wire(code: u32, reason: &str) -> Self {
        match code {
            1 => Self::InvalidArgument {
                reason: reason.to_string(),
            },
            2 => Self::CapabilityMissing {
                capability: reason.to_string(),
            },
            3 => Self::NotFound {
                thread_id: reason.to_string(),
            },
            4 => Self::WorkerGone {
                reason: reason.to_string(),
            },
            5 => Self::Overloaded,
            6 => Self::PluginFailure {
                reason: reason.to_string(),
            },
            7 => Self::Transport {
                details: reason.to_string(),
            },
            8 => Self::StorageUnavailable {
                details: reason.to_string(),
            },
            9 => Self::Cancelled,
            _ => Self::Transport {
                details: format!("code {}: {}", code, reason),
            },
        }
    }

    /// Convert this error to a reply-envelope diagnostic.
    pub fn to_reply_error(&self) -> ReplyError {
        ReplyError {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { reason } => {
                write!(f, "invalid argument: {}", reason)
            }
            Self::CapabilityMissing { capability } => {
                write!(f, "plugin does not support {}", capability)
            }
            Self::NotFound { thread_id } => {
                write!(f, "no slave for thread '{}'", thread_id)
            }
            Self::WorkerGone { reason } => {
                write!(f, "worker gone: {}", reason)
            }
            Self::Overloaded => {
                write!(f, "transport high-water mark reached")
            }
            Self::PluginFailure { reason } => {
                write!(f, "plugin failure: {}", reason)
            }
            Self::Transport { details } => {
                write!(f, "transport error: {}", details)
            }
            Self::StorageUnavailable { details } => {
                write!(f, "storage unavailable: {}", details)
            }
            Self::Cancelled => {
                write!(f, "cancelled by shutdown")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<FrameError> for EngineError {
    fn from(err: FrameError) -> Self {
        EngineError::Transport {
            details: err.to_string(),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::StorageUnavailable {
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Transport {
            details: format!("json: {}", err),
        }
    }
}
