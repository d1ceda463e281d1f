// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound event-bus publications.
//!
//! Each publication is a two-frame unit: the scheduler key, then the fetch
//! result encoded as a deterministic binary dictionary. Both frames of one
//! publication are emitted contiguously even when several schedulers fire
//! on the same tick.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// A fetch result: string keys mapped to opaque byte values.
pub type Dict = BTreeMap<String, Vec<u8>>;

/// Maximum size accepted when decoding a dictionary payload.
///
/// Large enough for any fetch a well-behaved plugin produces while bounding
/// what a corrupted or hostile payload can allocate.
pub const MAX_DICT_SIZE: u64 = 1024 * 1024;

/// Errors produced by the dictionary codec.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("dictionary encode failed: {0}")]
    Encode(#[source] bincode::Error),

    #[error("dictionary decode failed: {0}")]
    Decode(#[source] bincode::Error),
}

/// One publication on the outbound bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    /// Scheduler key that produced the payload.
    pub key: String,
    /// Encoded dictionary, see [`encode_dict`].
    pub payload: Vec<u8>,
}

impl BusEvent {
    /// Build a publication from a scheduler key and a fetch result.
    pub fn new(key: impl Into<String>, dict: &Dict) -> Result<Self, BusError> {
        Ok(Self {
            key: key.into(),
            payload: encode_dict(dict)?,
        })
    }

    /// The two wire frames of this publication, in emission order.
    pub fn frames(&self) -> (Bytes, Bytes) {
        (
            Bytes::copy_from_slice(self.key.as_bytes()),
            Bytes::copy_from_slice(&self.payload),
        )
    }

    /// Decode the payload back into a dictionary.
    pub fn dict(&self) -> Result<Dict, BusError> {
        decode_dict(&self.payload)
    }
}

/// Encode a dictionary deterministically.
///
/// `BTreeMap` iteration order makes the encoding stable for equal inputs.
pub fn encode_dict(dict: &Dict) -> Result<Vec<u8>, BusError> {
    bincode::serialize(dict).map_err(BusError::Encode)
}

/// Decode a dictionary payload, bounded by [`MAX_DICT_SIZE`].
pub fn decode_dict(bytes: &[u8]) -> Result<Dict, BusError> {
    deserialize_safe(bytes).map_err(BusError::Decode)
}

/// Safely deserialize bincode data with a size limit.
///
/// Unlike the default bincode deserializer, this function:
/// - Enforces a maximum payload size ([`MAX_DICT_SIZE`])
/// - Uses fixed-integer encoding for deterministic sizes
/// - Allows trailing bytes for forward compatibility
pub fn deserialize_safe<T>(bytes: &[u8]) -> Result<T, bincode::Error>
where
    T: DeserializeOwned,
{
    use bincode::Options;

    bincode::DefaultOptions::new()
        .with_limit(MAX_DICT_SIZE)
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .deserialize(bytes)
}
