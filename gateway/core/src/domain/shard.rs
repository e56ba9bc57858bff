// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Context Shards
//!
//! A shard is a named, versioned fragment of prompt context. Stable shards
//! keep the same rendering for a given version, which lets the backend reuse
//! a cached prompt prefix; volatile shards change per call.
//!
//! Shards are supplied by the caller per request. Entities that want to
//! contribute context implement [`ShardSource`] instead of being introspected.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShardError {
    #[error("Shard type cannot be empty")]
    EmptyType,
}

/// Immutable context fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextShard {
    #[serde(rename = "type")]
    shard_type: String,

    #[serde(default)]
    version: u32,

    #[serde(default)]
    stable: bool,

    #[serde(default)]
    payload: Map<String, Value>,
}

impl ContextShard {
    pub fn new(
        shard_type: impl Into<String>,
        version: u32,
        stable: bool,
        payload: Map<String, Value>,
    ) -> Result<Self, ShardError> {
        let shard = Self {
            shard_type: shard_type.into(),
            version,
            stable,
            payload,
        };
        shard.validate()?;
        Ok(shard)
    }

    /// Snapshot a [`ShardSource`] into a shard.
    pub fn from_source(source: &dyn ShardSource) -> Result<Self, ShardError> {
        Self::new(
            source.shard_type(),
            source.shard_version(),
            source.is_stable(),
            source.shard_fields(),
        )
    }

    /// Deserialized shards bypass [`ContextShard::new`]; callers validate them here.
    pub fn validate(&self) -> Result<(), ShardError> {
        if self.shard_type.trim().is_empty() {
            return Err(ShardError::EmptyType);
        }
        Ok(())
    }

    pub fn shard_type(&self) -> &str {
        &self.shard_type
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Prefix-cache ordering: stable before volatile, then type, then version.
    pub fn prefix_order(&self, other: &Self) -> Ordering {
        other
            .stable
            .cmp(&self.stable)
            .then_with(|| self.shard_type.cmp(&other.shard_type))
            .then_with(|| self.version.cmp(&other.version))
    }
}

/// Capability implemented by entities that contribute prompt context.
pub trait ShardSource {
    fn shard_type(&self) -> String;

    fn shard_version(&self) -> u32 {
        0
    }

    fn is_stable(&self) -> bool {
        true
    }

    fn shard_fields(&self) -> Map<String, Value>;
}

/// Deterministic prompt-cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One shard rendered as a labeled text block, ready for backend input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBlock {
    pub shard_type: String,
    pub version: u32,
    pub stable: bool,
    pub text: String,
}
