// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Transport Port
//!
//! The publish/subscribe transport is an external collaborator. The gateway
//! assumes at-least-once delivery, no ordering across keys, and compensates
//! with deduplication and correlation.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use thiserror::Error;

/// Header carrying the envelope type tag when the transport supports headers.
pub const MESSAGE_TYPE_HEADER: &str = "message-type";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub topic: String,

    /// Partition-affinity key; the session / correlation identifier.
    pub key: Option<String>,

    pub headers: HashMap<String, String>,

    pub payload: Vec<u8>,
}

impl TransportMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            headers: HashMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn message_type(&self) -> Option<&str> {
        self.headers.get(MESSAGE_TYPE_HEADER).map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,
}

/// Publish/subscribe transport shared by every module on the same topics
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, message: TransportMessage) -> Result<(), TransportError>;

    /// Stream of messages published to `topic` after this call returns.
    fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, TransportMessage>, TransportError>;
}
