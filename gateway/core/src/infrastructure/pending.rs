// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Pending Request Store - correlation table for request/reply over pub/sub
//!
//! Maps a correlation key to the oneshot channel its caller is waiting on.
//! Every entry leaves the table exactly once, through one of:
//!
//! - `complete` / `fail` (a reply, or an explicit failure, arrived)
//! - `await_reply` timing out (the caller removes its own entry)
//! - the cleanup sweeper expiring abandoned entries
//!
//! Removing an entry that is already gone is a no-op. The table is
//! in-memory only: a restart drops every in-flight request and its caller
//! observes [`CorrelationError::Dropped`].
//!
//! `create` on a key that is still in flight replaces the old entry and
//! fails the old caller with [`CorrelationError::Superseded`], so the old
//! caller gets an answer instead of hanging until its timeout.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::gateway::GatewayResponse;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CorrelationError {
    #[error("No reply for '{key}' within {waited:?}")]
    Timeout { key: String, waited: Duration },

    #[error("Pending request '{0}' was superseded by a newer request for the same key")]
    Superseded(String),

    #[error("Pending request '{0}' expired before a reply arrived")]
    Expired(String),

    #[error("Pending request '{0}' was dropped before a reply arrived")]
    Dropped(String),

    #[error("Request '{key}' failed: {reason}")]
    Failed { key: String, reason: String },
}

pub type ReplyResult = Result<GatewayResponse, CorrelationError>;

struct PendingEntry {
    id: u64,
    created_at: Instant,
    sender: oneshot::Sender<ReplyResult>,
}

/// The caller's half of a pending entry.
#[derive(Debug)]
pub struct PendingReply {
    key: String,
    id: u64,
    receiver: oneshot::Receiver<ReplyResult>,
}

impl PendingReply {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait without a deadline. Prefer [`PendingRequestStore::await_reply`].
    pub async fn wait(self) -> ReplyResult {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(CorrelationError::Dropped(self.key)),
        }
    }
}

#[derive(Default)]
pub struct PendingRequestStore {
    entries: DashMap<String, PendingEntry>,
    next_id: AtomicU64,
}

impl PendingRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a caller for `key`.
    pub fn create(&self, key: impl Into<String>) -> PendingReply {
        let key = key.into();
        let (sender, receiver) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = PendingEntry {
            id,
            created_at: Instant::now(),
            sender,
        };

        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            warn!(correlation_key = %key, "Pending request superseded by a new request for the same key");
            let _ = previous.sender.send(Err(CorrelationError::Superseded(key.clone())));
        }
        debug!(correlation_key = %key, "Pending request created");

        PendingReply { key, id, receiver }
    }

    /// Resolve the caller waiting on `key`. Returns `false` for orphans.
    pub fn complete(&self, key: &str, response: GatewayResponse) -> bool {
        self.resolve(key, Ok(response))
    }

    /// Reject the caller waiting on `key`. Returns `false` for orphans.
    pub fn fail(&self, key: &str, error: CorrelationError) -> bool {
        self.resolve(key, Err(error))
    }

    /// Drop the entry for `key` without answering it. Returns whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait for the reply up to `timeout`. On timeout the caller's own entry
    /// is removed (a newer entry for the same key is left alone).
    pub async fn await_reply(&self, reply: PendingReply, timeout: Duration) -> ReplyResult {
        let PendingReply { key, id, receiver } = reply;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CorrelationError::Dropped(key)),
            Err(_) => {
                self.entries.remove_if(&key, |_, entry| entry.id == id);
                warn!(correlation_key = %key, timeout_ms = timeout.as_millis() as u64, "Timed out waiting for reply");
                Err(CorrelationError::Timeout { key, waited: timeout })
            }
        }
    }

    /// Fail every entry older than `max_age`. Returns how many were expired.
    pub fn purge_expired(&self, max_age: Duration) -> usize {
        let stale: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|e| e.created_at.elapsed() > max_age)
            .map(|e| (e.key().clone(), e.id))
            .collect();

        let mut purged = 0;
        for (key, id) in stale {
            if let Some((_, entry)) = self.entries.remove_if(&key, |_, entry| entry.id == id) {
                let _ = entry.sender.send(Err(CorrelationError::Expired(key.clone())));
                warn!(correlation_key = %key, "Expired abandoned pending request");
                purged += 1;
            }
        }
        purged
    }

    /// Run [`PendingRequestStore::purge_expired`] every `interval` until the
    /// store is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired(max_age);
                if purged > 0 {
                    info!(purged, remaining = store.len(), "Pending request cleanup");
                }
            }
        })
    }

    fn resolve(&self, key: &str, result: ReplyResult) -> bool {
        let Some((_, entry)) = self.entries.remove(key) else {
            warn!(correlation_key = %key, "Orphaned reply: no pending request");
            return false;
        };
        if entry.sender.send(result).is_err() {
            debug!(correlation_key = %key, "Caller stopped waiting before the reply arrived");
        }
        true
    }
}
