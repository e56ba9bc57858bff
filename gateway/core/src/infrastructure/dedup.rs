// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Duplicate Guard
//!
//! Content-hash membership test for redelivered messages. The fingerprint
//! covers only the first [`FINGERPRINT_PREFIX_CHARS`] characters of the
//! message's string form, so collisions are possible; this is a loop and
//! redelivery heuristic, not an identity check.
//!
//! With [`DedupPolicy::ClearOnOverflow`] the whole window is dropped when it
//! fills up, so duplicates are only caught within a rolling, approximate
//! window. [`DedupPolicy::Lru`] evicts one fingerprint at a time instead.

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use tracing::debug;

use crate::domain::config::DedupPolicy;
use crate::domain::message::CanonicalMessage;

pub const FINGERPRINT_PREFIX_CHARS: usize = 100;
const FINGERPRINT_HEX_LEN: usize = 16;
const DEFAULT_MAX_ENTRIES: usize = 1000;

enum Seen {
    Window(HashSet<String>),
    Lru(LruCache<String, ()>),
}

/// Safe for concurrent callers; all state sits behind one mutex.
pub struct DuplicateGuard {
    max_entries: NonZeroUsize,
    seen: Mutex<Seen>,
}

impl DuplicateGuard {
    pub fn new(max_entries: usize, policy: DedupPolicy) -> Self {
        let max_entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        let seen = match policy {
            DedupPolicy::ClearOnOverflow => Seen::Window(HashSet::new()),
            DedupPolicy::Lru => Seen::Lru(LruCache::new(max_entries)),
        };
        Self {
            max_entries,
            seen: Mutex::new(seen),
        }
    }

    /// Short hex fingerprint of the first 100 characters of `value`.
    pub fn fingerprint(value: &str) -> String {
        let prefix: String = value.chars().take(FINGERPRINT_PREFIX_CHARS).collect();
        let digest = Sha256::digest(prefix.as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(FINGERPRINT_HEX_LEN);
        hex
    }

    pub fn fingerprint_message(message: &CanonicalMessage) -> String {
        Self::fingerprint(&message.to_value().to_string())
    }

    pub fn is_duplicate(&self, fingerprint: &str) -> bool {
        match &*self.seen.lock() {
            Seen::Window(set) => set.contains(fingerprint),
            Seen::Lru(cache) => cache.contains(fingerprint),
        }
    }

    pub fn mark_processed(&self, fingerprint: &str) {
        let mut seen = self.seen.lock();
        self.record(&mut seen, fingerprint);
    }

    /// Atomic test-and-mark. Returns `true` when `fingerprint` was already seen.
    pub fn check_and_mark(&self, fingerprint: &str) -> bool {
        let mut seen = self.seen.lock();
        let duplicate = match &mut *seen {
            Seen::Window(set) => set.contains(fingerprint),
            Seen::Lru(cache) => cache.get(fingerprint).is_some(),
        };
        if !duplicate {
            self.record(&mut seen, fingerprint);
        }
        duplicate
    }

    pub fn len(&self) -> usize {
        match &*self.seen.lock() {
            Seen::Window(set) => set.len(),
            Seen::Lru(cache) => cache.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, seen: &mut Seen, fingerprint: &str) {
        match seen {
            Seen::Window(set) => {
                if !set.contains(fingerprint) && set.len() >= self.max_entries.get() {
                    debug!(entries = set.len(), "Duplicate window full, clearing");
                    set.clear();
                }
                set.insert(fingerprint.to_string());
            }
            Seen::Lru(cache) => {
                cache.put(fingerprint.to_string(), ());
            }
        }
    }
}

impl Default for DuplicateGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DedupPolicy::ClearOnOverflow)
    }
}
