// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Context Shard Cache-Key Composer
//!
//! Turns the shards supplied with a request into two deterministic
//! artifacts: a flat prompt-cache key and an ordered sequence of rendered
//! context blocks. Both use the same ordering (stable before volatile, then
//! type, then version), so calls that share stable shards share a prompt
//! prefix no matter what order the caller listed them in.
//!
//! Key layout:
//!
//! ```text
//! scope:<session>|mod:<module>|rules:<n>|schema:<n>[|x:<facet>][|sh:<type>-v<version>]*
//! ```

use serde_json::{Map, Value};
use tracing::warn;

use crate::domain::gateway::GENERIC_MODULE;
use crate::domain::shard::{CacheKey, ContextBlock, ContextShard};

const DEFAULT_VERSION: u32 = 1;
const MAX_FACET_CHARS: usize = 64;

/// Everything except the shards that identifies a cache scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheScope<'a> {
    pub session_id: &'a str,
    pub module_key: Option<&'a str>,
    pub rules_version: Option<u32>,
    pub schema_version: Option<u32>,
    pub facet: Option<&'a str>,
}

impl<'a> CacheScope<'a> {
    pub fn new(session_id: &'a str) -> Self {
        Self {
            session_id,
            ..Default::default()
        }
    }

    pub fn module(mut self, module_key: &'a str) -> Self {
        self.module_key = Some(module_key);
        self
    }

    pub fn versions(mut self, rules: Option<u32>, schema: Option<u32>) -> Self {
        self.rules_version = rules;
        self.schema_version = schema;
        self
    }

    pub fn facet(mut self, facet: Option<&'a str>) -> Self {
        self.facet = facet;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CacheKeyComposer {
    max_block_bytes: usize,
}

impl Default for CacheKeyComposer {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl CacheKeyComposer {
    /// `max_block_bytes` bounds one rendered shard payload; larger shards
    /// are replaced by a placeholder.
    pub fn new(max_block_bytes: usize) -> Self {
        Self { max_block_bytes }
    }

    pub fn compose(&self, scope: &CacheScope<'_>, shards: &[ContextShard]) -> CacheKey {
        let module = scope
            .module_key
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(GENERIC_MODULE);

        let mut key = format!(
            "scope:{}|mod:{}|rules:{}|schema:{}",
            scope.session_id,
            module,
            scope.rules_version.unwrap_or(DEFAULT_VERSION),
            scope.schema_version.unwrap_or(DEFAULT_VERSION),
        );

        if let Some(facet) = scope.facet.map(sanitize_facet).filter(|f| !f.is_empty()) {
            key.push_str("|x:");
            key.push_str(&facet);
        }

        for shard in sorted(shards) {
            key.push_str(&format!("|sh:{}-v{}", shard.shard_type(), shard.version()));
        }

        CacheKey::new(key)
    }

    /// Render shards as labeled text blocks in prefix-cache order.
    pub fn to_ordered_blocks(&self, shards: &[ContextShard]) -> Vec<ContextBlock> {
        let mut blocks: Vec<(&ContextShard, ContextBlock)> = shards
            .iter()
            .map(|shard| (shard, self.render(shard)))
            .collect();
        // text breaks ties between shards sharing (stable, type, version)
        blocks.sort_by(|(a, ab), (b, bb)| a.prefix_order(b).then_with(|| ab.text.cmp(&bb.text)));
        blocks.into_iter().map(|(_, block)| block).collect()
    }

    fn render(&self, shard: &ContextShard) -> ContextBlock {
        let header = format!(
            "[shard:{} v{} {}]",
            shard.shard_type(),
            shard.version(),
            if shard.is_stable() { "stable" } else { "volatile" }
        );

        let body = match serde_json::to_string(&canonical_object(shard.payload())) {
            Ok(json) if json.len() <= self.max_block_bytes => json,
            Ok(json) => {
                warn!(
                    shard_type = shard.shard_type(),
                    bytes = json.len(),
                    limit = self.max_block_bytes,
                    "Shard payload too large, substituting placeholder"
                );
                format!("{{\"error\":\"shard payload exceeds {} bytes\"}}", self.max_block_bytes)
            }
            Err(e) => {
                warn!(shard_type = shard.shard_type(), error = %e, "Failed to render shard");
                "{\"error\":\"shard payload could not be serialized\"}".to_string()
            }
        };

        ContextBlock {
            shard_type: shard.shard_type().to_string(),
            version: shard.version(),
            stable: shard.is_stable(),
            text: format!("{header}\n{body}"),
        }
    }
}

fn sorted(shards: &[ContextShard]) -> Vec<&ContextShard> {
    let mut ordered: Vec<&ContextShard> = shards.iter().collect();
    ordered.sort_by(|a, b| a.prefix_order(b));
    ordered
}

/// Restrict a facet to `[A-Za-z0-9._-]`, bounded in length.
pub fn sanitize_facet(facet: &str) -> String {
    facet
        .trim()
        .chars()
        .take(MAX_FACET_CHARS)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn canonical_object(map: &Map<String, Value>) -> Value {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let mut sorted = Map::with_capacity(map.len());
    for key in keys {
        sorted.insert(key.clone(), canonical(&map[key.as_str()]));
    }
    Value::Object(sorted)
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => canonical_object(map),
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
