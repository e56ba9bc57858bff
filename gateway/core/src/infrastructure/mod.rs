// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

// Infrastructure Layer
//
// Concrete codecs, stores and adapters behind the domain ports.

pub mod audit;
pub mod classifier;
pub mod codec;
pub mod dedup;
pub mod llm;
pub mod normalizer;
pub mod pending;
pub mod shard_key;
pub mod telemetry;
pub mod transport;
