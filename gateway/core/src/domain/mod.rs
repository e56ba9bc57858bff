// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Pure types and ports shared by the gateway's adapters and use cases.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Value objects, intents and collaborator interfaces

pub mod envelope;
pub mod message;
pub mod shard;
pub mod llm;
pub mod gateway;
pub mod transport;
pub mod audit;
pub mod config;
