// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Courier Gateway Core
//!
//! Turns an at-least-once publish/subscribe transport into a reliable
//! request/response channel in front of a language-model backend.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Normalization, anti-loop classification, deduplication,
//!   request/response correlation and context cache-key composition

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
