// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Audit Log Port
//!
//! Persistence of request audit rows belongs to an external collaborator.
//! The gateway only needs to mark a row as sent and, later, as completed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Pending,
    Sent,
    Completed,
    Failed,
}

/// Final fields written when a request finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub status: AuditStatus,
    pub duration_ms: u64,
    pub cost: f64,
    pub response_text: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit row {0} not found")]
    NotFound(i64),
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn mark_sent(&self, request_id: i64) -> Result<(), AuditError>;

    async fn mark_completed(&self, request_id: i64, record: CompletionRecord) -> Result<(), AuditError>;
}
