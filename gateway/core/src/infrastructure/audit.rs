// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

//! In-memory [`AuditLog`] for tests and single-process deployments.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::domain::audit::{AuditError, AuditLog, AuditStatus, CompletionRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct AuditRow {
    pub status: AuditStatus,
    pub completion: Option<CompletionRecord>,
}

#[derive(Default)]
pub struct InMemoryAuditLog {
    rows: RwLock<HashMap<i64, AuditRow>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending row, as the request producer would.
    pub fn register(&self, request_id: i64) {
        self.rows.write().insert(
            request_id,
            AuditRow {
                status: AuditStatus::Pending,
                completion: None,
            },
        );
    }

    pub fn get(&self, request_id: i64) -> Option<AuditRow> {
        self.rows.read().get(&request_id).cloned()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn mark_sent(&self, request_id: i64) -> Result<(), AuditError> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&request_id).ok_or(AuditError::NotFound(request_id))?;
        row.status = AuditStatus::Sent;
        Ok(())
    }

    async fn mark_completed(&self, request_id: i64, record: CompletionRecord) -> Result<(), AuditError> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&request_id).ok_or(AuditError::NotFound(request_id))?;
        row.status = record.status;
        row.completion = Some(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_row_lifecycle() {
        let log = InMemoryAuditLog::new();
        log.register(7);
        log.mark_sent(7).await.unwrap();
        assert_eq!(log.get(7).unwrap().status, AuditStatus::Sent);

        let record = CompletionRecord {
            status: AuditStatus::Completed,
            duration_ms: 12,
            cost: 0.5,
            response_text: Some("ok".into()),
            error: None,
        };
        log.mark_completed(7, record.clone()).await.unwrap();
        let row = log.get(7).unwrap();
        assert_eq!(row.status, AuditStatus::Completed);
        assert_eq!(row.completion, Some(record));
    }

    #[tokio::test]
    async fn test_unknown_row() {
        let log = InMemoryAuditLog::new();
        assert!(matches!(log.mark_sent(1).await, Err(AuditError::NotFound(1))));
    }
}
