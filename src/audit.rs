// src/audit.rs
//
// Best-effort security audit log.
//
// Authentication-relevant events on the upgrade path are recorded here. The
// backing store is an external collaborator injected at construction; a
// failed write must never affect the caller, so the only public entry point
// swallows errors after logging them.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RepositoryError;

/// One row in the `security_audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub event: &'static str,
    pub user_id: Option<i64>,
    pub organization_id: Option<i64>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(event: &'static str) -> Self {
        Self {
            event,
            user_id: None,
            organization_id: None,
            detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn organization(mut self, organization_id: i64) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Write interface to the audit table. Implemented by the storage layer.
#[async_trait]
pub trait SecurityAuditLog: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), RepositoryError>;
}

/// Record an entry, swallowing any storage failure.
pub async fn record_best_effort(log: &dyn SecurityAuditLog, entry: AuditEntry) {
    let event = entry.event;
    if let Err(e) = log.record(entry).await {
        tracing::debug!(event, error = %e, "audit log write failed (ignored)");
    }
}

// ─── In-memory implementation ───────────────────────────────────────────────

/// Keeps entries in a `Vec`; used by tests and local runs.
#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecurityAuditLog for InMemoryAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<(), RepositoryError> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}
