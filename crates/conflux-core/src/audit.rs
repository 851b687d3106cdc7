//! Append-only audit trail.
//!
//! Every access decision and mutation produces an [`AuditRecord`]. Callers must
//! await [`AuditLog::append`] before the triggering mutation becomes visible;
//! that ordering is the core's durability contract.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{CoreError, CoreResult},
    model::{Page, PageRequest, Principal, VersionId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Read,
    Write,
    Delete,
    Rotate,
    ReEncrypt,
    KeyRotate,
    KeyRetire,
    PolicyCreate,
    PolicyUpdate,
    PolicyDelete,
    Subscribe,
    Poll,
    Ack,
    AuditExport,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = match self {
            AuditAction::Read => "read",
            AuditAction::Write => "write",
            AuditAction::Delete => "delete",
            AuditAction::Rotate => "rotate",
            AuditAction::ReEncrypt => "re_encrypt",
            AuditAction::KeyRotate => "key_rotate",
            AuditAction::KeyRetire => "key_retire",
            AuditAction::PolicyCreate => "policy_create",
            AuditAction::PolicyUpdate => "policy_update",
            AuditAction::PolicyDelete => "policy_delete",
            AuditAction::Subscribe => "subscribe",
            AuditAction::Poll => "poll",
            AuditAction::Ack => "ack",
            AuditAction::AuditExport => "audit_export",
        };
        f.write_str(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied { reason: String },
    Failed { reason: String },
}

/// Immutable audit record. `seq` and `timestamp` are assigned on append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub principal: Principal,
    pub action: AuditAction,
    pub resource_path: String,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<VersionId>,
}

impl AuditRecord {
    pub fn new(
        principal: Principal,
        action: AuditAction,
        resource_path: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            principal,
            action,
            resource_path: resource_path.into(),
            outcome,
            version_id: None,
        }
    }

    pub fn success(principal: Principal, action: AuditAction, resource_path: impl Into<String>) -> Self {
        Self::new(principal, action, resource_path, AuditOutcome::Success)
    }

    pub fn with_version(mut self, version: VersionId) -> Self {
        self.version_id = Some(version);
        self
    }
}

/// Query filter for audit export. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub principal: Option<Principal>,
    pub resource_prefix: Option<String>,
    pub action: Option<AuditAction>,
}

impl AuditFilter {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if self.from.is_some_and(|from| record.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| record.timestamp > to) {
            return false;
        }
        if self
            .principal
            .as_ref()
            .is_some_and(|p| p != &record.principal)
        {
            return false;
        }
        if self
            .resource_prefix
            .as_deref()
            .is_some_and(|prefix| !record.resource_path.starts_with(prefix))
        {
            return false;
        }
        if self.action.is_some_and(|a| a != record.action) {
            return false;
        }
        true
    }
}

/// Append-only audit log contract.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Durably append a record; returns the assigned sequence number.
    async fn append(&self, record: AuditRecord) -> CoreResult<u64>;

    /// Records matching `filter`, ordered by timestamp, resumable via the page cursor.
    async fn query(&self, filter: &AuditFilter, page: &PageRequest) -> CoreResult<Page<AuditRecord>>;
}

/// Stamp `record` with the next sequence and a timestamp no earlier than `prev`.
/// Keeps timestamp order and append order identical.
pub fn stamp(record: &mut AuditRecord, prev: Option<&AuditRecord>) {
    let now = Utc::now();
    match prev {
        Some(prev) => {
            record.seq = prev.seq + 1;
            record.timestamp = now.max(prev.timestamp);
        }
        None => {
            record.seq = 1;
            record.timestamp = now;
        }
    }
}

/// Page through an ordered slice of records.
pub fn paginate(
    records: &[AuditRecord],
    filter: &AuditFilter,
    page: &PageRequest,
) -> CoreResult<Page<AuditRecord>> {
    let after = page.numeric_cursor()?;
    let limit = page.limit();
    let start = records.partition_point(|r| r.seq <= after);
    let mut items = Vec::with_capacity(limit.min(64));
    let mut more = false;
    for record in records[start..].iter().filter(|r| filter.matches(r)) {
        if items.len() == limit {
            more = true;
            break;
        }
        items.push(record.clone());
    }
    let next = if more {
        items.last().map(|r| r.seq.to_string())
    } else {
        None
    };
    Ok(Page { items, next })
}

/// In-memory audit log for tests and ephemeral deployments.
#[derive(Debug, Default, Clone)]
pub struct InMemoryAuditLog {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all records, for assertions.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, mut record: AuditRecord) -> CoreResult<u64> {
        let mut records = self.records.lock().map_err(|err| CoreError::Audit {
            reason: format!("lock poisoned: {err}"),
        })?;
        stamp(&mut record, records.last());
        let seq = record.seq;
        records.push(record);
        Ok(seq)
    }

    async fn query(&self, filter: &AuditFilter, page: &PageRequest) -> CoreResult<Page<AuditRecord>> {
        let records = self.records.lock().map_err(|err| CoreError::Audit {
            reason: format!("lock poisoned: {err}"),
        })?;
        paginate(&records, filter, page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Principal {
        Principal::new("alice").unwrap()
    }

    #[tokio::test]
    async fn append_assigns_increasing_sequence_and_time() {
        let log = InMemoryAuditLog::new();
        let first = log
            .append(AuditRecord::success(alice(), AuditAction::Write, "prod/a"))
            .await
            .unwrap();
        let second = log
            .append(AuditRecord::success(alice(), AuditAction::Read, "prod/a"))
            .await
            .unwrap();
        assert_eq!((first, second), (1, 2));

        let records = log.records();
        assert!(records[0].timestamp <= records[1].timestamp);
    }

    #[tokio::test]
    async fn query_pages_are_restartable() {
        let log = InMemoryAuditLog::new();
        for i in 0..5 {
            log.append(AuditRecord::success(alice(), AuditAction::Write, format!("prod/k{i}")))
                .await
                .unwrap();
        }

        let filter = AuditFilter::default();
        let first = log.query(&filter, &PageRequest::first(2)).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next.clone().expect("more pages");

        let second = log
            .query(&filter, &PageRequest::after(cursor.clone(), 2))
            .await
            .unwrap();
        assert_eq!(second.items[0].resource_path, "prod/k2");

        // Same cursor yields the same page again.
        let again = log.query(&filter, &PageRequest::after(cursor, 2)).await.unwrap();
        assert_eq!(again, second);

        let last = log
            .query(&filter, &PageRequest::after(second.next.unwrap(), 2))
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(last.next.is_none());
    }

    #[tokio::test]
    async fn filter_by_prefix_and_outcome_fields() {
        let log = InMemoryAuditLog::new();
        log.append(AuditRecord::success(alice(), AuditAction::Write, "prod/a"))
            .await
            .unwrap();
        log.append(AuditRecord::new(
            Principal::new("mallory").unwrap(),
            AuditAction::Read,
            "prod/secrets/db",
            AuditOutcome::Denied {
                reason: "no policy".into(),
            },
        ))
        .await
        .unwrap();
        log.append(AuditRecord::success(alice(), AuditAction::Write, "staging/a"))
            .await
            .unwrap();

        let filter = AuditFilter {
            resource_prefix: Some("prod/".into()),
            ..AuditFilter::default()
        };
        let page = log.query(&filter, &PageRequest::default()).await.unwrap();
        assert_eq!(page.items.len(), 2);

        let denied_only = AuditFilter {
            principal: Some(Principal::new("mallory").unwrap()),
            ..AuditFilter::default()
        };
        let page = log.query(&denied_only, &PageRequest::default()).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(matches!(page.items[0].outcome, AuditOutcome::Denied { .. }));
    }
}
