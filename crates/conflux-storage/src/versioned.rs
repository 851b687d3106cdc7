//! Append-only versioned key-value store for config values and sealed secrets.
//!
//! A put runs in three phases:
//! 1. reserve the next version id with a compare-and-increment on the key's counter;
//! 2. append the audit record and wait for it to be durable;
//! 3. under the namespace commit lock, assign the namespace revision, persist the
//!    entry history, then publish it to readers and the change feed.
//!
//! Nothing is visible before phase 3, so a reader never observes a version whose
//! audit record is missing. A reservation abandoned before its audit record is
//! durable rolls back, so version ids never skip. Phase 3 runs on its own task:
//! once audited, a version is published (or its failure audited) even when the
//! caller is cancelled.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use conflux_core::{
    audit::{AuditAction, AuditLog, AuditOutcome, AuditRecord},
    blob::BlobStore,
    feed::ChangeFeed,
    model::{
        Change, EntryKey, EntryValue, EnvelopeCiphertext, Key, KeyVersion, Namespace, Page,
        PageRequest, Principal, Revision, Version, VersionId, VersionSelector,
    },
    CoreError, CoreResult,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, instrument};

const ENTRY_PREFIX: &str = "entries/";
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Keep at most this many versions per key. `None` keeps everything.
    pub retain_versions: Option<usize>,
}

/// Latest state of a live key, as returned by [`VersionedStore::list_keys`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySummary {
    pub key: Key,
    pub latest: VersionId,
    pub secret: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EntryHistory {
    #[serde(default)]
    pruned_through: VersionId,
    versions: Vec<Version>,
}

impl EntryHistory {
    fn latest(&self) -> Option<&Version> {
        self.versions.last()
    }

    fn find(&self, id: VersionId) -> Option<&Version> {
        self.versions
            .binary_search_by_key(&id, |v| v.id)
            .ok()
            .map(|idx| &self.versions[idx])
    }

    fn prune(&mut self, retain: Option<usize>) {
        let Some(retain) = retain else { return };
        let retain = retain.max(1);
        if self.versions.len() > retain {
            let cut = self.versions.len() - retain;
            let removed: Vec<Version> = self.versions.drain(..cut).collect();
            if let Some(last) = removed.last() {
                self.pruned_through = last.id;
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    namespace: Namespace,
    key: Key,
    #[serde(flatten)]
    history: EntryHistory,
}

struct EntrySlot {
    /// Highest published version id.
    committed: AtomicU64,
    /// Highest reserved version id; equals `committed` when no put is in flight.
    reserved: AtomicU64,
    released: Notify,
    history: RwLock<EntryHistory>,
}

impl EntrySlot {
    fn new(history: EntryHistory) -> Self {
        let head = history.latest().map(|v| v.id.0).unwrap_or(history.pruned_through.0);
        Self {
            committed: AtomicU64::new(head),
            reserved: AtomicU64::new(head),
            released: Notify::new(),
            history: RwLock::new(history),
        }
    }

    fn history(&self) -> RwLockReadGuard<'_, EntryHistory> {
        match self.history.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn history_mut(&self) -> RwLockWriteGuard<'_, EntryHistory> {
        match self.history.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Exclusive right to publish one version id. Rolls back when dropped uncommitted.
struct Reservation {
    slot: Arc<EntrySlot>,
    version: VersionId,
    done: bool,
}

impl Reservation {
    async fn acquire(slot: Arc<EntrySlot>) -> Self {
        let mut backoff = INITIAL_BACKOFF;
        let waker = Arc::clone(&slot);
        loop {
            let released = waker.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let committed = slot.committed.load(Ordering::Acquire);
            if slot
                .reserved
                .compare_exchange(committed, committed + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Self {
                    slot,
                    version: VersionId(committed + 1),
                    done: false,
                };
            }
            // Contention is never surfaced; wait for a release or the backoff tick.
            let _ = tokio::time::timeout(backoff, released).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn commit(mut self) {
        self.slot.committed.store(self.version.0, Ordering::Release);
        self.done = true;
        self.slot.released.notify_waiters();
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.done {
            let committed = self.slot.committed.load(Ordering::Acquire);
            self.slot.reserved.store(committed, Ordering::Release);
            self.slot.released.notify_waiters();
        }
    }
}

/// The single mutable source of truth for entries.
pub struct VersionedStore {
    entries: RwLock<BTreeMap<EntryKey, Arc<EntrySlot>>>,
    commit_locks: RwLock<HashMap<Namespace, Arc<Mutex<()>>>>,
    feed: Arc<ChangeFeed>,
    audit: Arc<dyn AuditLog>,
    blobs: Arc<dyn BlobStore>,
    options: StoreOptions,
}

impl VersionedStore {
    /// Rebuild the store and its change feed from persisted entries.
    pub async fn load(
        blobs: Arc<dyn BlobStore>,
        audit: Arc<dyn AuditLog>,
        options: StoreOptions,
    ) -> CoreResult<Self> {
        let mut entries = BTreeMap::new();
        let mut changes: BTreeMap<Namespace, Vec<Change>> = BTreeMap::new();

        for blob_key in blobs.list(ENTRY_PREFIX).await? {
            let raw = blobs.get(&blob_key).await?;
            let stored: StoredEntry = serde_json::from_slice(&raw).map_err(|err| {
                CoreError::storage(format!("corrupt entry `{blob_key}`: {err}"))
            })?;
            let feed = changes.entry(stored.namespace.clone()).or_default();
            feed.extend(stored.history.versions.iter().map(|v| Change {
                key: stored.key.clone(),
                version_id: v.id,
                revision: v.revision,
            }));
            entries.insert(
                EntryKey::new(stored.namespace, stored.key),
                Arc::new(EntrySlot::new(stored.history)),
            );
        }

        let feed = ChangeFeed::new();
        for (namespace, mut log) in changes {
            log.sort_by_key(|c| c.revision);
            for change in log {
                feed.record(&namespace, change);
            }
        }
        info!(entries = entries.len(), "versioned store loaded");

        Ok(Self {
            entries: RwLock::new(entries),
            commit_locks: RwLock::new(HashMap::new()),
            feed: Arc::new(feed),
            audit,
            blobs,
            options,
        })
    }

    pub fn feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    /// Latest published revision of `namespace`.
    pub fn head(&self, namespace: &Namespace) -> Revision {
        self.feed.head(namespace)
    }

    /// Commit a new version of `entry`. Returns its version id.
    #[instrument(skip_all, fields(entry = %entry, principal = %principal))]
    pub async fn put(
        &self,
        entry: &EntryKey,
        value: EntryValue,
        principal: &Principal,
        description: Option<String>,
    ) -> CoreResult<VersionId> {
        if value.is_tombstone() {
            return Err(CoreError::invalid("use delete to tombstone an entry"));
        }
        self.commit(entry, value, principal, description, AuditAction::Write, None)
            .await
    }

    /// Like [`put`](Self::put), but only when `expected` is still the latest version.
    /// Fails with `Conflict` otherwise; the losing attempt leaves no trace in the
    /// version sequence.
    #[instrument(skip_all, fields(entry = %entry, principal = %principal, expected = %expected))]
    pub async fn put_if_latest(
        &self,
        entry: &EntryKey,
        expected: VersionId,
        value: EntryValue,
        principal: &Principal,
        description: Option<String>,
    ) -> CoreResult<VersionId> {
        if value.is_tombstone() {
            return Err(CoreError::invalid("use delete to tombstone an entry"));
        }
        self.commit(
            entry,
            value,
            principal,
            description,
            AuditAction::Write,
            Some(expected),
        )
        .await
    }

    /// Replace the value of an existing secret with a new sealed value.
    ///
    /// Audited as a rotation rather than a write. Fails with `Conflict` when another
    /// writer moved the key on between the check and the commit.
    #[instrument(skip_all, fields(entry = %entry, principal = %principal))]
    pub async fn rotate(
        &self,
        entry: &EntryKey,
        value: EntryValue,
        principal: &Principal,
        description: Option<String>,
    ) -> CoreResult<VersionId> {
        let current = self.get(entry, VersionSelector::Latest)?;
        if !current.value.is_secret() || !value.is_secret() {
            return Err(CoreError::invalid(format!(
                "{entry} is not a secret; only secrets can be rotated"
            )));
        }
        self.commit(
            entry,
            value,
            principal,
            description,
            AuditAction::Rotate,
            Some(current.id),
        )
        .await
    }

    /// Commit a tombstone. The key reads as missing; its history stays addressable.
    #[instrument(skip_all, fields(entry = %entry, principal = %principal))]
    pub async fn delete(&self, entry: &EntryKey, principal: &Principal) -> CoreResult<VersionId> {
        self.get(entry, VersionSelector::Latest)?;
        self.commit(
            entry,
            EntryValue::Tombstone,
            principal,
            None,
            AuditAction::Delete,
            None,
        )
        .await
    }

    async fn commit(
        &self,
        entry: &EntryKey,
        value: EntryValue,
        principal: &Principal,
        description: Option<String>,
        action: AuditAction,
        expected: Option<VersionId>,
    ) -> CoreResult<VersionId> {
        let reservation = Reservation::acquire(self.slot(entry)).await;
        let version_id = reservation.version;
        if let Some(expected) = expected.filter(|e| e.next() != version_id) {
            return Err(CoreError::Conflict {
                namespace: entry.namespace.to_string(),
                key: entry.key.to_string(),
                expected,
                found: VersionId(version_id.0 - 1),
            });
        }
        let resource = entry.resource_path();

        // Durable audit before anything becomes visible.
        self.audit
            .append(
                AuditRecord::success(principal.clone(), action, resource)
                    .with_version(version_id),
            )
            .await?;

        // The audit log now names this version. Publish it even if the caller
        // stops waiting, so the id is never handed out twice.
        let publication = Publication {
            entry: entry.clone(),
            reservation,
            value,
            principal: principal.clone(),
            description,
            action,
            lock: self.commit_lock(&entry.namespace),
            feed: Arc::clone(&self.feed),
            audit: Arc::clone(&self.audit),
            blobs: Arc::clone(&self.blobs),
            retain: self.options.retain_versions,
        };
        tokio::spawn(publication.run())
            .await
            .map_err(|err| CoreError::storage(format!("commit task failed: {err}")))?
    }

    /// Resolve a version. `Latest` on a tombstoned key is `NotFound`.
    pub fn get(&self, entry: &EntryKey, selector: VersionSelector) -> CoreResult<Version> {
        let not_found = || CoreError::NotFound {
            namespace: entry.namespace.to_string(),
            key: entry.key.to_string(),
        };
        let slot = self.existing_slot(entry).ok_or_else(not_found)?;
        let history = slot.history();
        match selector {
            VersionSelector::Latest => match history.latest() {
                Some(version) if !version.value.is_tombstone() => Ok(version.clone()),
                _ => Err(not_found()),
            },
            VersionSelector::At(id) => {
                history
                    .find(id)
                    .cloned()
                    .ok_or_else(|| CoreError::VersionNotFound {
                        namespace: entry.namespace.to_string(),
                        key: entry.key.to_string(),
                        version: id,
                    })
            }
        }
    }

    /// Retained versions of `entry`, oldest first. The cursor is the last version id seen.
    pub fn list_versions(&self, entry: &EntryKey, page: &PageRequest) -> CoreResult<Page<Version>> {
        let after = VersionId(page.numeric_cursor()?);
        let limit = page.limit();
        let slot = self
            .existing_slot(entry)
            .filter(|slot| !slot.history().versions.is_empty())
            .ok_or_else(|| CoreError::NotFound {
                namespace: entry.namespace.to_string(),
                key: entry.key.to_string(),
            })?;
        let history = slot.history();
        let start = history.versions.partition_point(|v| v.id <= after);
        let rest = &history.versions[start..];
        let items: Vec<Version> = rest.iter().take(limit).cloned().collect();
        let next = if rest.len() > limit {
            items.last().map(|v| v.id.to_string())
        } else {
            None
        };
        Ok(Page { items, next })
    }

    /// Live keys of `namespace` in key order. The cursor is the last key seen.
    pub fn list_keys(&self, namespace: &Namespace, page: &PageRequest) -> CoreResult<Page<KeySummary>> {
        let limit = page.limit();
        let lower = match &page.cursor {
            Some(raw) => Bound::Excluded(EntryKey::new(namespace.clone(), Key::new(raw.as_str())?)),
            None => Bound::Unbounded,
        };
        let entries = self.entries_read();
        let mut items = Vec::new();
        let mut more = false;
        for (entry, slot) in entries.range((lower, Bound::Unbounded)) {
            if entry.namespace < *namespace {
                continue;
            }
            if entry.namespace != *namespace {
                break;
            }
            let history = slot.history();
            let Some(latest) = history.latest().filter(|v| !v.value.is_tombstone()) else {
                continue;
            };
            if items.len() == limit {
                more = true;
                break;
            }
            items.push(KeySummary {
                key: entry.key.clone(),
                latest: latest.id,
                secret: latest.value.is_secret(),
                updated_at: latest.created_at,
            });
        }
        let next = if more {
            items.last().map(|s: &KeySummary| s.key.to_string())
        } else {
            None
        };
        Ok(Page { items, next })
    }

    /// Entries whose latest value is a sealed secret.
    pub fn secret_entries(&self) -> Vec<EntryKey> {
        self.entries_read()
            .iter()
            .filter(|(_, slot)| slot.history().latest().is_some_and(|v| v.value.is_secret()))
            .map(|(entry, _)| entry.clone())
            .collect()
    }

    /// Every retained version still sealed under `key_version`.
    pub fn versions_referencing(&self, key_version: KeyVersion) -> Vec<(EntryKey, VersionId)> {
        let entries = self.entries_read();
        let mut out = Vec::new();
        for (entry, slot) in entries.iter() {
            for version in slot.history().versions.iter() {
                if version.value.key_version() == Some(key_version) {
                    out.push((entry.clone(), version.id));
                }
            }
        }
        out
    }

    /// Swap the envelope of an existing version for a re-wrapped one.
    ///
    /// Only the wrapped data key may differ: the payload nonce and ciphertext must
    /// match, so the version's plaintext is unchanged. No new version or revision is
    /// produced.
    #[instrument(skip_all, fields(entry = %entry, version = %version_id, to = %envelope.key_version))]
    pub async fn replace_envelope(
        &self,
        entry: &EntryKey,
        version_id: VersionId,
        envelope: EnvelopeCiphertext,
        principal: &Principal,
    ) -> CoreResult<()> {
        let slot = self.existing_slot(entry).ok_or_else(|| CoreError::NotFound {
            namespace: entry.namespace.to_string(),
            key: entry.key.to_string(),
        })?;
        check_rewrap(&slot.history(), entry, version_id, &envelope)?;

        self.audit
            .append(
                AuditRecord::success(principal.clone(), AuditAction::ReEncrypt, entry.resource_path())
                    .with_version(version_id),
            )
            .await?;

        let lock = self.commit_lock(&entry.namespace);
        let blobs = Arc::clone(&self.blobs);
        let entry = entry.clone();
        let swap = async move {
            let _guard = lock.lock().await;
            let mut history = slot.history().clone();
            // Re-check under the lock: the version may have been pruned meanwhile.
            check_rewrap(&history, &entry, version_id, &envelope)?;
            if let Some(version) = history.versions.iter_mut().find(|v| v.id == version_id) {
                version.value = EntryValue::Sealed { envelope };
            }
            persist(blobs.as_ref(), &entry, &history).await?;
            *slot.history_mut() = history;
            Ok::<(), CoreError>(())
        };
        tokio::spawn(swap)
            .await
            .map_err(|err| CoreError::storage(format!("re-wrap task failed: {err}")))?
    }

    fn entries_read(&self) -> RwLockReadGuard<'_, BTreeMap<EntryKey, Arc<EntrySlot>>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn existing_slot(&self, entry: &EntryKey) -> Option<Arc<EntrySlot>> {
        self.entries_read().get(entry).cloned()
    }

    fn slot(&self, entry: &EntryKey) -> Arc<EntrySlot> {
        if let Some(slot) = self.existing_slot(entry) {
            return slot;
        }
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            entries
                .entry(entry.clone())
                .or_insert_with(|| Arc::new(EntrySlot::new(EntryHistory::default()))),
        )
    }

    fn commit_lock(&self, namespace: &Namespace) -> Arc<Mutex<()>> {
        if let Ok(locks) = self.commit_locks.read() {
            if let Some(lock) = locks.get(namespace) {
                return Arc::clone(lock);
            }
        }
        let mut locks = match self.commit_locks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(namespace.clone()).or_default())
    }
}

/// An audited version waiting for the commit lock. Owns everything it touches so
/// it can finish on its own task.
struct Publication {
    entry: EntryKey,
    reservation: Reservation,
    value: EntryValue,
    principal: Principal,
    description: Option<String>,
    action: AuditAction,
    lock: Arc<Mutex<()>>,
    feed: Arc<ChangeFeed>,
    audit: Arc<dyn AuditLog>,
    blobs: Arc<dyn BlobStore>,
    retain: Option<usize>,
}

impl Publication {
    async fn run(self) -> CoreResult<VersionId> {
        let Self {
            entry,
            reservation,
            value,
            principal,
            description,
            action,
            lock,
            feed,
            audit,
            blobs,
            retain,
        } = self;
        let version_id = reservation.version;
        let _guard = lock.lock().await;

        let revision = feed.head(&entry.namespace).next();
        let version = Version {
            id: version_id,
            revision,
            value,
            created_at: Utc::now(),
            principal: principal.clone(),
            description,
        };

        let mut history = reservation.slot.history().clone();
        history.versions.push(version);
        history.prune(retain);

        if let Err(err) = persist(blobs.as_ref(), &entry, &history).await {
            let failed = AuditRecord::new(
                principal,
                action,
                entry.resource_path(),
                AuditOutcome::Failed {
                    reason: err.to_string(),
                },
            )
            .with_version(version_id);
            if let Err(audit_err) = audit.append(failed).await {
                error!(error = %audit_err, "failed to record aborted commit");
            }
            return Err(err);
        }

        *reservation.slot.history_mut() = history;
        reservation.commit();
        feed.record(
            &entry.namespace,
            Change {
                key: entry.key.clone(),
                version_id,
                revision,
            },
        );
        debug!(entry = %entry, version = %version_id, revision = %revision, "version committed");
        Ok(version_id)
    }
}

async fn persist(blobs: &dyn BlobStore, entry: &EntryKey, history: &EntryHistory) -> CoreResult<()> {
    let stored = StoredEntry {
        namespace: entry.namespace.clone(),
        key: entry.key.clone(),
        history: history.clone(),
    };
    let bytes = serde_json::to_vec(&stored).map_err(CoreError::storage)?;
    blobs.put(&entry_blob_key(entry), &bytes).await?;
    Ok(())
}

fn entry_blob_key(entry: &EntryKey) -> String {
    format!("{ENTRY_PREFIX}{}/{}", entry.namespace, entry.key)
}

fn check_rewrap(
    history: &EntryHistory,
    entry: &EntryKey,
    version_id: VersionId,
    envelope: &EnvelopeCiphertext,
) -> CoreResult<()> {
    let version = history
        .find(version_id)
        .ok_or_else(|| CoreError::VersionNotFound {
            namespace: entry.namespace.to_string(),
            key: entry.key.to_string(),
            version: version_id,
        })?;
    match &version.value {
        EntryValue::Sealed { envelope: current }
            if current.nonce == envelope.nonce && current.ciphertext == envelope.ciphertext =>
        {
            Ok(())
        }
        EntryValue::Sealed { .. } => Err(CoreError::invalid(format!(
            "re-wrap of {entry} v{version_id} changes the payload"
        ))),
        _ => Err(CoreError::invalid(format!(
            "{entry} v{version_id} is not a sealed secret"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use conflux_core::{
        audit::{AuditFilter, InMemoryAuditLog},
        blob::{BlobError, InMemoryBlobStore},
    };
    use tokio::sync::Semaphore;

    use super::*;
    use crate::file_store::FileBlobStore;

    fn alice() -> Principal {
        Principal::new("alice").unwrap()
    }

    fn entry(key: &str) -> EntryKey {
        EntryKey::parse("prod", key).unwrap()
    }

    fn plain(data: &str) -> EntryValue {
        EntryValue::Plain {
            data: data.as_bytes().to_vec(),
        }
    }

    fn sealed(nonce: u8, key_version: u32) -> EntryValue {
        EntryValue::Sealed {
            envelope: EnvelopeCiphertext {
                data_key_ciphertext: vec![key_version as u8; 60],
                nonce: vec![nonce; 12],
                ciphertext: vec![7; 16],
                key_version: KeyVersion(key_version),
            },
        }
    }

    async fn store_with(audit: Arc<dyn AuditLog>, options: StoreOptions) -> VersionedStore {
        VersionedStore::load(Arc::new(InMemoryBlobStore::default()), audit, options)
            .await
            .expect("store")
    }

    async fn store() -> (VersionedStore, InMemoryAuditLog) {
        let audit = InMemoryAuditLog::new();
        let store = store_with(Arc::new(audit.clone()), StoreOptions::default()).await;
        (store, audit)
    }

    /// Audit log whose appends wait for a permit.
    struct GatedAudit {
        inner: InMemoryAuditLog,
        gate: Semaphore,
    }

    #[async_trait]
    impl AuditLog for GatedAudit {
        async fn append(&self, record: AuditRecord) -> CoreResult<u64> {
            let permit = self.gate.acquire().await.map_err(|e| CoreError::Audit {
                reason: e.to_string(),
            })?;
            permit.forget();
            self.inner.append(record).await
        }

        async fn query(&self, filter: &AuditFilter, page: &PageRequest) -> CoreResult<Page<AuditRecord>> {
            self.inner.query(filter, page).await
        }
    }

    /// Audit log that fails its first append.
    #[derive(Default)]
    struct FlakyAudit {
        inner: InMemoryAuditLog,
        failed: AtomicBool,
    }

    #[async_trait]
    impl AuditLog for FlakyAudit {
        async fn append(&self, record: AuditRecord) -> CoreResult<u64> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(CoreError::Audit {
                    reason: "disk full".into(),
                });
            }
            self.inner.append(record).await
        }

        async fn query(&self, filter: &AuditFilter, page: &PageRequest) -> CoreResult<Page<AuditRecord>> {
            self.inner.query(filter, page).await
        }
    }

    /// Blob store whose writes wait for a permit.
    struct GatedBlobs {
        inner: InMemoryBlobStore,
        gate: Semaphore,
    }

    #[async_trait]
    impl BlobStore for GatedBlobs {
        async fn put(&self, key: &str, value: &[u8]) -> Result<(), BlobError> {
            let permit = self.gate.acquire().await.map_err(|e| BlobError::Storage {
                reason: e.to_string(),
            })?;
            permit.forget();
            self.inner.put(key, value).await
        }
        async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> Result<(), BlobError> {
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
            self.inner.list(prefix).await
        }
    }

    /// Blob store that rejects writes.
    struct ReadOnlyBlobs;

    #[async_trait]
    impl BlobStore for ReadOnlyBlobs {
        async fn put(&self, _key: &str, _value: &[u8]) -> Result<(), BlobError> {
            Err(BlobError::Storage {
                reason: "read-only".into(),
            })
        }
        async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
            Err(BlobError::NotFound { key: key.into() })
        }
        async fn delete(&self, _key: &str) -> Result<(), BlobError> {
            Ok(())
        }
        async fn list(&self, _prefix: &str) -> Result<Vec<String>, BlobError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn puts_produce_consecutive_versions_and_revisions() {
        let (store, audit) = store().await;
        let a = entry("app-name");
        let b = entry("db/password");

        assert_eq!(store.put(&a, plain("one"), &alice(), None).await.unwrap(), VersionId(1));
        assert_eq!(store.put(&b, plain("x"), &alice(), None).await.unwrap(), VersionId(1));
        assert_eq!(
            store
                .put(&a, plain("two"), &alice(), Some("bump".into()))
                .await
                .unwrap(),
            VersionId(2)
        );

        let latest = store.get(&a, VersionSelector::Latest).unwrap();
        assert_eq!(latest.id, VersionId(2));
        assert_eq!(latest.revision, Revision(3));
        assert_eq!(latest.description.as_deref(), Some("bump"));
        assert_eq!(
            store.get(&a, VersionSelector::At(VersionId(1))).unwrap().value,
            plain("one")
        );
        assert_eq!(store.head(&a.namespace), Revision(3));
        assert_eq!(audit.len(), 3);
    }

    #[tokio::test]
    async fn missing_keys_and_versions_are_distinguished() {
        let (store, _) = store().await;
        let a = entry("app-name");
        assert!(matches!(
            store.get(&a, VersionSelector::Latest),
            Err(CoreError::NotFound { .. })
        ));
        store.put(&a, plain("one"), &alice(), None).await.unwrap();
        assert!(matches!(
            store.get(&a, VersionSelector::At(VersionId(9))),
            Err(CoreError::VersionNotFound { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_never_collide_or_skip() {
        let (store, _) = store().await;
        let store = Arc::new(store);
        let key = entry("hot");

        let mut tasks = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .put(&key, plain(&i.to_string()), &alice(), None)
                    .await
                    .unwrap()
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().0);
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=32).collect::<Vec<_>>());

        let page = store.list_versions(&key, &PageRequest::first(100)).unwrap();
        let revisions: Vec<u64> = page.items.iter().map(|v| v.revision.0).collect();
        assert!(revisions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn version_is_invisible_until_its_audit_append_completes() {
        let gated = Arc::new(GatedAudit {
            inner: InMemoryAuditLog::new(),
            gate: Semaphore::new(0),
        });
        let store = Arc::new(store_with(gated.clone(), StoreOptions::default()).await);
        let key = entry("db/password");

        let writer = {
            let store = Arc::clone(&store);
            let key = key.clone();
            tokio::spawn(async move { store.put(&key, plain("s3cr3t"), &alice(), None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            store.get(&key, VersionSelector::Latest),
            Err(CoreError::NotFound { .. })
        ));
        assert_eq!(store.head(&key.namespace), Revision(0));

        gated.gate.add_permits(1);
        assert_eq!(writer.await.unwrap().unwrap(), VersionId(1));
        assert_eq!(store.get(&key, VersionSelector::Latest).unwrap().id, VersionId(1));
        assert_eq!(gated.inner.records()[0].version_id, Some(VersionId(1)));
    }

    #[tokio::test]
    async fn aborted_put_rolls_back_its_reservation() {
        let gated = Arc::new(GatedAudit {
            inner: InMemoryAuditLog::new(),
            gate: Semaphore::new(0),
        });
        let store = Arc::new(store_with(gated.clone(), StoreOptions::default()).await);
        let key = entry("db/password");

        let writer = {
            let store = Arc::clone(&store);
            let key = key.clone();
            tokio::spawn(async move { store.put(&key, plain("lost"), &alice(), None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.abort();
        assert!(writer.await.unwrap_err().is_cancelled());

        gated.gate.add_permits(1);
        assert_eq!(
            store.put(&key, plain("kept"), &alice(), None).await.unwrap(),
            VersionId(1)
        );
    }

    #[tokio::test]
    async fn put_dropped_after_its_audit_record_still_publishes() {
        let audit = InMemoryAuditLog::new();
        let blobs = Arc::new(GatedBlobs {
            inner: InMemoryBlobStore::default(),
            gate: Semaphore::new(0),
        });
        let store = VersionedStore::load(blobs.clone(), Arc::new(audit.clone()), StoreOptions::default())
            .await
            .unwrap();
        let key = entry("app-name");

        // Audited, then stuck on persistence when the caller gives up.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            store.put(&key, plain("first"), &alice(), None),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(audit.len(), 1);

        blobs.gate.add_permits(2);
        assert_eq!(
            store.put(&key, plain("second"), &alice(), None).await.unwrap(),
            VersionId(2)
        );
        assert_eq!(
            store.get(&key, VersionSelector::At(VersionId(1))).unwrap().value,
            plain("first")
        );
        let audited: Vec<_> = audit
            .records()
            .into_iter()
            .map(|r| (r.outcome, r.version_id))
            .collect();
        assert_eq!(
            audited,
            vec![
                (AuditOutcome::Success, Some(VersionId(1))),
                (AuditOutcome::Success, Some(VersionId(2))),
            ]
        );
    }

    #[tokio::test]
    async fn failed_audit_append_leaves_no_gap() {
        let store = store_with(Arc::new(FlakyAudit::default()), StoreOptions::default()).await;
        let key = entry("app-name");
        assert!(matches!(
            store.put(&key, plain("a"), &alice(), None).await,
            Err(CoreError::Audit { .. })
        ));
        assert_eq!(store.put(&key, plain("b"), &alice(), None).await.unwrap(), VersionId(1));
    }

    #[tokio::test]
    async fn failed_persistence_is_compensated_in_the_audit_log() {
        let audit = InMemoryAuditLog::new();
        let store = VersionedStore::load(
            Arc::new(ReadOnlyBlobs),
            Arc::new(audit.clone()),
            StoreOptions::default(),
        )
        .await
        .unwrap();
        let key = entry("app-name");

        assert!(matches!(
            store.put(&key, plain("a"), &alice(), None).await,
            Err(CoreError::Storage { .. })
        ));
        assert!(store.get(&key, VersionSelector::Latest).is_err());
        let records = audit.records();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[1].outcome, AuditOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn conditional_put_detects_lost_races() {
        let (store, audit) = store().await;
        let key = entry("db/password");
        store.put(&key, plain("a"), &alice(), None).await.unwrap();
        store.put(&key, plain("b"), &alice(), None).await.unwrap();

        let err = store
            .put_if_latest(&key, VersionId(1), plain("stale"), &alice(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict {
                found: VersionId(2),
                ..
            }
        ));
        assert_eq!(audit.len(), 2);
        assert_eq!(
            store
                .put_if_latest(&key, VersionId(2), plain("c"), &alice(), None)
                .await
                .unwrap(),
            VersionId(3)
        );
    }

    #[tokio::test]
    async fn rotate_only_applies_to_secrets() {
        let (store, audit) = store().await;
        let secret = entry("db/password");
        let config = entry("app-name");
        store.put(&secret, sealed(1, 1), &alice(), None).await.unwrap();
        store.put(&config, plain("a"), &alice(), None).await.unwrap();

        assert_eq!(
            store.rotate(&secret, sealed(2, 1), &alice(), None).await.unwrap(),
            VersionId(2)
        );
        assert_eq!(audit.records().last().unwrap().action, AuditAction::Rotate);
        assert!(matches!(
            store.rotate(&config, sealed(3, 1), &alice(), None).await,
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            store.rotate(&secret, plain("oops"), &alice(), None).await,
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn delete_tombstones_but_keeps_history() {
        let (store, _) = store().await;
        let key = entry("app-name");
        store.put(&key, plain("a"), &alice(), None).await.unwrap();
        assert_eq!(store.delete(&key, &alice()).await.unwrap(), VersionId(2));

        assert!(matches!(
            store.get(&key, VersionSelector::Latest),
            Err(CoreError::NotFound { .. })
        ));
        assert_eq!(
            store.get(&key, VersionSelector::At(VersionId(1))).unwrap().value,
            plain("a")
        );
        assert!(store
            .list_keys(&key.namespace, &PageRequest::default())
            .unwrap()
            .items
            .is_empty());
        assert!(matches!(
            store.delete(&key, &alice()).await,
            Err(CoreError::NotFound { .. })
        ));

        // Writing again resurrects the key with the next version.
        assert_eq!(store.put(&key, plain("b"), &alice(), None).await.unwrap(), VersionId(3));
    }

    #[tokio::test]
    async fn retention_prunes_old_versions() {
        let store = store_with(
            Arc::new(InMemoryAuditLog::new()),
            StoreOptions {
                retain_versions: Some(2),
            },
        )
        .await;
        let key = entry("app-name");
        for v in ["a", "b", "c"] {
            store.put(&key, plain(v), &alice(), None).await.unwrap();
        }
        assert!(matches!(
            store.get(&key, VersionSelector::At(VersionId(1))),
            Err(CoreError::VersionNotFound { .. })
        ));
        assert_eq!(store.get(&key, VersionSelector::At(VersionId(2))).unwrap().value, plain("b"));
        assert_eq!(store.put(&key, plain("d"), &alice(), None).await.unwrap(), VersionId(4));
    }

    #[tokio::test]
    async fn listings_page_with_restartable_cursors() {
        let (store, _) = store().await;
        for key in ["a", "b", "c"] {
            store.put(&entry(key), plain(key), &alice(), None).await.unwrap();
        }
        store
            .put(&EntryKey::parse("staging", "a").unwrap(), plain("s"), &alice(), None)
            .await
            .unwrap();

        let ns = Namespace::new("prod").unwrap();
        let first = store.list_keys(&ns, &PageRequest::first(2)).unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next.clone().expect("more keys");
        let rest = store.list_keys(&ns, &PageRequest::after(cursor, 2)).unwrap();
        assert_eq!(rest.items.len(), 1);
        assert_eq!(rest.items[0].key.as_str(), "c");
        assert!(rest.next.is_none());

        let key = entry("a");
        store.put(&key, plain("a2"), &alice(), None).await.unwrap();
        let versions = store.list_versions(&key, &PageRequest::first(1)).unwrap();
        assert_eq!(versions.items[0].id, VersionId(1));
        let tail = store
            .list_versions(&key, &PageRequest::after(versions.next.unwrap(), 1))
            .unwrap();
        assert_eq!(tail.items[0].id, VersionId(2));
        assert!(tail.next.is_none());
    }

    #[tokio::test]
    async fn replace_envelope_only_accepts_rewraps() {
        let (store, audit) = store().await;
        let key = entry("db/password");
        store.put(&key, sealed(1, 1), &alice(), None).await.unwrap();
        assert_eq!(store.versions_referencing(KeyVersion(1)).len(), 1);
        assert_eq!(store.secret_entries(), vec![key.clone()]);

        let EntryValue::Sealed { envelope } = sealed(1, 2) else {
            unreachable!()
        };
        store
            .replace_envelope(&key, VersionId(1), envelope, &Principal::system("rotation"))
            .await
            .unwrap();
        assert!(store.versions_referencing(KeyVersion(1)).is_empty());
        assert_eq!(
            store.get(&key, VersionSelector::Latest).unwrap().value.key_version(),
            Some(KeyVersion(2))
        );
        // No new version, no new revision.
        assert_eq!(store.head(&key.namespace), Revision(1));
        assert_eq!(audit.records().last().unwrap().action, AuditAction::ReEncrypt);

        let EntryValue::Sealed { envelope: changed } = sealed(9, 2) else {
            unreachable!()
        };
        assert!(matches!(
            store
                .replace_envelope(&key, VersionId(1), changed, &alice())
                .await,
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn reload_restores_entries_and_feed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blobs: Arc<dyn BlobStore> = Arc::new(FileBlobStore::new(dir.path()));
        let audit: Arc<dyn AuditLog> = Arc::new(InMemoryAuditLog::new());

        {
            let store = VersionedStore::load(Arc::clone(&blobs), Arc::clone(&audit), StoreOptions::default())
                .await
                .unwrap();
            store.put(&entry("a"), plain("1"), &alice(), None).await.unwrap();
            store.put(&entry("b"), plain("2"), &alice(), None).await.unwrap();
            store.put(&entry("a"), plain("3"), &alice(), None).await.unwrap();
        }

        let store = VersionedStore::load(blobs, audit, StoreOptions::default())
            .await
            .unwrap();
        let ns = Namespace::new("prod").unwrap();
        assert_eq!(store.head(&ns), Revision(3));
        assert_eq!(store.feed().since(&ns, Revision(1), 10).len(), 2);
        assert_eq!(store.get(&entry("a"), VersionSelector::Latest).unwrap().value, plain("3"));
        assert_eq!(store.put(&entry("a"), plain("4"), &alice(), None).await.unwrap(), VersionId(3));
        assert_eq!(store.head(&ns), Revision(4));
    }
}
