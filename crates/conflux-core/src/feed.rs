use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockWriteGuard},
};

use tokio::sync::watch;

use crate::model::{Change, Key, Namespace, Revision};

/// Compaction is re-attempted once the log doubles past its last compacted size.
const MIN_COMPACTION_LEN: usize = 64;

struct NamespaceLog {
    changes: Vec<Change>,
    /// Changes at or below this revision may be collapsed. Starts at 0 (keep
    /// everything) until a reader position is known.
    floor: Revision,
    compact_at: usize,
}

impl NamespaceLog {
    /// Drop every change at or below the floor that a later change of the same key
    /// (also at or below the floor) supersedes. The latest change per key always
    /// survives, so a reader starting below the floor still converges.
    fn compact(&mut self, head: Revision) {
        let floor = self.floor.min(head);
        let mut newest: HashMap<Key, Revision> = HashMap::new();
        for change in self.changes.iter().take_while(|c| c.revision <= floor) {
            newest.insert(change.key.clone(), change.revision);
        }
        self.changes
            .retain(|c| c.revision > floor || newest.get(&c.key) == Some(&c.revision));
        self.compact_at = (self.changes.len() * 2).max(MIN_COMPACTION_LEN);
    }
}

struct NamespaceFeed {
    log: RwLock<NamespaceLog>,
    head: watch::Sender<Revision>,
}

impl NamespaceFeed {
    fn new() -> Self {
        Self {
            log: RwLock::new(NamespaceLog {
                changes: Vec::new(),
                floor: Revision::default(),
                compact_at: MIN_COMPACTION_LEN,
            }),
            head: watch::Sender::new(Revision::default()),
        }
    }

    fn log_mut(&self) -> RwLockWriteGuard<'_, NamespaceLog> {
        match self.log.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Per-namespace, revision-ordered log of published changes.
///
/// Only the store appends, and only after the change is durable and audited.
/// Readers copy out of short critical sections and wait on a watch channel, so
/// no lock is ever held while a poller is suspended.
#[derive(Default)]
pub struct ChangeFeed {
    namespaces: RwLock<HashMap<Namespace, Arc<NamespaceFeed>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn feed(&self, namespace: &Namespace) -> Arc<NamespaceFeed> {
        if let Ok(map) = self.namespaces.read() {
            if let Some(feed) = map.get(namespace) {
                return Arc::clone(feed);
            }
        }
        let mut map = match self.namespaces.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            map.entry(namespace.clone())
                .or_insert_with(|| Arc::new(NamespaceFeed::new())),
        )
    }

    /// Latest published revision of `namespace` (0 when nothing was published).
    pub fn head(&self, namespace: &Namespace) -> Revision {
        *self.feed(namespace).head.borrow()
    }

    /// Append a published change. Revisions must arrive in order without gaps.
    pub fn record(&self, namespace: &Namespace, change: Change) {
        let feed = self.feed(namespace);
        let revision = change.revision;
        {
            let mut log = feed.log_mut();
            debug_assert!(log.changes.last().is_none_or(|last| last.revision < revision));
            log.changes.push(change);
            if log.changes.len() >= log.compact_at {
                log.compact(revision);
            }
        }
        feed.head.send_replace(revision);
    }

    /// Changes with a revision strictly greater than `since`, oldest first.
    ///
    /// Below the compaction floor only the latest change per key is kept, so a
    /// reader that far behind skips superseded versions.
    pub fn since(&self, namespace: &Namespace, since: Revision, limit: usize) -> Vec<Change> {
        let feed = self.feed(namespace);
        let log = match feed.log.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let start = log.changes.partition_point(|c| c.revision <= since);
        log.changes[start..].iter().take(limit).cloned().collect()
    }

    /// Allow changes at or below `floor` to be collapsed and compact right away.
    ///
    /// The floor is the lowest position any reader may resume from; `Revision::MAX`
    /// means no reader needs history, so the log collapses up to the head.
    pub fn set_floor(&self, namespace: &Namespace, floor: Revision) {
        let feed = self.feed(namespace);
        let head = *feed.head.borrow();
        let mut log = feed.log_mut();
        log.floor = floor;
        log.compact(head);
    }

    /// Number of changes currently retained for `namespace`.
    pub fn retained(&self, namespace: &Namespace) -> usize {
        let feed = self.feed(namespace);
        let log = match feed.log.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        log.changes.len()
    }

    /// Receiver that observes every head advance of `namespace`.
    pub fn watch(&self, namespace: &Namespace) -> watch::Receiver<Revision> {
        self.feed(namespace).head.subscribe()
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        match self.namespaces.read() {
            Ok(map) => map.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        }
    }
}
