//! Change notification bus.
//!
//! Every committed write transaction that changed at least one record
//! produces exactly one [`Notification`].  Notifications are delivered to
//! each subscriber in commit order over a bounded queue; a full queue blocks
//! the committing writer until the subscriber catches up, so nothing is ever
//! dropped.  Subscribers must therefore not drain their queue from a thread
//! that is itself waiting on a write transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::record::Collection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub collection: Collection,
    pub id: String,
    pub kind: ChangeKind,
}

/// Rows of one view group touched by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewChange {
    pub view: String,
    pub group: String,
    pub row_ids: Vec<String>,
}

/// Consolidated delta of one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub commit_seq: u64,
    pub record_changes: Vec<RecordChange>,
    pub view_changes: Vec<ViewChange>,
}

impl Notification {
    pub fn touches_view(&self, view: &str) -> bool {
        self.view_changes.iter().any(|c| c.view == view)
    }

    pub fn touches_group(&self, view: &str, group: &str) -> bool {
        self.view_changes
            .iter()
            .any(|c| c.view == view && c.group == group)
    }

    pub fn record_change(&self, collection: Collection, id: &str) -> Option<ChangeKind> {
        self.record_changes
            .iter()
            .find(|c| c.collection == collection && c.id == id)
            .map(|c| c.kind)
    }
}

// ---------------------------------------------------------------------------
// Change sets
// ---------------------------------------------------------------------------

/// Record changes of one transaction, merged per record.
#[derive(Debug, Default)]
pub struct ChangeSet {
    entries: BTreeMap<(Collection, String), ChangeKind>,
}

impl ChangeSet {
    pub fn record(&mut self, collection: Collection, id: &str, kind: ChangeKind) {
        let key = (collection, id.to_string());
        let merged = match (self.entries.get(&key).copied(), kind) {
            (None, kind) => Some(kind),
            (Some(ChangeKind::Insert), ChangeKind::Delete) => None,
            (Some(ChangeKind::Insert), _) => Some(ChangeKind::Insert),
            (Some(ChangeKind::Delete), ChangeKind::Insert) => Some(ChangeKind::Update),
            (Some(_), ChangeKind::Delete) => Some(ChangeKind::Delete),
            (Some(_), ChangeKind::Update) => Some(ChangeKind::Update),
            (Some(ChangeKind::Update), ChangeKind::Insert) => Some(ChangeKind::Update),
        };
        match merged {
            Some(kind) => {
                self.entries.insert(key, kind);
            }
            None => {
                self.entries.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn into_changes(self) -> Vec<RecordChange> {
        self.entries
            .into_iter()
            .map(|((collection, id), kind)| RecordChange {
                collection,
                id,
                kind,
            })
            .collect()
    }
}

/// View rows touched by one transaction.
#[derive(Debug, Default)]
pub struct ViewChangeSet {
    groups: BTreeMap<(String, String), BTreeSet<String>>,
}

impl ViewChangeSet {
    pub fn touch(&mut self, view: &str, group: &str, id: &str) {
        self.groups
            .entry((view.to_string(), group.to_string()))
            .or_default()
            .insert(id.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn into_changes(self) -> Vec<ViewChange> {
        self.groups
            .into_iter()
            .map(|((view, group), ids)| ViewChange {
                view,
                group,
                row_ids: ids.into_iter().collect(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

pub struct NotificationBus {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, SyncSender<Arc<Notification>>)>>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Result<Subscription> {
        let (tx, rx) = mpsc::sync_channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .map_err(|_| StoreError::LockPoisoned("notification subscribers"))?
            .push((id, tx));
        tracing::debug!(subscriber = id, capacity = self.capacity, "notification subscriber added");
        Ok(Subscription { rx })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map_or(0, |s| s.len())
    }

    /// Deliver to every live subscriber, blocking on full queues.
    pub(crate) fn publish(&self, notification: Notification) -> Result<()> {
        let notification = Arc::new(notification);
        let targets = self
            .subscribers
            .lock()
            .map_err(|_| StoreError::LockPoisoned("notification subscribers"))?
            .clone();

        let mut gone = Vec::new();
        for (id, tx) in targets {
            if tx.send(Arc::clone(&notification)).is_err() {
                gone.push(id);
            }
        }

        if !gone.is_empty() {
            let mut subscribers = self
                .subscribers
                .lock()
                .map_err(|_| StoreError::LockPoisoned("notification subscribers"))?;
            subscribers.retain(|(id, _)| !gone.contains(id));
            tracing::debug!(removed = gone.len(), "pruned disconnected subscribers");
        }
        Ok(())
    }
}

/// Receiving end of the bus.  Dropping it unsubscribes.
pub struct Subscription {
    rx: Receiver<Arc<Notification>>,
}

impl Subscription {
    /// Block until the next notification; `None` once the store is gone.
    pub fn recv(&self) -> Option<Arc<Notification>> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Arc<Notification>> {
        match self.rx.recv_timeout(timeout) {
            Ok(n) => Some(n),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<Arc<Notification>> {
        match self.rx.try_recv() {
            Ok(n) => Some(n),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Everything currently queued, in commit order.
    pub fn drain(&self) -> Vec<Arc<Notification>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Merge everything currently queued into one notification carrying the
    /// latest commit sequence.  Record changes merge like within a single
    /// transaction; view changes union their rows.
    pub fn drain_coalesced(&self) -> Option<Notification> {
        let queued = self.drain();
        let commit_seq = queued.last()?.commit_seq;

        let mut records = ChangeSet::default();
        let mut views = ViewChangeSet::default();
        for n in &queued {
            for c in &n.record_changes {
                records.record(c.collection, &c.id, c.kind);
            }
            for c in &n.view_changes {
                for id in &c.row_ids {
                    views.touch(&c.view, &c.group, id);
                }
            }
        }

        Some(Notification {
            commit_seq,
            record_changes: records.into_changes(),
            view_changes: views.into_changes(),
        })
    }
}
