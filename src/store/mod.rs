//! Rendezvous record store.
//!
//! # Data Flow
//! ```text
//! Local register   → upsert   (always applies)
//! Replica upsert   → merge    (expiry > stored and > tombstone wins)
//! Local unregister → remove                (leaves a tombstone)
//! Replica remove   → remove_if_not_fresher (leaves a tombstone)
//! Discover         → query    (live records, ordered by insertion seq)
//! Sweeper          → reclaim_expired (records and tombstones)
//! ```
//!
//! # Design Decisions
//! - The in-memory index is authoritative; redb mirrors it when a file
//!   location is configured and is read back once at open
//! - Mutations on one (namespace, peer) key are serialized by the index
//!   entry lock. Disk writes are queued under that lock, so disk order
//!   matches memory order, and committed by the persistence writer thread
//! - A tombstone keeps the expiry of a removed record until that expiry
//!   passes; replicated upserts that do not outlive it are rejected.
//!   Tombstones are not persisted
//! - After `close` every operation fails with `StoreError::Closed`

pub mod persist;
pub mod record;
pub mod sweeper;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::identity::PeerId;
use persist::{Persistence, WriteOp, Writer};

pub use record::{
    now_ms, Page, Registration, RendezvousRecord, UpsertOutcome, DEFAULT_TTL, MAX_TTL,
};

/// Location value that selects a purely in-memory store.
pub const IN_MEMORY: &str = ":memory:";

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot open record store at {location}: {reason}")]
    Open { location: String, reason: String },
    #[error("record store is closed")]
    Closed,
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("corrupt record {0}")]
    Corrupt(String),
}

macro_rules! backend_error {
    ($($ty:ty),+ $(,)?) => {
        $(impl From<$ty> for StoreError {
            fn from(e: $ty) -> Self {
                StoreError::Backend(e.to_string())
            }
        })+
    };
}

backend_error!(
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Store settings.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Upper bound applied to every TTL and replicated expiry.
    pub max_ttl: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { max_ttl: MAX_TTL }
    }
}

type RecordKey = (String, PeerId);

struct StoreInner {
    records: DashMap<RecordKey, RendezvousRecord>,
    /// Expiry of removed records, by key.
    tombstones: DashMap<RecordKey, u64>,
    next_seq: AtomicU64,
    persistence: RwLock<Option<Writer>>,
    closed: AtomicBool,
    options: StoreOptions,
    location: String,
}

/// Shared handle to the record store.
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<StoreInner>,
}

impl RecordStore {
    /// Open the store at `location` (`":memory:"` or a file path).
    pub fn open(location: &str, options: StoreOptions) -> Result<Self, StoreError> {
        let persistence = if location == IN_MEMORY {
            None
        } else {
            Some(Persistence::open(location)?)
        };

        let records = DashMap::new();
        let mut max_seq = 0;
        if let Some(p) = &persistence {
            let now = now_ms();
            let mut loaded = 0usize;
            for record in p.load_all().map_err(|e| StoreError::Open {
                location: location.to_string(),
                reason: e.to_string(),
            })? {
                if record.is_expired_at(now) {
                    p.delete(&record.namespace, &record.peer.to_string())?;
                    continue;
                }
                max_seq = max_seq.max(record.seq);
                records.insert((record.namespace.clone(), record.peer.clone()), record);
                loaded += 1;
            }
            tracing::info!(path = %p.path().display(), records = loaded, "Record store loaded");
        } else {
            tracing::info!("Record store is in memory");
        }
        let persistence = persistence.map(Persistence::into_writer).transpose()?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                records,
                tombstones: DashMap::new(),
                next_seq: AtomicU64::new(max_seq + 1),
                persistence: RwLock::new(persistence),
                closed: AtomicBool::new(false),
                options,
                location: location.to_string(),
            }),
        })
    }

    /// In-memory store with default options.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                records: DashMap::new(),
                tombstones: DashMap::new(),
                next_seq: AtomicU64::new(1),
                persistence: RwLock::new(None),
                closed: AtomicBool::new(false),
                options: StoreOptions::default(),
                location: IN_MEMORY.to_string(),
            }),
        }
    }

    pub fn location(&self) -> &str {
        &self.inner.location
    }

    pub fn max_ttl(&self) -> Duration {
        self.inner.options.max_ttl
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn next_seq(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn persist(&self, op: impl FnOnce() -> WriteOp) -> Result<(), StoreError> {
        let guard = self
            .inner
            .persistence
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(writer) => writer.send(op()),
            None if self.inner.closed.load(Ordering::Acquire) => Err(StoreError::Closed),
            None => Ok(()),
        }
    }

    fn persist_put(&self, record: &RendezvousRecord) -> Result<(), StoreError> {
        self.persist(|| WriteOp::Put(record.clone()))
    }

    fn persist_delete(&self, namespace: &str, peer: &PeerId) -> Result<(), StoreError> {
        self.persist(|| WriteOp::Delete {
            namespace: namespace.to_string(),
            peer: peer.to_string(),
        })
    }

    /// Remember that a record expiring at `expires_at` was removed.
    fn bury(&self, key: RecordKey, expires_at: u64) {
        if expires_at <= now_ms() {
            return;
        }
        self.inner
            .tombstones
            .entry(key)
            .and_modify(|t| *t = (*t).max(expires_at))
            .or_insert(expires_at);
    }

    fn tombstone(&self, key: &RecordKey) -> Option<u64> {
        self.inner.tombstones.get(key).map(|t| *t)
    }

    fn cap_expiry(&self, expires_at: u64, now: u64) -> u64 {
        expires_at.min(now.saturating_add(self.inner.options.max_ttl.as_millis() as u64))
    }

    /// Apply a local registration.
    ///
    /// The newest local registration always replaces the stored record,
    /// whether its expiry is earlier or later, and clears any tombstone.
    /// Returns the record now stored under the key and what happened.
    pub fn upsert(
        &self,
        registration: Registration,
    ) -> Result<(RendezvousRecord, UpsertOutcome), StoreError> {
        self.ensure_open()?;
        let now = now_ms();
        let ttl = registration.ttl.min(self.inner.options.max_ttl);
        let expires_at = now.saturating_add(ttl.as_millis() as u64);
        let Registration {
            namespace,
            peer,
            addrs,
            ..
        } = registration;

        match self.inner.records.entry((namespace.clone(), peer.clone())) {
            Entry::Occupied(mut entry) => {
                let live = !entry.get().is_expired_at(now);
                let seq = if live { entry.get().seq } else { self.next_seq() };
                let record = RendezvousRecord {
                    namespace,
                    peer,
                    addrs,
                    expires_at,
                    seq,
                };
                self.persist_put(&record)?;
                entry.insert(record.clone());
                let outcome = if live {
                    UpsertOutcome::Refreshed
                } else {
                    UpsertOutcome::Inserted
                };
                Ok((record, outcome))
            }
            Entry::Vacant(entry) => {
                let record = RendezvousRecord {
                    namespace,
                    peer,
                    addrs,
                    expires_at,
                    seq: self.next_seq(),
                };
                self.persist_put(&record)?;
                self.inner.tombstones.remove(entry.key());
                entry.insert(record.clone());
                Ok((record, UpsertOutcome::Inserted))
            }
        }
    }

    /// Apply a record replicated from another node.
    ///
    /// Applied only when its expiry is strictly later than the stored one
    /// and than the tombstone of a removed one. Returns whether the store
    /// changed.
    pub fn merge(&self, record: RendezvousRecord) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let now = now_ms();
        let expires_at = self.cap_expiry(record.expires_at, now);
        if expires_at <= now {
            return Ok(false);
        }

        match self
            .inner
            .records
            .entry((record.namespace.clone(), record.peer.clone()))
        {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                let live = !current.is_expired_at(now);
                if live && expires_at <= current.expires_at {
                    return Ok(false);
                }
                let merged = RendezvousRecord {
                    expires_at,
                    seq: if live { current.seq } else { self.next_seq() },
                    ..record
                };
                self.persist_put(&merged)?;
                entry.insert(merged);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                if self.tombstone(entry.key()).is_some_and(|t| expires_at <= t) {
                    return Ok(false);
                }
                let merged = RendezvousRecord {
                    expires_at,
                    seq: self.next_seq(),
                    ..record
                };
                self.persist_put(&merged)?;
                self.inner.tombstones.remove(entry.key());
                entry.insert(merged);
                Ok(true)
            }
        }
    }

    /// Live records in `namespace` (every namespace when empty), ordered
    /// by insertion sequence, starting after `cursor`.
    pub fn query(&self, namespace: &str, limit: usize, cursor: u64) -> Result<Page, StoreError> {
        self.ensure_open()?;
        let now = now_ms();
        let mut records: Vec<RendezvousRecord> = self
            .inner
            .records
            .iter()
            .filter(|entry| {
                let r = entry.value();
                r.seq > cursor
                    && !r.is_expired_at(now)
                    && (namespace.is_empty() || r.namespace == namespace)
            })
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_unstable_by_key(|r| r.seq);
        records.truncate(limit);
        let cursor = records.last().map_or(cursor, |r| r.seq);
        Ok(Page { records, cursor })
    }

    /// The live record for a key, if any.
    pub fn get(&self, namespace: &str, peer: &PeerId) -> Result<Option<RendezvousRecord>, StoreError> {
        self.ensure_open()?;
        let now = now_ms();
        Ok(self
            .inner
            .records
            .get(&(namespace.to_string(), peer.clone()))
            .map(|r| r.value().clone())
            .filter(|r| !r.is_expired_at(now)))
    }

    /// Remove a registration, leaving a tombstone. Removing a missing key
    /// is not an error.
    pub fn remove(
        &self,
        namespace: &str,
        peer: &PeerId,
    ) -> Result<Option<RendezvousRecord>, StoreError> {
        self.ensure_open()?;
        match self
            .inner
            .records
            .entry((namespace.to_string(), peer.clone()))
        {
            Entry::Occupied(entry) => {
                self.persist_delete(namespace, peer)?;
                self.bury(entry.key().clone(), entry.get().expires_at);
                Ok(Some(entry.remove()))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    /// Apply a replicated removal: the stored record goes only if it does
    /// not expire later than `tombstone`. The tombstone is kept either way,
    /// so a removal that overtakes its upsert still wins.
    pub fn remove_if_not_fresher(&self, tombstone: &RendezvousRecord) -> Result<bool, StoreError> {
        self.ensure_open()?;
        match self
            .inner
            .records
            .entry((tombstone.namespace.clone(), tombstone.peer.clone()))
        {
            Entry::Occupied(entry) if entry.get().expires_at <= tombstone.expires_at => {
                self.persist_delete(&tombstone.namespace, &tombstone.peer)?;
                self.bury(entry.key().clone(), tombstone.expires_at);
                entry.remove();
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                self.bury(entry.key().clone(), tombstone.expires_at);
                Ok(false)
            }
        }
    }

    /// Drop every expired record and tombstone. Returns how many records
    /// went.
    pub fn reclaim_expired(&self) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let now = now_ms();
        let expired: Vec<RecordKey> = self
            .inner
            .records
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut reclaimed = 0;
        for key in expired {
            if let Entry::Occupied(entry) = self.inner.records.entry(key) {
                if entry.get().is_expired_at(now) {
                    self.persist_delete(&entry.key().0, &entry.key().1)?;
                    entry.remove();
                    reclaimed += 1;
                }
            }
        }
        self.inner.tombstones.retain(|_, expires_at| *expires_at > now);
        Ok(reclaimed)
    }

    /// Number of stored records, expired ones included until reclaimed.
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    /// Number of tombstones not yet reclaimed.
    pub fn tombstone_count(&self) -> usize {
        self.inner.tombstones.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the store and release the database, waiting for queued writes
    /// to be committed. Safe to call repeatedly.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let persistence = self
            .inner
            .persistence
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(persistence);
        tracing::info!(location = %self.inner.location, "Record store closed");
    }
}
