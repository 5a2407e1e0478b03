//! On-disk persistence for the record store, backed by redb.
//!
//! Mutations are queued to a dedicated writer thread that applies them in
//! order, batching whatever is queued into one transaction. Callers never
//! wait on a commit.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::mpsc;

use super::record::RendezvousRecord;
use super::StoreError;

const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("rendezvous_records");

/// File name used when the store location is a directory.
pub const DEFAULT_FILE_NAME: &str = "rdvp.redb";

fn record_key(namespace: &str, peer: &str) -> String {
    format!("{namespace}\0{peer}")
}

/// redb-backed table of records.
pub struct Persistence {
    db: Database,
    path: PathBuf,
}

impl Persistence {
    /// Open or create the database at `location`.
    ///
    /// A directory location gets a database file inside it.
    pub fn open(location: &str) -> Result<Self, StoreError> {
        let open_err = |reason: String| StoreError::Open {
            location: location.to_string(),
            reason,
        };

        let mut path = PathBuf::from(location);
        if path.is_dir() {
            path.push(DEFAULT_FILE_NAME);
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| open_err(e.to_string()))?;
        }

        let db = Database::create(&path).map_err(|e| open_err(e.to_string()))?;
        let txn = db.begin_write().map_err(|e| open_err(e.to_string()))?;
        {
            let _ = txn
                .open_table(RECORDS_TABLE)
                .map_err(|e| open_err(e.to_string()))?;
        }
        txn.commit().map_err(|e| open_err(e.to_string()))?;

        tracing::debug!(path = %path.display(), "Record database opened");
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored record. Rows that fail to decode are reported as corrupt.
    pub fn load_all(&self) -> Result<Vec<RendezvousRecord>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS_TABLE)?;
        let mut records = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            let record: RendezvousRecord = serde_json::from_slice(value.value())
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", key.value())))?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn delete(&self, namespace: &str, peer: &str) -> Result<(), StoreError> {
        self.apply(&[WriteOp::Delete {
            namespace: namespace.to_string(),
            peer: peer.to_string(),
        }])
    }

    fn apply(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RECORDS_TABLE)?;
            for op in ops {
                match op {
                    WriteOp::Put(record) => {
                        let data = serde_json::to_vec(record)
                            .map_err(|e| StoreError::Backend(e.to_string()))?;
                        let key = record_key(&record.namespace, &record.peer.to_string());
                        table.insert(key.as_str(), data.as_slice())?;
                    }
                    WriteOp::Delete { namespace, peer } => {
                        table.remove(record_key(namespace, peer).as_str())?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Move the database onto a writer thread.
    pub fn into_writer(self) -> Result<Writer, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.path.clone();
        let thread = std::thread::Builder::new()
            .name("rdvp-store-writer".to_string())
            .spawn(move || write_loop(self, rx))
            .map_err(|e| StoreError::Open {
                location: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Writer {
            tx: Some(tx),
            thread: Some(thread),
            path,
        })
    }
}

/// One queued mutation.
#[derive(Debug)]
pub enum WriteOp {
    Put(RendezvousRecord),
    Delete { namespace: String, peer: String },
}

const MAX_BATCH: usize = 256;

fn write_loop(persistence: Persistence, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    let mut batch = Vec::with_capacity(MAX_BATCH);
    while let Some(op) = rx.blocking_recv() {
        batch.push(op);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(op) => batch.push(op),
                Err(_) => break,
            }
        }
        if let Err(e) = persistence.apply(&batch) {
            tracing::error!(
                path = %persistence.path().display(),
                writes = batch.len(),
                error = %e,
                "Failed to persist records"
            );
        }
        batch.clear();
    }
    tracing::debug!(path = %persistence.path().display(), "Record writer stopped");
}

/// Handle to the writer thread. Dropping it flushes the queue and waits
/// for the thread to finish.
pub struct Writer {
    tx: Option<mpsc::UnboundedSender<WriteOp>>,
    thread: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl Writer {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a mutation. Fails only when the writer thread is gone.
    pub fn send(&self, op: WriteOp) -> Result<(), StoreError> {
        self.tx
            .as_ref()
            .and_then(|tx| tx.send(op).ok())
            .ok_or_else(|| StoreError::Backend("record writer stopped".to_string()))
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(path = %self.path.display(), "Record writer panicked");
            }
        }
    }
}
