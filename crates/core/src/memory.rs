//! In-memory implementations of the ports.
//!
//! Both stores keep everything in process and never touch the network or disk.
//! They back the orchestrator tests here and in the adapter crates, which
//! enable them through the `test-support` feature.

use crate::domain::{BlobReference, IngestionState, Record, TargetDate};
use crate::ports::{BlobStore, RecordStore, Result, StoreTransaction};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone)]
struct MemoryBlob {
    bytes: Vec<u8>,
    etag: Option<String>,
}

/// Blob store holding named payloads in a single flat container.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    container: String,
    blobs: BTreeMap<String, MemoryBlob>,
    failing_fetches: HashSet<String>,
    listing_failures: Cell<u32>,
    fetched: RefCell<Vec<String>>,
}

impl MemoryBlobStore {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            ..Default::default()
        }
    }

    pub fn with_blob(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.put(name, bytes);
        self
    }

    /// Adds or replaces a blob, bumping its etag when the content changes
    pub fn put(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        let name = name.into();
        let bytes = bytes.into();
        let etag = match self.blobs.get(&name) {
            Some(previous) if previous.bytes == bytes => previous.etag.clone(),
            Some(previous) => Some(format!("{}+", previous.etag.clone().unwrap_or_default())),
            None => Some(format!("\"{}\"", name)),
        };
        self.blobs.insert(name, MemoryBlob { bytes, etag });
    }

    /// Every fetch of `name` fails
    pub fn fail_fetch(mut self, name: impl Into<String>) -> Self {
        self.failing_fetches.insert(name.into());
        self
    }

    /// The next `times` listings fail before listing succeeds again
    pub fn fail_listing(self, times: u32) -> Self {
        self.listing_failures.set(times);
        self
    }

    /// Names fetched so far, in order
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.borrow().clone()
    }
}

impl BlobStore for MemoryBlobStore {
    fn list(&self, prefix: &str) -> Result<Vec<BlobReference>> {
        let remaining = self.listing_failures.get();
        if remaining > 0 {
            self.listing_failures.set(remaining - 1);
            return Err(format!("listing '{}' refused by memory store", prefix).into());
        }

        Ok(self
            .blobs
            .iter()
            .filter(|(name, _)| name.starts_with(prefix) && !name.contains('/'))
            .map(|(name, blob)| BlobReference {
                container: self.container.clone(),
                name: name.clone(),
                etag: blob.etag.clone(),
                size: Some(blob.bytes.len() as u64),
            })
            .collect())
    }

    fn fetch(&self, blob: &BlobReference) -> Result<Vec<u8>> {
        self.fetched.borrow_mut().push(blob.name.clone());
        if self.failing_fetches.contains(&blob.name) {
            return Err(format!("fetch of '{}' refused by memory store", blob.name).into());
        }
        self.blobs
            .get(&blob.name)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| format!("blob '{}' not found", blob.name).into())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StoredRow {
    record: Record,
    date: TargetDate,
    blob_name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Tables {
    rows: BTreeMap<(&'static str, i64), StoredRow>,
    states: BTreeMap<(TargetDate, String), IngestionState>,
}

/// Record store with copy-on-begin transactions.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    committed: Tables,
    failing_upserts: HashSet<String>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts of records coming from `blob_name` fail
    pub fn fail_upserts_for(mut self, blob_name: impl Into<String>) -> Self {
        self.failing_upserts.insert(blob_name.into());
        self
    }

    /// Committed records of one table ordered by key
    pub fn records(&self, table: &str) -> Vec<Record> {
        self.committed
            .rows
            .iter()
            .filter(|((t, _), _)| *t == table)
            .map(|(_, row)| row.record.clone())
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.committed.rows.len()
    }

    /// Committed records that were loaded from `blob_name`
    pub fn records_from(&self, blob_name: &str) -> Vec<Record> {
        self.committed
            .rows
            .values()
            .filter(|row| row.blob_name == blob_name)
            .map(|row| row.record.clone())
            .collect()
    }

    pub fn states(&self) -> Vec<IngestionState> {
        self.committed.states.values().cloned().collect()
    }
}

impl RecordStore for MemoryRecordStore {
    fn is_loaded(&self, date: &TargetDate, blob_name: &str) -> Result<Option<IngestionState>> {
        Ok(self
            .committed
            .states
            .get(&(*date, blob_name.to_string()))
            .cloned())
    }

    fn last_loaded(&self, blob_name: &str) -> Result<Option<IngestionState>> {
        Ok(self
            .committed
            .states
            .values()
            .filter(|state| state.blob_name == blob_name)
            .max_by_key(|state| (state.loaded_at, state.date))
            .cloned())
    }

    fn begin(&mut self) -> Result<Box<dyn StoreTransaction + '_>> {
        let staged = self.committed.clone();
        Ok(Box::new(MemoryTransaction {
            store: self,
            staged,
        }))
    }
}

struct MemoryTransaction<'a> {
    store: &'a mut MemoryRecordStore,
    staged: Tables,
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn upsert(&mut self, record: &Record, date: &TargetDate, blob_name: &str) -> Result<()> {
        if self.store.failing_upserts.contains(blob_name) {
            return Err(format!("upsert from '{}' refused by memory store", blob_name).into());
        }
        let key = (record.table(), record.key());
        if let (Record::Transaction(_), Some(existing)) = (record, self.staged.rows.get(&key)) {
            if existing.date != *date {
                return Err(format!(
                    "transaction {} already loaded for {}",
                    record.key(),
                    existing.date
                )
                .into());
            }
        }
        self.staged.rows.insert(
            key,
            StoredRow {
                record: record.clone(),
                date: *date,
                blob_name: blob_name.to_string(),
            },
        );
        Ok(())
    }

    fn clear_blob(&mut self, blob_name: &str) -> Result<usize> {
        let before = self.staged.rows.len();
        self.staged.rows.retain(|_, row| row.blob_name != blob_name);
        Ok(before - self.staged.rows.len())
    }

    fn mark_loaded(&mut self, state: &IngestionState) -> Result<()> {
        self.staged
            .states
            .insert((state.date, state.blob_name.clone()), state.clone());
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { store, staged } = *self;
        store.committed = staged;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
