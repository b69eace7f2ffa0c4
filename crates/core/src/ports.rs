use crate::domain::{BlobReference, IngestionState, Record, TargetDate};
use std::error::Error;

pub type BoxError = Box<dyn Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, BoxError>;

/// Remote blob storage, authenticated by configuration before it reaches the core.
pub trait BlobStore {
    /// Lists the objects directly under the configured container/directory
    /// whose file name starts with `prefix`, sorted by name.
    fn list(&self, prefix: &str) -> Result<Vec<BlobReference>>;

    fn fetch(&self, blob: &BlobReference) -> Result<Vec<u8>>;
}

/// Local relational store that receives the parsed records.
pub trait RecordStore {
    /// Returns the ingestion marker for (date, blob) if that blob was already committed
    fn is_loaded(&self, date: &TargetDate, blob_name: &str) -> Result<Option<IngestionState>>;

    /// Most recent ingestion marker of `blob_name` on any date
    fn last_loaded(&self, blob_name: &str) -> Result<Option<IngestionState>>;

    /// Starts a transaction. Dropping it without `commit` rolls it back.
    fn begin(&mut self) -> Result<Box<dyn StoreTransaction + '_>>;
}

/// One isolated write unit; a blob's records never share a transaction with another blob.
pub trait StoreTransaction {
    /// Inserts or replaces `record` by its natural key, tagging it with the blob and date it
    /// came from. A transaction id already stored under another date is an error.
    fn upsert(&mut self, record: &Record, date: &TargetDate, blob_name: &str) -> Result<()>;

    /// Removes rows previously loaded from `blob_name`, returning how many went away
    fn clear_blob(&mut self, blob_name: &str) -> Result<usize>;

    fn mark_loaded(&mut self, state: &IngestionState) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

impl<B: BlobStore + ?Sized> BlobStore for &B {
    fn list(&self, prefix: &str) -> Result<Vec<BlobReference>> {
        (**self).list(prefix)
    }

    fn fetch(&self, blob: &BlobReference) -> Result<Vec<u8>> {
        (**self).fetch(blob)
    }
}

impl<S: RecordStore + ?Sized> RecordStore for &mut S {
    fn is_loaded(&self, date: &TargetDate, blob_name: &str) -> Result<Option<IngestionState>> {
        (**self).is_loaded(date, blob_name)
    }

    fn last_loaded(&self, blob_name: &str) -> Result<Option<IngestionState>> {
        (**self).last_loaded(blob_name)
    }

    fn begin(&mut self) -> Result<Box<dyn StoreTransaction + '_>> {
        (**self).begin()
    }
}
