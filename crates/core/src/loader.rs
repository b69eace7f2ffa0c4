//! Commits parsed records blob by blob.
//!
//! Each blob is written in its own transaction together with its ingestion
//! marker, so a blob is either fully loaded and marked or not present at all.
//! Reference files replace the rows of their previous load, and are left alone
//! when their content hash matches the last one recorded.

use crate::domain::{BlobReference, IngestionState, Record, TargetDate};
use crate::error::{IngestError, IngestResult};
use crate::ports::{self, BoxError, RecordStore, StoreTransaction};
use crate::schema::Dataset;
use chrono::Utc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { rows: usize },
    /// The blob was already committed for this date
    Skipped,
    /// Reference file with the same content as its last load
    Unchanged,
}

pub struct LoadCoordinator<'a> {
    store: Box<dyn RecordStore + 'a>,
    force_reload: bool,
}

impl<'a> LoadCoordinator<'a> {
    pub fn new(store: Box<dyn RecordStore + 'a>, force_reload: bool) -> Self {
        Self {
            store,
            force_reload,
        }
    }

    /// Whether `blob` is already loaded for `date` and can be skipped before fetching
    pub fn should_skip(&self, date: &TargetDate, blob: &BlobReference) -> IngestResult<bool> {
        if self.force_reload {
            return Ok(false);
        }

        let state = self
            .store
            .is_loaded(date, &blob.name)
            .map_err(|source| load_error(blob, source))?;

        let Some(state) = state else {
            return Ok(false);
        };

        if let (Some(loaded), Some(current)) = (&state.etag, &blob.etag) {
            if loaded != current {
                warn!(
                    blob = %blob.name,
                    date = %date,
                    loaded_etag = %loaded,
                    current_etag = %current,
                    "blob changed since it was loaded; rerun with --force-reload to re-ingest it"
                );
            }
        }
        Ok(true)
    }

    /// Commits `records` for `blob` and marks it loaded, all in one transaction
    pub fn load(
        &mut self,
        date: &TargetDate,
        blob: &BlobReference,
        content_hash: &str,
        records: &[Record],
    ) -> IngestResult<LoadOutcome> {
        if self.should_skip(date, blob)? {
            return Ok(LoadOutcome::Skipped);
        }

        let reference = Dataset::from_file_name(blob.file_name()).is_some_and(|d| d.is_reference());
        if reference && !self.force_reload && self.unchanged(blob, content_hash)? {
            info!(blob = %blob.name, date = %date, "no change detected since last load");
            return Ok(LoadOutcome::Unchanged);
        }

        let state = IngestionState {
            date: *date,
            blob_name: blob.name.clone(),
            content_hash: content_hash.to_string(),
            etag: blob.etag.clone(),
            row_count: records.len(),
            loaded_at: Utc::now().naive_utc(),
        };

        let replace = self.force_reload || reference;
        let mut tx = self
            .store
            .begin()
            .map_err(|source| load_error(blob, source))?;

        match write_blob(tx.as_mut(), &state, records, replace) {
            Ok(()) => tx.commit().map_err(|source| load_error(blob, source))?,
            Err(source) => {
                if let Err(e) = tx.rollback() {
                    warn!(blob = %blob.name, error = %e, "rollback failed");
                }
                return Err(load_error(blob, source));
            }
        }

        Ok(LoadOutcome::Loaded {
            rows: records.len(),
        })
    }

    fn unchanged(&self, blob: &BlobReference, content_hash: &str) -> IngestResult<bool> {
        let previous = self
            .store
            .last_loaded(&blob.name)
            .map_err(|source| load_error(blob, source))?;
        Ok(previous.is_some_and(|state| state.content_hash == content_hash))
    }
}

fn write_blob(
    tx: &mut dyn StoreTransaction,
    state: &IngestionState,
    records: &[Record],
    replace: bool,
) -> ports::Result<()> {
    if replace {
        let removed = tx.clear_blob(&state.blob_name)?;
        debug!(blob = %state.blob_name, removed, "cleared previously loaded rows");
    }
    for record in records {
        tx.upsert(record, &state.date, &state.blob_name)?;
    }
    tx.mark_loaded(state)
}

fn load_error(blob: &BlobReference, source: BoxError) -> IngestError {
    IngestError::Load {
        blob: blob.name.clone(),
        source,
    }
}
