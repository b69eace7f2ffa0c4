use crate::config::PipelineConfig;
use crate::domain::{BlobOutcome, BlobReference, RawPayload, RunSummary, TargetDate};
use crate::error::{IngestError, IngestResult};
use crate::loader::{LoadCoordinator, LoadOutcome};
use crate::parser::parse_blob;
use crate::ports::{self, BlobStore, RecordStore};
use crate::resolver::{blob_prefix, resolve_target_date, Clock, RunMode};
use crate::schema::REFERENCE_BLOBS;
use std::thread;
use tracing::{debug, error, info, warn};

/// Stages of one invocation, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Start,
    DateResolved,
    BlobsListed,
    Finished,
}

/// Application service that ingests every blob of one target date
pub struct IngestionServiceImpl<'a> {
    blob_store: Box<dyn BlobStore + 'a>,
    loader: LoadCoordinator<'a>,
    config: PipelineConfig,
    phase: RunPhase,
}

impl<'a> IngestionServiceImpl<'a> {
    /// Creates a new IngestionServiceImpl with the given dependencies
    pub fn new(
        blob_store: Box<dyn BlobStore + 'a>,
        record_store: Box<dyn RecordStore + 'a>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            blob_store,
            loader: LoadCoordinator::new(record_store, config.force_reload),
            config,
            phase: RunPhase::Start,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Resolves the target date from `mode` and ingests it
    pub fn execute_ingestion(
        &mut self,
        mode: &RunMode,
        clock: &dyn Clock,
    ) -> IngestResult<RunSummary> {
        let date = resolve_target_date(mode, clock)?;
        self.run(date)
    }

    /// Ingests the blobs of an already resolved date.
    ///
    /// Per-blob failures end up in the summary unless fail-fast is set. Only a
    /// failed listing (or fail-fast) makes the whole run fail.
    pub fn run(&mut self, date: TargetDate) -> IngestResult<RunSummary> {
        self.phase = RunPhase::Start;
        self.advance(RunPhase::DateResolved);
        info!(date = %date, "starting ingestion");

        let mut blobs = Vec::new();
        if self.config.include_reference {
            blobs.extend(self.reference_blobs());
        }
        blobs.extend(self.list_dated_blobs(&date)?);
        self.advance(RunPhase::BlobsListed);

        let mut summary = RunSummary::new(date);
        if blobs.is_empty() {
            info!(date = %date, "no blobs match the target date, nothing to ingest");
        }

        for blob in &blobs {
            let outcome = match self.process_blob(&date, blob) {
                Ok(LoadOutcome::Loaded { rows }) => {
                    info!(blob = %blob.name, rows, "loaded");
                    BlobOutcome::Loaded { rows }
                }
                Ok(LoadOutcome::Skipped) => {
                    info!(blob = %blob.name, "skipped, already loaded");
                    BlobOutcome::Skipped
                }
                Ok(LoadOutcome::Unchanged) => BlobOutcome::Unchanged,
                Err(e) => {
                    error!(blob = %blob.name, error = %e, "blob failed");
                    if self.config.fail_fast {
                        self.advance(RunPhase::Finished);
                        return Err(IngestError::FailFast {
                            blob: blob.name.clone(),
                            source: Box::new(e),
                        });
                    }
                    BlobOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            summary.record(blob.name.clone(), outcome);
        }

        self.advance(RunPhase::Finished);
        info!(
            date = %date,
            loaded = summary.loaded(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            rows = summary.rows(),
            "ingestion finished"
        );
        Ok(summary)
    }

    fn advance(&mut self, next: RunPhase) {
        debug!(from = ?self.phase, to = ?next, "run phase");
        self.phase = next;
    }

    fn list_dated_blobs(&self, date: &TargetDate) -> IngestResult<Vec<BlobReference>> {
        let prefix = blob_prefix(&self.config.prefix_template, date);
        let mut blobs = self
            .with_retries("list", &prefix, || self.blob_store.list(&prefix))
            .map_err(|source| IngestError::Listing {
                prefix: prefix.clone(),
                source,
            })?;

        blobs.retain(|blob| {
            let keep = blob.name.ends_with(&self.config.extension);
            if !keep {
                debug!(blob = %blob.name, "ignoring blob with unexpected extension");
            }
            keep
        });
        blobs.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(prefix = %prefix, count = blobs.len(), "listed blobs");
        Ok(blobs)
    }

    /// Reference files are looked up by exact name so their etag is known before loading.
    /// A failed lookup falls back to a reference without etag and lets the fetch decide.
    fn reference_blobs(&self) -> Vec<BlobReference> {
        REFERENCE_BLOBS
            .iter()
            .map(|name| {
                let found = match self.with_retries("list", name, || self.blob_store.list(name)) {
                    Ok(found) => found.into_iter().find(|b| b.name == *name),
                    Err(e) => {
                        warn!(blob = %name, error = %e, "reference lookup failed");
                        None
                    }
                };
                found.unwrap_or_else(|| BlobReference::new(self.config.container.clone(), *name))
            })
            .collect()
    }

    fn process_blob(
        &mut self,
        date: &TargetDate,
        blob: &BlobReference,
    ) -> IngestResult<LoadOutcome> {
        if self.loader.should_skip(date, blob)? {
            return Ok(LoadOutcome::Skipped);
        }

        let bytes = self
            .with_retries("fetch", &blob.name, || self.blob_store.fetch(blob))
            .map_err(|source| IngestError::Fetch {
                blob: blob.name.clone(),
                source,
            })?;
        let payload = RawPayload::new(bytes);
        debug!(
            blob = %blob.name,
            bytes = payload.len(),
            hash = %payload.content_hash(),
            "fetched"
        );

        let records = parse_blob(blob, &payload)?;
        debug!(blob = %blob.name, records = records.len(), "parsed");

        self.loader
            .load(date, blob, payload.content_hash(), &records)
    }

    fn with_retries<T>(
        &self,
        operation: &str,
        subject: &str,
        mut call: impl FnMut() -> ports::Result<T>,
    ) -> ports::Result<T> {
        let mut attempt = 0;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.config.retries => {
                    attempt += 1;
                    warn!(operation, subject, attempt, error = %e, "retrying");
                    thread::sleep(self.config.retry_backoff * attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBlobStore, MemoryRecordStore};
    use crate::resolver::FixedClock;
    use chrono::NaiveDate;
    use std::time::Duration;

    const HEADER: &str = "transaction_id;client_id;product_id;store_id;date;hour;minute;quantity\n";

    fn transactions(first_id: i64, rows: usize) -> String {
        let mut text = HEADER.to_string();
        for i in 0..rows as i64 {
            text.push_str(&format!("{};1;10;3;2023-11-24;8;{};1\n", first_id + i, i));
        }
        text
    }

    fn date() -> TargetDate {
        TargetDate::new(NaiveDate::from_ymd_opt(2023, 11, 24).unwrap())
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            retry_backoff: Duration::ZERO,
            ..PipelineConfig::default()
        }
    }

    fn reference_blobs() -> MemoryBlobStore {
        MemoryBlobStore::new("retail")
            .with_blob(
                "clients.csv",
                "id;name;job;email;account_id\n1;Ana;Chef;ana@example.com;ACC-1\n",
            )
            .with_blob(
                "products.csv",
                "id;ean;brand;description\n10;8400000000010;Acme;Soap\n",
            )
            .with_blob(
                "stores.csv",
                "id;latlng;opening;closing;type\n3;(40.4, -3.7);08:00;21:00;Express\n",
            )
    }

    fn run(
        blobs: &MemoryBlobStore,
        store: &mut MemoryRecordStore,
        config: PipelineConfig,
    ) -> IngestResult<RunSummary> {
        IngestionServiceImpl::new(Box::new(blobs), Box::new(store), config).run(date())
    }

    #[test]
    fn test_malformed_row_fails_only_that_blob() {
        let mut bad = transactions(100, 5);
        bad.push_str("105;1;10;3;2023-11-24;9;5;many\n");
        let blobs = MemoryBlobStore::new("retail")
            .with_blob("transactions_2023-11-24_8.csv", transactions(1, 3))
            .with_blob("transactions_2023-11-24_9.csv", bad);
        let mut store = MemoryRecordStore::new();

        let summary = run(&blobs, &mut store, config()).unwrap();

        assert_eq!(summary.loaded(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(store.records("transactions").len(), 3);
        assert!(store.records_from("transactions_2023-11-24_9.csv").is_empty());
        match &summary.blobs[1].outcome {
            BlobOutcome::Failed { reason } => assert!(reason.contains("row 5"), "{reason}"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_second_run_skips_everything_without_fetching() {
        let blobs = MemoryBlobStore::new("retail")
            .with_blob("transactions_2023-11-24_8.csv", transactions(1, 2))
            .with_blob("transactions_2023-11-24_9.csv", transactions(10, 2));
        let mut store = MemoryRecordStore::new();

        let first = run(&blobs, &mut store, config()).unwrap();
        assert_eq!(first.loaded(), 2);
        let rows_after_first = store.records("transactions");

        let second = run(&blobs, &mut store, config()).unwrap();
        assert_eq!(second.skipped(), 2);
        assert_eq!(second.loaded(), 0);
        assert_eq!(store.records("transactions"), rows_after_first);
        assert_eq!(blobs.fetched().len(), 2);
    }

    #[test]
    fn test_no_matching_blobs_is_an_empty_success() {
        let blobs = MemoryBlobStore::new("retail")
            .with_blob("transactions_2023-11-23_8.csv", transactions(1, 2));
        let mut store = MemoryRecordStore::new();

        let summary = run(&blobs, &mut store, config()).unwrap();

        assert_eq!(summary.loaded(), 0);
        assert!(summary.blobs.is_empty());
        assert_eq!(store.row_count(), 0);
        assert!(store.states().is_empty());
        assert!(blobs.fetched().is_empty());
    }

    #[test]
    fn test_blobs_processed_in_name_order_and_extension_filtered() {
        let blobs = MemoryBlobStore::new("retail")
            .with_blob("transactions_2023-11-24_9.csv", transactions(20, 1))
            .with_blob("transactions_2023-11-24_10.csv", transactions(10, 1))
            .with_blob("transactions_2023-11-24_8.json", "{}");
        let mut store = MemoryRecordStore::new();

        let summary = run(&blobs, &mut store, config()).unwrap();

        let names: Vec<_> = summary.blobs.iter().map(|b| b.blob_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["transactions_2023-11-24_10.csv", "transactions_2023-11-24_9.csv"]
        );
    }

    #[test]
    fn test_fetch_failure_does_not_stop_siblings() {
        let blobs = MemoryBlobStore::new("retail")
            .with_blob("transactions_2023-11-24_8.csv", transactions(1, 2))
            .with_blob("transactions_2023-11-24_9.csv", transactions(10, 2))
            .fail_fetch("transactions_2023-11-24_8.csv");
        let mut store = MemoryRecordStore::new();

        let summary = run(&blobs, &mut store, config()).unwrap();

        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.loaded(), 1);
        // one attempt plus two retries for the failing blob
        assert_eq!(
            blobs
                .fetched()
                .iter()
                .filter(|n| *n == "transactions_2023-11-24_8.csv")
                .count(),
            3
        );
    }

    #[test]
    fn test_load_failure_keeps_earlier_blob_committed() {
        let blobs = MemoryBlobStore::new("retail")
            .with_blob("transactions_2023-11-24_10.csv", transactions(1, 2))
            .with_blob("transactions_2023-11-24_11.csv", transactions(10, 2));
        let mut store = MemoryRecordStore::new().fail_upserts_for("transactions_2023-11-24_11.csv");

        let summary = run(&blobs, &mut store, config()).unwrap();

        assert_eq!(summary.loaded(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(store.records_from("transactions_2023-11-24_10.csv").len(), 2);
        assert!(store.records_from("transactions_2023-11-24_11.csv").is_empty());
    }

    #[test]
    fn test_fail_fast_stops_on_first_failure() {
        let blobs = MemoryBlobStore::new("retail")
            .with_blob("transactions_2023-11-24_10.csv", transactions(1, 2))
            .with_blob("transactions_2023-11-24_11.csv", "# this file contains garbage\n")
            .with_blob("transactions_2023-11-24_12.csv", transactions(10, 2));
        let mut store = MemoryRecordStore::new();
        let config = PipelineConfig {
            fail_fast: true,
            ..config()
        };

        let err = run(&blobs, &mut store, config).unwrap_err();

        assert!(matches!(
            err,
            IngestError::FailFast { ref blob, .. } if blob == "transactions_2023-11-24_11.csv"
        ));
        assert_eq!(store.records_from("transactions_2023-11-24_10.csv").len(), 2);
        assert!(store.records_from("transactions_2023-11-24_12.csv").is_empty());
    }

    #[test]
    fn test_listing_failure_is_fatal_after_retries() {
        let blobs = MemoryBlobStore::new("retail").fail_listing(3);
        let mut store = MemoryRecordStore::new();

        let err = run(&blobs, &mut store, config()).unwrap_err();
        assert!(matches!(err, IngestError::Listing { .. }));
    }

    #[test]
    fn test_listing_recovers_within_retries() {
        let blobs = MemoryBlobStore::new("retail")
            .with_blob("transactions_2023-11-24_8.csv", transactions(1, 1))
            .fail_listing(2);
        let mut store = MemoryRecordStore::new();

        let summary = run(&blobs, &mut store, config()).unwrap();
        assert_eq!(summary.loaded(), 1);
    }

    #[test]
    fn test_reference_blobs_load_first() {
        let blobs =
            reference_blobs().with_blob("transactions_2023-11-24_8.csv", transactions(1, 1));
        let mut store = MemoryRecordStore::new();
        let config = PipelineConfig {
            include_reference: true,
            ..config()
        };

        let summary = run(&blobs, &mut store, config).unwrap();

        let names: Vec<_> = summary.blobs.iter().map(|b| b.blob_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["clients.csv", "products.csv", "stores.csv", "transactions_2023-11-24_8.csv"]
        );
        assert_eq!(summary.loaded(), 4);
        assert_eq!(store.records("clients").len(), 1);
    }

    #[test]
    fn test_missing_reference_blob_is_a_blob_failure() {
        let blobs = MemoryBlobStore::new("retail")
            .with_blob("transactions_2023-11-24_8.csv", transactions(1, 1));
        let mut store = MemoryRecordStore::new();
        let config = PipelineConfig {
            include_reference: true,
            ..config()
        };

        let summary = run(&blobs, &mut store, config).unwrap();
        assert_eq!(summary.failed(), 3);
        assert_eq!(summary.loaded(), 1);
    }

    #[test]
    fn test_changed_blob_is_skipped_unless_forced() {
        let mut blobs = MemoryBlobStore::new("retail")
            .with_blob("transactions_2023-11-24_8.csv", transactions(1, 3));
        let mut store = MemoryRecordStore::new();
        run(&blobs, &mut store, config()).unwrap();

        blobs.put("transactions_2023-11-24_8.csv", transactions(50, 1));
        let skipped = run(&blobs, &mut store, config()).unwrap();
        assert_eq!(skipped.skipped(), 1);
        assert_eq!(store.records("transactions").len(), 3);

        let forced = PipelineConfig {
            force_reload: true,
            ..config()
        };
        let reloaded = run(&blobs, &mut store, forced).unwrap();
        assert_eq!(reloaded.loaded(), 1);
        let records = store.records("transactions");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key(), 50);
    }

    #[test]
    fn test_execute_ingestion_resolves_auto_date() {
        let blobs = MemoryBlobStore::new("retail")
            .with_blob("transactions_2024-01-01_8.csv", HEADER);
        let mut store = MemoryRecordStore::new();
        let mut service =
            IngestionServiceImpl::new(Box::new(&blobs), Box::new(&mut store), config());

        let clock = FixedClock(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        let summary = service.execute_ingestion(&RunMode::Auto, &clock).unwrap();

        assert_eq!(summary.date.to_string(), "2024-01-01");
        assert_eq!(summary.blobs.len(), 1);
        assert_eq!(service.phase(), RunPhase::Finished);
    }

    #[test]
    fn test_execute_ingestion_rejects_bad_date_before_listing() {
        let blobs = MemoryBlobStore::new("retail").fail_listing(u32::MAX);
        let mut store = MemoryRecordStore::new();
        let mut service =
            IngestionServiceImpl::new(Box::new(&blobs), Box::new(&mut store), config());

        let clock = FixedClock(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        let err = service
            .execute_ingestion(&RunMode::Manual("2024-13-01".to_string()), &clock)
            .unwrap_err();

        assert!(matches!(err, IngestError::InvalidDateFormat { .. }));
        assert_eq!(service.phase(), RunPhase::Start);
    }

    #[test]
    fn test_unchanged_reference_files_are_not_reloaded_next_day() {
        let blobs = reference_blobs();
        let mut store = MemoryRecordStore::new();
        let config = PipelineConfig {
            include_reference: true,
            ..config()
        };
        run(&blobs, &mut store, config.clone()).unwrap();

        let next_day = TargetDate::new(NaiveDate::from_ymd_opt(2023, 11, 25).unwrap());
        let summary = IngestionServiceImpl::new(Box::new(&blobs), Box::new(&mut store), config)
            .run(next_day)
            .unwrap();

        assert_eq!(summary.loaded(), 0);
        assert_eq!(summary.skipped(), 3);
        assert!(summary
            .blobs
            .iter()
            .all(|b| b.outcome == BlobOutcome::Unchanged));
        assert_eq!(store.states().len(), 3);
    }

    #[test]
    fn test_reference_lookup_retries_before_falling_back() {
        let blobs = reference_blobs().fail_listing(1);
        let mut store = MemoryRecordStore::new();
        let config = PipelineConfig {
            include_reference: true,
            ..config()
        };

        let summary = run(&blobs, &mut store, config).unwrap();

        assert_eq!(summary.loaded(), 3);
        let clients = store
            .states()
            .into_iter()
            .find(|s| s.blob_name == "clients.csv")
            .unwrap();
        assert!(clients.etag.is_some());
    }

    #[test]
    fn test_failed_reference_lookup_still_fetches() {
        // every lookup fails: three reference names with three attempts each
        let blobs = reference_blobs().fail_listing(9);
        let mut store = MemoryRecordStore::new();
        let config = PipelineConfig {
            include_reference: true,
            ..config()
        };

        let summary = run(&blobs, &mut store, config).unwrap();

        assert_eq!(summary.loaded(), 3);
        assert!(store.states().iter().all(|s| s.etag.is_none()));
    }
}
