use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sha2::{Digest, Sha256};
use std::fmt;

/// The single calendar date an invocation processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetDate(NaiveDate);

impl TargetDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for TargetDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// Identifies one remote object. Only lives for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReference {
    pub container: String,
    /// Object path relative to the directory the blob store was configured with
    pub name: String,
    pub etag: Option<String>,
    pub size: Option<u64>,
}

impl BlobReference {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
            etag: None,
            size: None,
        }
    }

    /// Last path segment of the blob name
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

impl fmt::Display for BlobReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

/// Bytes of one fetched blob, handed from the fetch step to the parser.
#[derive(Debug, Clone)]
pub struct RawPayload {
    bytes: Vec<u8>,
    content_hash: String,
}

impl RawPayload {
    pub fn new(bytes: Vec<u8>) -> Self {
        let content_hash = hex::encode(Sha256::digest(&bytes));
        Self {
            bytes,
            content_hash,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hex encoded SHA-256 of the payload
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub transaction_id: i64,
    pub client_id: i64,
    pub product_id: i64,
    pub store_id: i64,
    pub transaction_time: NaiveDateTime,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientRecord {
    pub id: i64,
    pub name: String,
    pub job: Option<String>,
    pub email: Option<String>,
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductRecord {
    pub id: i64,
    pub ean: i64,
    pub brand: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
    pub id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub opening: NaiveTime,
    pub closing: NaiveTime,
    pub store_type: String,
}

/// One normalized row ready to be upserted into the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Transaction(TransactionRecord),
    Client(ClientRecord),
    Product(ProductRecord),
    Store(StoreRecord),
}

impl Record {
    /// Table the record belongs to
    pub fn table(&self) -> &'static str {
        match self {
            Record::Transaction(_) => "transactions",
            Record::Client(_) => "clients",
            Record::Product(_) => "products",
            Record::Store(_) => "stores",
        }
    }

    /// Natural key of the row within its table
    pub fn key(&self) -> i64 {
        match self {
            Record::Transaction(t) => t.transaction_id,
            Record::Client(c) => c.id,
            Record::Product(p) => p.id,
            Record::Store(s) => s.id,
        }
    }
}

/// Persistent marker stating that a blob was committed for a date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionState {
    pub date: TargetDate,
    pub blob_name: String,
    pub content_hash: String,
    pub etag: Option<String>,
    pub row_count: usize,
    pub loaded_at: NaiveDateTime,
}

/// How a single blob ended up in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobOutcome {
    Loaded { rows: usize },
    Skipped,
    /// Reference file fetched but identical to its last load
    Unchanged,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReport {
    pub blob_name: String,
    pub outcome: BlobOutcome,
}

/// Aggregated result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub date: TargetDate,
    pub blobs: Vec<BlobReport>,
}

impl RunSummary {
    pub fn new(date: TargetDate) -> Self {
        Self {
            date,
            blobs: Vec::new(),
        }
    }

    pub fn record(&mut self, blob_name: impl Into<String>, outcome: BlobOutcome) {
        self.blobs.push(BlobReport {
            blob_name: blob_name.into(),
            outcome,
        });
    }

    pub fn loaded(&self) -> usize {
        self.count(|o| matches!(o, BlobOutcome::Loaded { .. }))
    }

    /// Blobs already loaded plus reference files with no change detected
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, BlobOutcome::Skipped | BlobOutcome::Unchanged))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, BlobOutcome::Failed { .. }))
    }

    /// Rows committed during this run
    pub fn rows(&self) -> usize {
        self.blobs
            .iter()
            .map(|b| match b.outcome {
                BlobOutcome::Loaded { rows } => rows,
                _ => 0,
            })
            .sum()
    }

    fn count(&self, pred: impl Fn(&BlobOutcome) -> bool) -> usize {
        self.blobs.iter().filter(|b| pred(&b.outcome)).count()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "date={} loaded={} skipped={} failed={} rows={}",
            self.date,
            self.loaded(),
            self.skipped(),
            self.failed(),
            self.rows()
        )
    }
}
