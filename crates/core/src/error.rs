use crate::ports::BoxError;
use thiserror::Error;

/// Errors raised while ingesting a target date.
///
/// `InvalidDateFormat` and `Listing` abort the run. The per-blob variants are
/// folded into the run summary unless fail-fast is configured.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid date '{input}': expected YYYY-MM-DD")]
    InvalidDateFormat { input: String },

    #[error("failed to list blobs with prefix '{prefix}': {source}")]
    Listing {
        prefix: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to fetch blob '{blob}': {source}")]
    Fetch {
        blob: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to parse blob '{blob}' at row {row}: {reason}")]
    Parse {
        blob: String,
        row: usize,
        reason: String,
    },

    #[error("failed to load blob '{blob}': {source}")]
    Load {
        blob: String,
        #[source]
        source: BoxError,
    },

    #[error("blob '{blob}' failed and fail-fast is enabled")]
    FailFast {
        blob: String,
        #[source]
        source: Box<IngestError>,
    },
}

impl IngestError {
    /// Whether this error is isolated to a single blob
    pub fn is_per_blob(&self) -> bool {
        matches!(
            self,
            Self::Fetch { .. } | Self::Parse { .. } | Self::Load { .. }
        )
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
