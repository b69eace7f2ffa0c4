use std::time::Duration;

/// Settings for one pipeline run, built once at startup and passed down explicitly.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Container the blobs are read from, used to label blob references
    pub container: String,
    /// Dated blob prefix, `{date}` is replaced with the target date
    pub prefix_template: String,
    /// Only blobs with this suffix are ingested
    pub extension: String,
    /// Abort on the first blob failure instead of summarizing
    pub fail_fast: bool,
    /// Re-ingest blobs already marked as loaded
    pub force_reload: bool,
    /// Refresh the clients/products/stores files before the dated blobs
    pub include_reference: bool,
    /// Extra attempts for listing and for each fetch
    pub retries: u32,
    pub retry_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            container: String::from("retail"),
            prefix_template: String::from("transactions_{date}_"),
            extension: String::from(".csv"),
            fail_fast: false,
            force_reload: false,
            include_reference: false,
            retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}
