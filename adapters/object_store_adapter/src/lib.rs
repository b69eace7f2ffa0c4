//! Blob store backed by the `object_store` crate.
//!
//! The core runs synchronously, so this adapter owns a current-thread tokio
//! runtime and blocks on every call. Azure Blob Storage is used in production;
//! a local directory can stand in for a container during development and tests.

use std::sync::Arc;
use std::time::Duration;

use ingest_core::domain::BlobReference;
use ingest_core::ports::{self, BlobStore};
use object_store::azure::MicrosoftAzureBuilder;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid connection string: {0}")]
    ConnectionString(String),

    #[error("failed to create {store_type} object store: {source}")]
    Creation {
        store_type: &'static str,
        #[source]
        source: object_store::Error,
    },

    #[error("failed to start blob store runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Credentials and location of an Azure container.
#[derive(Debug, Clone)]
pub struct AzureConfiguration {
    pub account: String,
    pub access_key: String,
    pub container: String,
    /// Virtual directory inside the container holding the blobs
    pub directory: Option<String>,
    /// Per request timeout; a timed out call surfaces as a listing/fetch error
    pub timeout: Duration,
}

impl AzureConfiguration {
    /// Reads account name and key from an Azure storage connection string
    /// (`DefaultEndpointsProtocol=https;AccountName=...;AccountKey=...;...`).
    pub fn from_connection_string(
        connection_string: &str,
        container: impl Into<String>,
    ) -> Result<Self> {
        let mut account = None;
        let mut access_key = None;
        for part in connection_string.split(';').filter(|p| !p.trim().is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::ConnectionString(format!("segment '{}' has no '='", part)))?;
            match key.trim() {
                "AccountName" => account = Some(value.trim().to_string()),
                // keys are base64 and may end with '=' padding, split_once keeps it in `value`
                "AccountKey" => access_key = Some(value.trim().to_string()),
                _ => {}
            }
        }

        Ok(Self {
            account: account
                .ok_or_else(|| Error::ConnectionString("missing AccountName".to_string()))?,
            access_key: access_key
                .ok_or_else(|| Error::ConnectionString("missing AccountKey".to_string()))?,
            container: container.into(),
            directory: None,
            timeout: Duration::from_secs(30),
        })
    }
}

/// BlobStore implementation over any `ObjectStore`
pub struct ObjectStoreBlobStore {
    store: Arc<dyn ObjectStore>,
    container: String,
    directory: Option<Path>,
    runtime: Runtime,
}

impl ObjectStoreBlobStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        container: impl Into<String>,
        directory: Option<&str>,
    ) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            store,
            container: container.into(),
            directory: directory.filter(|d| !d.is_empty()).map(Path::from),
            runtime,
        })
    }

    /// Connects to an Azure Blob Storage container
    pub fn azure(config: &AzureConfiguration) -> Result<Self> {
        // retries are driven by the pipeline so failures surface once per attempt
        let retry = RetryConfig {
            max_retries: 0,
            ..Default::default()
        };
        let store = MicrosoftAzureBuilder::new()
            .with_account(&config.account)
            .with_access_key(&config.access_key)
            .with_container_name(&config.container)
            .with_client_options(ClientOptions::new().with_timeout(config.timeout))
            .with_retry(retry)
            .build()
            .map_err(|source| Error::Creation {
                store_type: "Azure Blob Storage",
                source,
            })?;

        Self::new(
            Arc::new(store),
            config.container.clone(),
            config.directory.as_deref(),
        )
    }

    /// Treats a local directory as the container
    pub fn local(root: impl AsRef<std::path::Path>, directory: Option<&str>) -> Result<Self> {
        let root = root.as_ref();
        let store = LocalFileSystem::new_with_prefix(root).map_err(|source| Error::Creation {
            store_type: "local filesystem",
            source,
        })?;
        let container = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());

        Self::new(Arc::new(store), container, directory)
    }

    fn object_path(&self, name: &str) -> Path {
        match &self.directory {
            Some(dir) => dir.child(name),
            None => Path::from(name),
        }
    }
}

impl BlobStore for ObjectStoreBlobStore {
    fn list(&self, prefix: &str) -> ports::Result<Vec<BlobReference>> {
        let listing = self
            .runtime
            .block_on(self.store.list_with_delimiter(self.directory.as_ref()))?;

        let mut blobs: Vec<BlobReference> = listing
            .objects
            .into_iter()
            .filter_map(|meta| {
                let name = meta.location.filename()?.to_string();
                name.starts_with(prefix).then(|| BlobReference {
                    container: self.container.clone(),
                    name,
                    etag: meta.e_tag,
                    size: Some(meta.size),
                })
            })
            .collect();
        blobs.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(
            container = %self.container,
            directory = ?self.directory.as_ref().map(|d| d.to_string()),
            prefix,
            count = blobs.len(),
            "listed objects"
        );
        Ok(blobs)
    }

    fn fetch(&self, blob: &BlobReference) -> ports::Result<Vec<u8>> {
        let path = self.object_path(&blob.name);
        let bytes = self.runtime.block_on(async {
            let result = self.store.get(&path).await?;
            result.bytes().await
        })?;
        Ok(bytes.to_vec())
    }
}
