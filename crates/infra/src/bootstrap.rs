//! Builds the shared runtime from configuration: stores, clients, the
//! request-path service.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::blob::{DynBlobStore, HttpBlobStore};
use crate::cache::FiguresCache;
use crate::composition::{DynComposer, HttpComposer};
use crate::config::AppConfig;
use crate::fetch::{HttpTransport, RetryFetcher};
use crate::maintenance::BatchDeleter;
use crate::service::{ServiceSettings, TryOnService};
use crate::store::{DynRecordStore, InMemoryRecordStore, PostgresRecordStore, StoreError};

/// How long cached per-user figures may be served before recomputation.
pub const FIGURES_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}

pub struct Runtime {
    pub config: AppConfig,
    pub records: DynRecordStore,
    pub blobs: DynBlobStore,
    pub cache: Arc<FiguresCache>,
    pub service: TryOnService,
}

impl Runtime {
    pub async fn from_config(config: AppConfig) -> Result<Self, BootstrapError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tryon/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let records: DynRecordStore = match &config.database_url {
            Some(url) => {
                let store = PostgresRecordStore::connect(url).await?;
                store.migrate().await?;
                info!("using postgres record store");
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; records are kept in memory and lost on exit");
                Arc::new(InMemoryRecordStore::new())
            }
        };

        let blobs: DynBlobStore = Arc::new(HttpBlobStore::new(client.clone(), &config.blob));
        let fetcher = RetryFetcher::new(
            Arc::new(HttpTransport::new(client.clone())),
            config.request.fetch_retry,
            config.request.fetch_timeout,
        );
        let composer: DynComposer = Arc::new(HttpComposer::new(client, &config.composer));
        let cache = Arc::new(FiguresCache::new(FIGURES_TTL));

        let service = TryOnService::new(
            records.clone(),
            blobs.clone(),
            fetcher,
            composer,
            cache.clone(),
            ServiceSettings::from_config(&config),
        );

        Ok(Self {
            config,
            records,
            blobs,
            cache,
            service,
        })
    }

    /// Deleter for the expired-task cleanup path.
    pub fn cleanup_deleter(&self) -> BatchDeleter {
        let m = &self.config.maintenance;
        BatchDeleter::new(m.cleanup_batch_size, m.batch_delay, m.batch_delay)
    }

    /// Deleter for the orphan path: smaller batches, longer wait after errors.
    pub fn orphan_deleter(&self) -> BatchDeleter {
        let m = &self.config.maintenance;
        BatchDeleter::new(m.orphan_batch_size, m.batch_delay, m.error_backoff)
    }
}
