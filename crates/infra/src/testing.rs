//! Test doubles shared by this crate's tests and downstream black-box tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::blob::InMemoryBlobStore;
use crate::cache::FiguresCache;
use crate::composition::{CompositionError, CompositionOutput, CompositionRequest, ImageComposer};
use crate::fetch::RetryFetcher;
use crate::retry::RetryPolicy;
use crate::service::{ServiceSettings, TryOnService};
use crate::store::InMemoryRecordStore;

/// A tiny PNG header, enough for content sniffing.
pub const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

/// Composer that replays queued answers, then returns an inline PNG.
#[derive(Debug, Default)]
pub struct ScriptedComposer {
    script: Mutex<VecDeque<Result<CompositionOutput, CompositionError>>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl ScriptedComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, answer: Result<CompositionOutput, CompositionError>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(answer);
    }

    /// Delay every answer, e.g. to outlast a processing budget.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageComposer for ScriptedComposer {
    async fn compose(&self, _request: CompositionRequest) -> Result<CompositionOutput, CompositionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.unwrap_or_else(|| {
            Ok(CompositionOutput::Inline {
                bytes: PNG_BYTES.to_vec(),
                content_type: "image/png".to_string(),
            })
        })
    }
}

/// A fully in-memory service plus handles on its collaborators.
pub struct Harness {
    pub service: TryOnService,
    pub records: Arc<InMemoryRecordStore>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub composer: Arc<ScriptedComposer>,
    pub cache: Arc<FiguresCache>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(ServiceSettings::default())
    }

    pub fn with_settings(settings: ServiceSettings) -> Self {
        let records = Arc::new(InMemoryRecordStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new("https://blob.test"));
        let composer = Arc::new(ScriptedComposer::new());
        let cache = Arc::new(FiguresCache::new(Duration::from_secs(60)));
        let fetcher = RetryFetcher::new(
            blobs.clone(),
            RetryPolicy::linear(3, Duration::from_millis(5)),
            Duration::from_secs(5),
        );
        let service = TryOnService::new(
            records.clone(),
            blobs.clone(),
            fetcher,
            composer.clone(),
            cache.clone(),
            settings,
        );
        Self {
            service,
            records,
            blobs,
            composer,
            cache,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
