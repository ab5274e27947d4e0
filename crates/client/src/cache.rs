//! Read-through cache of the files attached to each variation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

use fitout_core::config::ApiConfig;
use fitout_core::domain::attachment::FileRef;
use fitout_core::domain::variation::VariationId;
use fitout_core::errors::ApplicationError;

const DEFAULT_CAPACITY: u64 = 512;

/// Entries expire after the configured TTL and are dropped eagerly after any submission,
/// decision or attachment change on the variation.
#[derive(Clone, Debug)]
pub struct VariationFilesCache {
    inner: Cache<VariationId, Arc<Vec<FileRef>>>,
}

impl VariationFilesCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self { inner: Cache::builder().max_capacity(max_capacity).time_to_live(ttl).build() }
    }

    pub fn from_config(config: &ApiConfig) -> Self {
        Self::new(DEFAULT_CAPACITY, Duration::from_secs(config.files_cache_ttl_secs.max(1)))
    }

    pub async fn get(&self, id: &VariationId) -> Option<Vec<FileRef>> {
        self.inner.get(id).await.map(|files| files.as_ref().clone())
    }

    /// Returns the cached list, or runs `load` and caches its result. Failures are not cached.
    pub async fn get_or_load<F, Fut>(
        &self,
        id: &VariationId,
        load: F,
    ) -> Result<Vec<FileRef>, ApplicationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<FileRef>, ApplicationError>>,
    {
        if let Some(cached) = self.get(id).await {
            return Ok(cached);
        }

        let files = load().await?;
        self.inner.insert(id.clone(), Arc::new(files.clone())).await;
        Ok(files)
    }

    pub async fn invalidate(&self, id: &VariationId) {
        self.inner.invalidate(id).await;
        debug!(
            event_name = "variation.files.cache_invalidated",
            variation_id = %id,
            "files cache entry dropped"
        );
    }
}

impl Default for VariationFilesCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, Duration::from_secs(60))
    }
}
