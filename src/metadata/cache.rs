use std::time::Duration;

use moka::sync::Cache;

use super::EidasMetadataParameters;
use crate::error::EngineResult;

/// Store of parsed metadata keyed by metadata URL.
///
/// Backends report a timeout as [`crate::EngineError::Unavailable`].
pub trait MetadataCache: Send + Sync {
    fn get_eidas_metadata_parameters(&self, url: &str) -> EngineResult<Option<EidasMetadataParameters>>;

    /// `None` invalidates the entry.
    fn put_eidas_metadata_parameters(
        &self,
        url: &str,
        parameters: Option<EidasMetadataParameters>,
    ) -> EngineResult<()>;
}

#[derive(Clone)]
pub struct InMemoryMetadataCache {
    cache: Cache<String, EidasMetadataParameters>,
}

impl InMemoryMetadataCache {
    pub fn new(time_to_live: Duration, max_entries: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(time_to_live)
                .build(),
        }
    }
}

impl MetadataCache for InMemoryMetadataCache {
    fn get_eidas_metadata_parameters(&self, url: &str) -> EngineResult<Option<EidasMetadataParameters>> {
        Ok(self.cache.get(url))
    }

    fn put_eidas_metadata_parameters(
        &self,
        url: &str,
        parameters: Option<EidasMetadataParameters>,
    ) -> EngineResult<()> {
        match parameters {
            Some(parameters) => self.cache.insert(url.to_string(), parameters),
            None => self.cache.invalidate(url),
        }
        Ok(())
    }
}
