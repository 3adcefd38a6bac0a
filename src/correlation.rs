//! Pending requests, keyed by request id, awaiting their response.

use std::time::Duration;

use moka::sync::Cache;
use time::OffsetDateTime;
use tracing::warn;

use crate::{
    error::{EngineError, EngineResult},
    request::EidasAuthenticationRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationEntry {
    pub request: EidasAuthenticationRequest,
    pub relay_state: Option<String>,
    pub created_at: OffsetDateTime,
}

impl CorrelationEntry {
    pub fn new(request: EidasAuthenticationRequest, relay_state: Option<String>) -> Self {
        Self {
            request,
            relay_state,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Store of pending requests shared by every request-handling thread.
///
/// Backends report a timeout as [`EngineError::Unavailable`], never as a
/// missing entry.
pub trait CorrelationMap: Send + Sync {
    /// Fails with [`EngineError::DuplicateRequestId`] when `id` is already
    /// pending. Never overwrites.
    fn put(&self, id: &str, entry: CorrelationEntry) -> EngineResult<()>;

    fn get(&self, id: &str) -> EngineResult<Option<CorrelationEntry>>;

    /// Deletes `id` and returns the entry it held, as one atomic step: of
    /// two concurrent calls for the same id only one sees the entry.
    /// Removing an absent id is not an error.
    fn remove(&self, id: &str) -> EngineResult<Option<CorrelationEntry>>;

    /// Consumes the entry a response answers. Built on [`Self::remove`], so
    /// a response is accepted at most once even when replayed concurrently.
    fn take(&self, in_response_to: &str) -> EngineResult<CorrelationEntry> {
        self.remove(in_response_to)?.ok_or_else(|| {
            warn!(request_id = %in_response_to, "no pending request, possible replay");
            EngineError::UnsolicitedResponse(in_response_to.to_string())
        })
    }
}

/// In-process [`CorrelationMap`] evicting entries after a time to live.
#[derive(Clone)]
pub struct InMemoryCorrelationMap {
    cache: Cache<String, CorrelationEntry>,
}

impl InMemoryCorrelationMap {
    pub fn new(time_to_live: Duration, max_entries: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(time_to_live)
                .build(),
        }
    }
}

impl CorrelationMap for InMemoryCorrelationMap {
    fn put(&self, id: &str, entry: CorrelationEntry) -> EngineResult<()> {
        let inserted = self.cache.entry(id.to_string()).or_insert_with(|| entry);
        if !inserted.is_fresh() {
            warn!(request_id = %id, "request id already pending");
            return Err(EngineError::DuplicateRequestId(id.to_string()));
        }
        Ok(())
    }

    fn get(&self, id: &str) -> EngineResult<Option<CorrelationEntry>> {
        Ok(self.cache.get(id))
    }

    fn remove(&self, id: &str) -> EngineResult<Option<CorrelationEntry>> {
        Ok(self.cache.remove(id))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::loa::NotifiedLevelOfAssurance;

    fn entry(id: &str) -> CorrelationEntry {
        let request = EidasAuthenticationRequest::builder()
            .id(id)
            .issuer("http://localhost:7001/SP/metadata")
            .destination("https://proxy.be/ServiceProvider")
            .citizen_country_code("BE")
            .level_of_assurance(NotifiedLevelOfAssurance::Low)
            .build()
            .unwrap();
        CorrelationEntry::new(request, Some("relay".into()))
    }

    #[test]
    fn can_refuse_duplicate_id() {
        let map = InMemoryCorrelationMap::new(Duration::from_secs(60), 10);
        map.put("_a", entry("_a")).unwrap();
        assert!(matches!(
            map.put("_a", entry("_a")),
            Err(EngineError::DuplicateRequestId(_))
        ));
    }

    #[test]
    fn can_consume_entry_once() {
        let map = InMemoryCorrelationMap::new(Duration::from_secs(60), 10);
        map.put("_a", entry("_a")).unwrap();
        assert_eq!(map.get("_a").unwrap().unwrap().relay_state.as_deref(), Some("relay"));
        map.remove("_a").unwrap();
        assert!(map.get("_a").unwrap().is_none());
        assert!(map.remove("_a").unwrap().is_none());

        map.put("_b", entry("_b")).unwrap();
        assert_eq!(map.take("_b").unwrap().request.id, "_b");
        assert!(matches!(
            map.take("_b"),
            Err(EngineError::UnsolicitedResponse(_))
        ));
    }

    #[test]
    fn can_expire_entries() {
        let map = InMemoryCorrelationMap::new(Duration::from_millis(50), 10);
        map.put("_a", entry("_a")).unwrap();
        thread::sleep(Duration::from_millis(120));
        assert!(map.get("_a").unwrap().is_none());
    }

    #[test]
    fn can_accept_only_one_concurrent_put() {
        let map = Arc::new(InMemoryCorrelationMap::new(Duration::from_secs(60), 100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                thread::spawn(move || map.put("_same", entry("_same")).is_ok())
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn can_take_entry_once_under_concurrent_replay() {
        let map = Arc::new(InMemoryCorrelationMap::new(Duration::from_secs(60), 100));
        map.put("_replayed", entry("_replayed")).unwrap();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    map.take("_replayed")
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .filter_map(|outcome| outcome.as_ref().err())
            .all(|err| matches!(err, EngineError::UnsolicitedResponse(_))));
    }
}
