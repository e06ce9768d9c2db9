//! Shared cache of tag scans, keyed by canonical repository name.
//!
//! Every resource pointing at the same repository reads the same entry, so a
//! repository is scanned at most once per TTL no matter how many resources
//! reference it. An entry's TTL is the shortest scan interval among the
//! resources currently referring to it.

use crate::clock::Clock;
use crate::resource::ResourceKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub canonical_name: String,
    /// Tags in the order the registry returned them
    pub tags: Vec<String>,
    pub scanned_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub result: Arc<ScanResult>,
    pub fresh: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("scan cache entry for {name} is corrupt: {reason}")]
    Corruption { name: String, reason: String },
}

#[derive(Debug)]
struct CacheEntry {
    result: Option<Arc<ScanResult>>,
    ttl: Duration,
    referrers: HashMap<ResourceKey, Duration>,
}

impl CacheEntry {
    fn empty() -> Self {
        Self {
            result: None,
            ttl: Duration::ZERO,
            referrers: HashMap::new(),
        }
    }

    fn effective_ttl(&self) -> Duration {
        self.referrers.values().min().copied().unwrap_or(self.ttl)
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match &self.result {
            Some(result) => freshness(result, self.effective_ttl(), now).unwrap_or(false),
            None => false,
        }
    }
}

fn freshness(result: &ScanResult, ttl: Duration, now: DateTime<Utc>) -> Result<bool, String> {
    if ttl.is_zero() {
        return Err("entry has a zero TTL window".to_string());
    }
    let age = (now - result.scanned_at)
        .to_std()
        .map_err(|_| format!("scan time {} lies in the future", result.scanned_at))?;
    Ok(age < ttl)
}

pub struct ScanCache {
    entries: DashMap<String, CacheEntry>,
    owners: DashMap<ResourceKey, String>,
    clock: Arc<dyn Clock>,
}

impl ScanCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            owners: DashMap::new(),
            clock,
        }
    }

    pub fn get(&self, canonical_name: &str) -> Result<Option<CacheLookup>, CacheError> {
        let (result, ttl) = match self.entries.get(canonical_name) {
            Some(entry) => match &entry.result {
                Some(result) => (Arc::clone(result), entry.effective_ttl()),
                None => return Ok(None),
            },
            None => return Ok(None),
        };

        let fresh = freshness(&result, ttl, self.clock.now()).map_err(|reason| {
            CacheError::Corruption {
                name: canonical_name.to_string(),
                reason,
            }
        })?;
        Ok(Some(CacheLookup { result, fresh }))
    }

    /// Replaces the stored result; `ttl` applies only while no resource refers
    /// to the entry.
    pub fn put(&self, canonical_name: &str, result: Arc<ScanResult>, ttl: Duration) {
        let mut entry = self
            .entries
            .entry(canonical_name.to_string())
            .or_insert_with(CacheEntry::empty);
        entry.result = Some(result);
        entry.ttl = ttl;
    }

    pub fn evict(&self, canonical_name: &str) -> bool {
        self.entries.remove(canonical_name).is_some()
    }

    /// Drops the stored result but keeps the entry and its referrers.
    pub fn invalidate(&self, canonical_name: &str) -> bool {
        self.entries
            .get_mut(canonical_name)
            .and_then(|mut entry| entry.result.take())
            .is_some()
    }

    /// Records that `key` refers to `canonical_name` with the given scan
    /// interval. A resource that switched to another repository is detached
    /// from its previous entry first.
    pub fn track(&self, canonical_name: &str, key: &ResourceKey, interval: Duration) {
        let previous = self.owners.insert(key.clone(), canonical_name.to_string());
        if let Some(previous) = previous.filter(|p| p != canonical_name) {
            self.detach(&previous, key);
        }
        self.entries
            .entry(canonical_name.to_string())
            .or_insert_with(CacheEntry::empty)
            .referrers
            .insert(key.clone(), interval);
    }

    /// Forgets `key`. Returns the name of the evicted entry when `key` was its
    /// last referrer.
    pub fn release(&self, key: &ResourceKey) -> Option<String> {
        let (_, canonical_name) = self.owners.remove(key)?;
        self.detach(&canonical_name, key).then_some(canonical_name)
    }

    fn detach(&self, canonical_name: &str, key: &ResourceKey) -> bool {
        if let Some(mut entry) = self.entries.get_mut(canonical_name) {
            entry.referrers.remove(key);
        }
        let evicted = self
            .entries
            .remove_if(canonical_name, |_, entry| entry.referrers.is_empty())
            .is_some();
        if evicted {
            debug!(canonical_name, "evicted scan cache entry without referrers");
        }
        evicted
    }

    /// Drops stale entries nobody refers to any more.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.referrers.is_empty() || entry.is_fresh(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn contains(&self, canonical_name: &str) -> bool {
        self.entries.contains_key(canonical_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
