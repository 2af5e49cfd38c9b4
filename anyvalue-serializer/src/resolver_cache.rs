//! Memoized label resolvers.
//!
//! Building a resolver copies key material for every label; request paths that
//! serialize many values for the same user reuse one instance through this cache.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyvalue_common::logging::{Component, Logger};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::label_resolver::{
    create_context_label_resolver, LabelKeyword, LabelResolver, LabelResolverConfig,
};

type CacheKey = [u8; 32];

/// Cache sizing, loadable from configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverCacheConfig {
    pub max_size: usize,
    pub ttl_seconds: u64,
}

impl Default for ResolverCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub max_size: usize,
    pub ttl_seconds: u64,
}

struct CacheEntry {
    resolver: Arc<dyn LabelResolver>,
    created_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    // Creation order, oldest first.
    order: VecDeque<CacheKey>,
}

impl CacheState {
    fn remove(&mut self, key: &CacheKey) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

pub struct ResolverCache {
    state: Mutex<CacheState>,
    max_size: usize,
    ttl: Duration,
    logger: Logger,
}

impl ResolverCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_size,
            ttl,
            logger: Logger::new_root(Component::ResolverCache, "resolver-cache"),
        }
    }

    pub fn from_config(config: &ResolverCacheConfig) -> Self {
        Self::new(config.max_size, Duration::from_secs(config.ttl_seconds))
    }

    pub fn with_logger(mut self, logger: &Logger) -> Self {
        self.logger = logger.with_component(Component::ResolverCache);
        self
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // Critical sections never leave the state half-updated; poisoning is ignored.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached resolver for `(config, user_keys)`, building it on a miss.
    ///
    /// Within the TTL the same `Arc` is returned for identical inputs. The lookup
    /// and the insert happen under one lock so concurrent misses for the same key
    /// build a single resolver.
    pub fn get_or_create(
        &self,
        config: &LabelResolverConfig,
        user_keys: &[Vec<u8>],
    ) -> Result<Arc<dyn LabelResolver>> {
        let key = cache_key(config, user_keys);
        let mut state = self.lock();

        if let Some(entry) = state.entries.get(&key) {
            if entry.created_at.elapsed() < self.ttl {
                self.logger.debug("resolver cache hit");
                return Ok(entry.resolver.clone());
            }
            self.logger.debug("resolver cache entry expired");
            state.remove(&key);
        }

        let resolver = create_context_label_resolver(config, user_keys)?;
        if self.max_size == 0 {
            return Ok(resolver);
        }

        while state.entries.len() >= self.max_size {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
            self.logger.debug("evicted oldest resolver cache entry");
        }

        state.entries.insert(
            key,
            CacheEntry {
                resolver: resolver.clone(),
                created_at: Instant::now(),
            },
        );
        state.order.push_back(key);
        self.logger.debug_args(format_args!(
            "resolver cache miss, {} entries cached",
            state.entries.len()
        ));

        Ok(resolver)
    }

    /// Drop expired entries, returning how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut state = self.lock();
        let expired: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() >= self.ttl)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            state.remove(key);
        }
        if !expired.is_empty() {
            self.logger.debug_args(format_args!(
                "removed {} expired resolver cache entries",
                expired.len()
            ));
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total_entries: self.len(),
            max_size: self.max_size,
            ttl_seconds: self.ttl.as_secs(),
        }
    }
}

impl Default for ResolverCache {
    fn default() -> Self {
        Self::from_config(&ResolverCacheConfig::default())
    }
}

/// Stable digest of a label policy and the user keys bound to it.
///
/// Label order does not matter; user key order does.
fn cache_key(config: &LabelResolverConfig, user_keys: &[Vec<u8>]) -> CacheKey {
    let mut labels: Vec<_> = config.label_mappings.iter().collect();
    labels.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    hasher.update((labels.len() as u64).to_le_bytes());
    for (label, value) in labels {
        update_len_prefixed(&mut hasher, label.as_bytes());
        match &value.network_public_key {
            Some(key) => {
                hasher.update([1u8]);
                update_len_prefixed(&mut hasher, key);
            }
            None => hasher.update([0u8]),
        }
        match value.user_key_spec {
            Some(LabelKeyword::CurrentUser) => hasher.update([1u8]),
            None => hasher.update([0u8]),
        }
    }

    hasher.update((user_keys.len() as u64).to_le_bytes());
    for key in user_keys {
        update_len_prefixed(&mut hasher, key);
    }

    hasher.finalize().into()
}

fn update_len_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

// ---------------------------------------------------------------------------
// Process-wide cache
// ---------------------------------------------------------------------------

static GLOBAL_CACHE: Lazy<RwLock<Arc<ResolverCache>>> =
    Lazy::new(|| RwLock::new(Arc::new(ResolverCache::default())));

pub fn get_global_cache() -> Arc<ResolverCache> {
    GLOBAL_CACHE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Replace the process-wide cache.
pub fn set_global_cache(cache: ResolverCache) {
    *GLOBAL_CACHE.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(cache);
}

pub fn clear_global_cache() {
    get_global_cache().clear();
}

pub fn cleanup_global_cache() -> usize {
    get_global_cache().cleanup_expired()
}

pub fn get_cache_stats() -> CacheStats {
    get_global_cache().stats()
}
