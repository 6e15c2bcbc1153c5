//! Query Result Cache
//!
//! Caches serialized [`QueryResult`]s keyed by a SHA-256 fingerprint of
//! (caller, resource, table, spec) so repeated identical requests skip both
//! materialization and execution.
//!
//! The cache is strictly best-effort. Every backend failure, timeout, or
//! undecodable payload is logged and treated as a miss; nothing in this
//! module returns an error to the query path.
//!
//! # Backends
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`RedisBackend`] | shared across service replicas |
//! | [`MemoryBackend`] | single process, tests |
//! | [`DisabledBackend`] | caching off |

mod memory;
mod redis_backend;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

pub use self::memory::{DisabledBackend, MemoryBackend};
pub use self::redis_backend::RedisBackend;

use crate::config::{CacheBackendKind, CacheConfig};
use crate::error::{Result, TabularError};
use crate::query::{QueryResult, QuerySpec};

/// Sub-namespace for query results under the configured prefix.
const RESULTS_NAMESPACE: &str = "query_results";

/// Errors raised by cache backends. Never leaves this module's public
/// surface as a request failure.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Redis round trip failed
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Round trip exceeded the configured bound
    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Storage interface for cache payloads.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch the payload stored under `key`, if present and unexpired.
    async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, CacheError>;

    /// Store `value` under `key` for `ttl`.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> std::result::Result<(), CacheError>;

    /// Short backend name for logs and status.
    fn name(&self) -> &'static str;
}

/// SHA-256 fingerprint of one query, hex-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Lowercase hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    caller: &'a str,
    resource: &'a str,
    table: &'a str,
    spec: &'a QuerySpec,
}

/// Fingerprints a query.
///
/// The input is serialized as JSON with a fixed field order and an ordered
/// filter map, so two specs that differ only in filter insertion order hash
/// identically while any other difference (including caller) changes the key.
pub fn fingerprint(caller: &str, resource: &str, table: &str, spec: &QuerySpec) -> CacheKey {
    let input = FingerprintInput {
        caller,
        resource,
        table,
        spec,
    };
    // Serializing plain strings, integers and a string map cannot fail.
    let canonical = serde_json::to_vec(&input).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    CacheKey(hex::encode(hasher.finalize()))
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Backend name
    pub backend: String,
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses, including degraded lookups
    pub misses: u64,
    /// Successful writes
    pub writes: u64,
    /// Backend failures and timeouts
    pub errors: u64,
    /// Hit rate
    pub hit_rate: f64,
}

/// Best-effort result cache over a [`CacheBackend`].
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
    ttl: Duration,
    timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

impl ResultCache {
    /// Create a cache over `backend` using the namespace, TTL and timeout
    /// from `config`.
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            namespace: config.namespace.clone(),
            ttl: config.ttl(),
            timeout: config.timeout(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Build the backend named by `config` and wrap it.
    ///
    /// Only an unparseable Redis URL fails; connection happens lazily.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let backend: Arc<dyn CacheBackend> = match config.backend {
            CacheBackendKind::Redis => Arc::new(
                RedisBackend::open(&config.redis_url)
                    .map_err(|e| TabularError::Config(format!("Invalid redis_url: {}", e)))?,
            ),
            CacheBackendKind::Memory => Arc::new(MemoryBackend::new()),
            CacheBackendKind::Disabled => Arc::new(DisabledBackend),
        };
        Ok(Self::new(backend, config))
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledBackend), &CacheConfig::disabled())
    }

    /// Full backend key for `key`: `<namespace>:query_results:<hex>`.
    pub fn storage_key(&self, key: &CacheKey) -> String {
        format!("{}:{}:{}", self.namespace, RESULTS_NAMESPACE, key)
    }

    /// Default entry TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a cached result. Never fails; any problem is a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<QueryResult> {
        let storage_key = self.storage_key(key);

        let raw = match tokio::time::timeout(self.timeout, self.backend.get(&storage_key)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return self.degraded_miss(&storage_key, e),
            Err(_) => return self.degraded_miss(&storage_key, CacheError::Timeout(self.timeout)),
        };

        let Some(bytes) = raw else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache miss for {}", storage_key);
            return None;
        };

        match serde_json::from_slice::<QueryResult>(&bytes) {
            Ok(result) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit for {}", storage_key);
                Some(result)
            }
            Err(e) => self.degraded_miss(&storage_key, CacheError::Serialization(e)),
        }
    }

    /// Store a result. Failures are logged, never propagated.
    pub async fn put(&self, key: &CacheKey, result: &QueryResult, ttl: Option<Duration>) {
        let storage_key = self.storage_key(key);
        let ttl = ttl.unwrap_or(self.ttl);

        let payload = match serde_json::to_vec(result) {
            Ok(payload) => payload,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to encode cache payload for {}: {}", storage_key, e);
                return;
            }
        };

        match tokio::time::timeout(self.timeout, self.backend.set(&storage_key, payload, ttl)).await
        {
            Ok(Ok(())) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                debug!("Cached {} for {:?}", storage_key, ttl);
            }
            Ok(Err(e)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to cache {}: {}", storage_key, e);
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Failed to cache {}: {}",
                    storage_key,
                    CacheError::Timeout(self.timeout)
                );
            }
        }
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            backend: self.backend.name().to_string(),
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    #[cold]
    fn degraded_miss(&self, storage_key: &str, err: CacheError) -> Option<QueryResult> {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        warn!("Cache lookup for {} degraded to miss: {}", storage_key, err);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ResultSource, SortOrder};

    fn sample_result() -> QueryResult {
        QueryResult {
            table_name: "Genes".to_string(),
            headers: vec!["ID".to_string()],
            rows: vec![vec!["g1".to_string()]],
            row_count: 1,
            total_count: 10,
            filtered_count: 1,
            db_query_ms: 1.5,
            conversion_ms: 0.1,
            response_time_ms: 3.0,
            source: ResultSource::Database,
        }
    }

    /// Backend that fails or stalls every call.
    struct BrokenBackend {
        stall: bool,
    }

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        async fn get(&self, _key: &str) -> std::result::Result<Option<Vec<u8>>, CacheError> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Err(CacheError::Timeout(Duration::ZERO))
        }

        async fn set(
            &self,
            _key: &str,
            _value: Vec<u8>,
            _ttl: Duration,
        ) -> std::result::Result<(), CacheError> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Err(CacheError::Timeout(Duration::ZERO))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let spec = QuerySpec::new("Genes").with_limit(10);
        let a = fingerprint("alice", "76990/7/2", "Genes", &spec);
        let b = fingerprint("alice", "76990/7/2", "Genes", &spec);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_ignores_filter_insertion_order() {
        let one = QuerySpec::new("Genes").with_filter("a", "1").with_filter("b", "2");
        let two = QuerySpec::new("Genes").with_filter("b", "2").with_filter("a", "1");
        assert_eq!(
            fingerprint("u", "r", "Genes", &one),
            fingerprint("u", "r", "Genes", &two)
        );
    }

    #[test]
    fn test_fingerprint_separates_callers_and_specs() {
        let spec = QuerySpec::new("Genes");
        let base = fingerprint("alice", "r", "Genes", &spec);
        assert_ne!(base, fingerprint("bob", "r", "Genes", &spec));
        assert_ne!(base, fingerprint("alice", "r2", "Genes", &spec));
        assert_ne!(
            base,
            fingerprint("alice", "r", "Genes", &spec.clone().with_sort("ID", SortOrder::Desc))
        );
    }

    #[test]
    fn test_storage_key_layout() {
        let cache = ResultCache::new(Arc::new(MemoryBackend::new()), &CacheConfig::memory());
        let key = fingerprint("u", "r", "t", &QuerySpec::new("t"));
        assert_eq!(
            cache.storage_key(&key),
            format!("tabular:query_results:{}", key)
        );
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = ResultCache::new(Arc::new(MemoryBackend::new()), &CacheConfig::memory());
        let key = fingerprint("u", "r", "Genes", &QuerySpec::new("Genes"));

        assert!(cache.get(&key).await.is_none());
        cache.put(&key, &sample_result(), None).await;
        assert_eq!(cache.get(&key).await, Some(sample_result()));

        let stats = cache.stats();
        assert_eq!(stats.backend, "memory");
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_miss() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = ResultCache::new(backend.clone(), &CacheConfig::memory());
        let key = fingerprint("u", "r", "Genes", &QuerySpec::new("Genes"));

        backend
            .set(&cache.storage_key(&key), b"not json".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.get(&key).await.is_none());
        assert_eq!(cache.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_backend_errors_degrade() {
        let cache = ResultCache::new(
            Arc::new(BrokenBackend { stall: false }),
            &CacheConfig::memory(),
        );
        let key = fingerprint("u", "r", "Genes", &QuerySpec::new("Genes"));

        cache.put(&key, &sample_result(), None).await;
        assert!(cache.get(&key).await.is_none());
        let stats = cache.stats();
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.writes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_backend_times_out() {
        let cache = ResultCache::new(
            Arc::new(BrokenBackend { stall: true }),
            &CacheConfig::memory(),
        );
        let key = fingerprint("u", "r", "Genes", &QuerySpec::new("Genes"));

        assert!(cache.get(&key).await.is_none());
        cache.put(&key, &sample_result(), None).await;
        assert_eq!(cache.stats().errors, 2);
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let cache = ResultCache::disabled();
        let key = fingerprint("u", "r", "Genes", &QuerySpec::new("Genes"));
        cache.put(&key, &sample_result(), None).await;
        assert!(cache.get(&key).await.is_none());
        assert_eq!(cache.stats().backend, "disabled");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn filters() -> impl Strategy<Value = Vec<(String, String)>> {
            prop::collection::vec(("[A-Za-z_]{1,8}", "[a-z0-9 ]{0,6}"), 0..4)
        }

        proptest! {
            /// Filter insertion order never changes the key.
            #[test]
            fn prop_fingerprint_ignores_filter_order(pairs in filters(), limit in any::<Option<u32>>()) {
                let mut forward = QuerySpec::new("Genes");
                forward.limit = limit.map(u64::from);
                let mut backward = forward.clone();
                for (col, val) in &pairs {
                    forward = forward.with_filter(col.clone(), val.clone());
                }
                for (col, val) in pairs.iter().rev() {
                    if !forward.column_filters.get(col).is_some_and(|v| v == val) {
                        continue;
                    }
                    backward = backward.with_filter(col.clone(), val.clone());
                }
                prop_assert_eq!(
                    fingerprint("u", "r", "Genes", &forward),
                    fingerprint("u", "r", "Genes", &backward)
                );
            }

            /// Different callers never share a key.
            #[test]
            fn prop_fingerprint_scoped_by_caller(a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
                prop_assume!(a != b);
                let spec = QuerySpec::new("Genes");
                let left = fingerprint(&a, "r", "Genes", &spec);
                let right = fingerprint(&b, "r", "Genes", &spec);
                prop_assert_ne!(&left, &right);
                prop_assert_eq!(left.as_str().len(), 64);
            }
        }
    }
}
