//! Query Service Integration Tests
//!
//! Exercises the full request path: result cache, materialization, store,
//! and executor, using the in-process cache backend and temp directories.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use common::{age, build_fixture, DNA_GENE_COUNT, GENE_COUNT};
use tabular_core::cache::{CacheBackend, CacheError, MemoryBackend, ResultCache};
use tabular_core::config::{CacheConfig, Config, QueryConfig, ResourceConfig};
use tabular_core::materialize::{entry_name, CopyTransfer, MaterializationCache};
use tabular_core::query::{QueryRequest, QuerySpec, ResultSource, SortOrder};
use tabular_core::registry::{ResourceInfo, ResourceLocation, ResourceRegistry};
use tabular_core::{CallerId, QueryService, TabularError};

const RESOURCE: &str = "76990/7/2";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    service: QueryService,
}

fn setup() -> Harness {
    setup_with(|registry, _| registry)
}

fn setup_with(
    customize: impl FnOnce(ResourceRegistry, &PathBuf) -> ResourceRegistry,
) -> Harness {
    setup_with_query(QueryConfig::default(), customize)
}

fn setup_with_query(
    query: QueryConfig,
    customize: impl FnOnce(ResourceRegistry, &PathBuf) -> ResourceRegistry,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let source = build_fixture(dir.path());
    let root = dir.path().join("materialized");

    let registry = ResourceRegistry::new(Some(source.clone())).with_file(RESOURCE, &source);
    let registry = Arc::new(customize(registry, &source));

    let materializer = Arc::new(MaterializationCache::new(
        &root,
        registry.clone(),
        Arc::new(CopyTransfer),
    ));
    let cache = Arc::new(ResultCache::new(
        Arc::new(MemoryBackend::new()),
        &CacheConfig::memory(),
    ));

    let service = QueryService::new(materializer, cache, registry, &query);
    Harness {
        _dir: dir,
        root,
        service,
    }
}

fn alice() -> CallerId {
    CallerId::resolve(Some("alice"))
}

impl Harness {
    fn entry_dir(&self, caller: &str, resource: &str) -> PathBuf {
        self.root.join(entry_name(caller, resource))
    }
}

// ---------------------------------------------------------------------------
// Query path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_query_then_cache_hit() {
    let h = setup();
    let spec = QuerySpec::new("Genes").with_limit(10).with_offset(0);

    let first = h.service.query(&alice(), RESOURCE, spec.clone()).await.unwrap();
    assert_eq!(first.source, ResultSource::Database);
    assert_eq!(first.row_count, 10);
    assert_eq!(first.total_count, GENE_COUNT);
    assert!(first.response_time_ms > 0.0);
    h.service.wait_idle().await;

    let second = h.service.query(&alice(), RESOURCE, spec).await.unwrap();
    assert_eq!(second.source, ResultSource::Cache);
    assert_eq!(second.rows, first.rows);
    assert_eq!(second.headers, first.headers);
    assert_eq!(second.total_count, first.total_count);
    assert_eq!(second.db_query_ms, first.db_query_ms);

    let stats = h.service.cache().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.writes, 1);
}

#[tokio::test]
async fn test_cache_is_scoped_per_caller() {
    let h = setup();
    let spec = QuerySpec::new("Genes").with_limit(5);

    h.service.query(&alice(), RESOURCE, spec.clone()).await.unwrap();
    let bob = CallerId::resolve(Some("bob"));
    let result = h.service.query(&bob, RESOURCE, spec).await.unwrap();
    assert_eq!(result.source, ResultSource::Database);
    assert_eq!(h.service.materializer().stats().transfers, 2);
}

#[tokio::test]
async fn test_query_materializes_once() {
    let h = setup();
    for offset in [0, 10, 20] {
        let spec = QuerySpec::new("Genes").with_limit(10).with_offset(offset);
        h.service.query(&alice(), RESOURCE, spec).await.unwrap();
    }
    h.service.wait_idle().await;
    let stats = h.service.materializer().stats();
    assert_eq!(stats.transfers, 1);
    assert_eq!(stats.local_hits, 2);
    assert_eq!(stats.active_leases, 0);
    assert!(h.entry_dir("alice", RESOURCE).join("source.db").is_file());
}

#[tokio::test]
async fn test_query_request_coerces_strings() {
    let h = setup();
    let request: QueryRequest = serde_json::from_value(json!({
        "table_name": "Genes",
        "limit": "25",
        "offset": "100",
        "sort_order": "DESC",
        "sort_column": "ID",
        "query_filters": {"Primary_function": "DNA"}
    }))
    .unwrap();

    let result = h
        .service
        .query_request(&alice(), RESOURCE, request)
        .await
        .unwrap();
    assert_eq!(result.row_count, 25);
    assert_eq!(result.filtered_count, DNA_GENE_COUNT);
}

#[tokio::test]
async fn test_query_request_rejects_negative_limit() {
    let h = setup();
    let request: QueryRequest =
        serde_json::from_value(json!({"table_name": "Genes", "limit": -5})).unwrap();
    let err = h
        .service
        .query_request(&alice(), RESOURCE, request)
        .await
        .unwrap_err();
    assert!(matches!(err, TabularError::InvalidQuerySpec(_)));
    assert_eq!(h.service.materializer().stats().transfers, 0);
}

#[tokio::test]
async fn test_empty_table_name_rejected() {
    let h = setup();
    let err = h
        .service
        .query(&alice(), RESOURCE, QuerySpec::new(""))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_QUERY");
}

#[tokio::test]
async fn test_table_not_found_lists_available() {
    let h = setup();
    let err = h
        .service
        .query(&alice(), RESOURCE, QuerySpec::new("Nope"))
        .await
        .unwrap_err();
    match err {
        TabularError::TableNotFound { table, available } => {
            assert_eq!(table, "Nope");
            assert_eq!(available, vec!["Empty_Table", "Genes", "Genomes"]);
        }
        other => panic!("expected TableNotFound, got {}", other),
    }
}

fn count_indices(path: &PathBuf) -> i64 {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND tbl_name = 'Genes'",
        [],
        |row| row.get(0),
    )
    .unwrap()
}

#[tokio::test]
async fn test_query_builds_indices_on_local_copy_only() {
    let h = setup();
    h.service
        .query(&alice(), RESOURCE, QuerySpec::new("Genes").with_limit(1))
        .await
        .unwrap();
    h.service.wait_idle().await;

    // Only the default-order column for an unsorted, unfiltered query.
    let local = h.entry_dir("alice", RESOURCE).join("source.db");
    assert_eq!(count_indices(&local), 1);
    let canonical = h.root.parent().unwrap().join("pangenome.db");
    assert_eq!(count_indices(&canonical), 0);
}

#[tokio::test]
async fn test_indices_follow_sort_and_filter_columns() {
    let h = setup();
    let spec = QuerySpec::new("Genes")
        .with_limit(5)
        .with_sort("Length", SortOrder::Desc)
        .with_filter("Primary_function", "DNA")
        .with_filter("Bogus", "x");
    h.service.query(&alice(), RESOURCE, spec).await.unwrap();
    h.service.wait_idle().await;

    let local = h.entry_dir("alice", RESOURCE).join("source.db");
    assert_eq!(count_indices(&local), 3);

    // A repeat with the same columns schedules nothing new.
    let again = QuerySpec::new("Genes")
        .with_limit(5)
        .with_offset(5)
        .with_sort("Length", SortOrder::Asc);
    h.service.query(&alice(), RESOURCE, again).await.unwrap();
    h.service.wait_idle().await;
    assert_eq!(count_indices(&local), 3);
}

#[tokio::test]
async fn test_index_on_read_disabled() {
    let h = setup_with_query(
        QueryConfig {
            index_on_read: false,
            ..QueryConfig::default()
        },
        |registry, _| registry,
    );
    h.service
        .query(&alice(), RESOURCE, QuerySpec::new("Genes").with_limit(1))
        .await
        .unwrap();
    h.service.wait_idle().await;
    assert_eq!(count_indices(&h.entry_dir("alice", RESOURCE).join("source.db")), 0);
}

#[tokio::test]
async fn test_similar_resource_ids_stay_separate() {
    let h = setup_with(|mut registry, source| {
        let copy = source.with_file_name("other.db");
        std::fs::copy(source, &copy).unwrap();
        let conn = rusqlite::Connection::open(&copy).unwrap();
        conn.execute("DELETE FROM Genomes WHERE rowid > 1", []).unwrap();
        registry.register(ResourceInfo {
            id: "76990_7_2".to_string(),
            description: None,
            tables: None,
            source: ResourceLocation::File(copy),
        });
        registry
    });

    let slash = h
        .service
        .query(&alice(), RESOURCE, QuerySpec::new("Genomes"))
        .await
        .unwrap();
    let underscore = h
        .service
        .query(&alice(), "76990_7_2", QuerySpec::new("Genomes"))
        .await
        .unwrap();
    assert_eq!(slash.row_count, 3);
    assert_eq!(underscore.row_count, 1);
    assert_eq!(underscore.source, ResultSource::Database);
    assert_eq!(h.service.materializer().stats().transfers, 2);
}

#[tokio::test]
async fn test_bundled_resource_for_empty_id() {
    let h = setup();
    let caller = CallerId::resolve(None);
    let result = h
        .service
        .query(&caller, "", QuerySpec::new("Genomes"))
        .await
        .unwrap();
    assert_eq!(result.row_count, 3);
    assert!(h.entry_dir("unknown_user", "").is_dir());
}

#[tokio::test]
async fn test_remote_resource_not_provisioned() {
    let h = setup_with(|mut registry, _| {
        registry.register(ResourceInfo {
            id: "remote/1/1".to_string(),
            description: None,
            tables: None,
            source: ResourceLocation::Remote("https://example.org/blob/1".to_string()),
        });
        registry
    });
    let err = h
        .service
        .query(&alice(), "remote/1/1", QuerySpec::new("Genes"))
        .await
        .unwrap_err();
    assert!(matches!(err, TabularError::ResourceNotProvisioned(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_cache_hit_survives_eviction() {
    let h = setup();
    let spec = QuerySpec::new("Genes").with_limit(3);
    h.service.query(&alice(), RESOURCE, spec.clone()).await.unwrap();
    h.service.wait_idle().await;

    let entry = h.entry_dir("alice", RESOURCE);
    age(&entry, Duration::from_secs(7200));
    let report = h.service.maintenance_sweep(Duration::from_secs(3600)).await;
    assert_eq!(report.removed, 1);
    assert!(!entry.exists());

    let replay = h.service.query(&alice(), RESOURCE, spec).await.unwrap();
    assert_eq!(replay.source, ResultSource::Cache);
    assert_eq!(h.service.materializer().stats().transfers, 1);
}

/// Backend whose writes take far longer than any request should.
struct SlowWrites;

#[async_trait::async_trait]
impl CacheBackend for SlowWrites {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

#[tokio::test]
async fn test_cache_write_does_not_delay_response() {
    let dir = TempDir::new().unwrap();
    let source = build_fixture(dir.path());
    let registry = Arc::new(ResourceRegistry::new(None).with_file(RESOURCE, &source));
    let materializer = Arc::new(MaterializationCache::new(
        dir.path().join("materialized"),
        registry.clone(),
        Arc::new(CopyTransfer),
    ));
    let mut cache_config = CacheConfig::memory();
    cache_config.timeout_ms = 60_000;
    let cache = Arc::new(ResultCache::new(Arc::new(SlowWrites), &cache_config));
    let service = QueryService::new(materializer, cache, registry, &QueryConfig::default());

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        service.query(&alice(), RESOURCE, QuerySpec::new("Genomes")),
    )
    .await
    .expect("response waited on the cache write")
    .unwrap();
    assert_eq!(result.row_count, 3);
}

// ---------------------------------------------------------------------------
// Listing, summary, status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_list_tables_from_store() {
    let h = setup();
    let tables = h.service.list_tables(&alice(), RESOURCE).await.unwrap();
    assert_eq!(tables, vec!["Empty_Table", "Genes", "Genomes"]);
}

#[tokio::test]
async fn test_list_tables_prefers_inventory() {
    let h = setup_with(|mut registry, source| {
        registry.register(ResourceInfo {
            id: "listed".to_string(),
            description: Some("inventory-listed".to_string()),
            tables: Some(vec!["Genes".to_string()]),
            source: ResourceLocation::File(source.clone()),
        });
        registry
    });
    let tables = h.service.list_tables(&alice(), "listed").await.unwrap();
    assert_eq!(tables, vec!["Genes"]);
    assert_eq!(h.service.materializer().stats().transfers, 0);
}

#[tokio::test]
async fn test_table_summary() {
    let h = setup();
    let summary = h.service.table_summary(&alice(), RESOURCE).await.unwrap();
    let counts: Vec<(String, u64)> = summary.into_iter().map(|s| (s.name, s.row_count)).collect();
    assert_eq!(
        counts,
        vec![
            ("Empty_Table".to_string(), 0),
            ("Genes".to_string(), GENE_COUNT),
            ("Genomes".to_string(), 3),
        ]
    );
}

#[tokio::test]
async fn test_status() {
    let h = setup();
    h.service
        .query(&alice(), RESOURCE, QuerySpec::new("Genomes"))
        .await
        .unwrap();

    let status = h.service.status();
    assert_eq!(status.state, "OK");
    assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
    assert_eq!(status.resources, 1);
    assert_eq!(status.cache.backend, "memory");
    assert_eq!(status.materialization.transfers, 1);
    assert!(status.uptime_secs >= 0);
}

#[tokio::test]
async fn test_from_config() {
    let dir = TempDir::new().unwrap();
    let source = build_fixture(dir.path());

    let mut config = Config::default();
    config.cache = CacheConfig::memory();
    config.materialization.root = dir.path().join("mat");
    config.resources.push(ResourceConfig {
        id: RESOURCE.to_string(),
        path: Some(source),
        description: Some("fixture".to_string()),
        ..Default::default()
    });
    config.validate().unwrap();

    let service = QueryService::from_config(&config).unwrap();
    let listed = service.list_resources();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].description.as_deref(), Some("fixture"));

    let result = service
        .query(&alice(), RESOURCE, QuerySpec::new("Genes").with_limit(2))
        .await
        .unwrap();
    assert_eq!(result.row_count, 2);
}
