//! Query Service
//!
//! Composition root for one logical request:
//!
//! ```text
//! caller ─► result cache ──hit──────────────────────────────► caller
//!                │ miss
//!                ▼
//!        materialization cache ─► SqliteStore (validate, index)
//!                                     │
//!                              QueryExecutor (build, run)
//!                                     │
//!                          result cache (write) ─► caller
//! ```
//!
//! Store work runs on tokio's blocking pool. A per-query timeout, or the
//! caller dropping the future, interrupts the running SQLite statement.
//! Supporting indices and result-cache writes happen in detached tasks after
//! the response is assembled, so neither counts against the request.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use rusqlite::InterruptHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::cache::{fingerprint, CacheStats, ResultCache};
use crate::config::{Config, QueryConfig};
use crate::error::{Result, TabularError};
use crate::materialize::{
    EvictionReport, Lease, MaterializationCache, MaterializationStats, MaterializedResource,
};
use crate::query::{engine::elapsed_ms, QueryExecutor, QueryRequest, QueryResult, QuerySpec, ResultSource};
use crate::registry::{ResourceInfo, ResourceInventory, ResourceRegistry};
use crate::store::{SqliteStore, TableStore};

/// Caller id used when the transport supplies none.
pub const UNKNOWN_CALLER: &str = "unknown_user";

/// Crate version reported by [`QueryService::status`].
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity of the caller a request is made on behalf of.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerId(String);

impl CallerId {
    /// Resolve a transport-supplied identity, falling back to
    /// [`UNKNOWN_CALLER`] when absent or blank.
    pub fn resolve(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(id) if !id.is_empty() => CallerId(id.to_string()),
            _ => CallerId(UNKNOWN_CALLER.to_string()),
        }
    }

    /// The identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Row count of one table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    /// Table name
    pub name: String,
    /// Rows in the table
    pub row_count: u64,
}

/// Health and counters for the running service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Always `OK` while the service can answer
    pub state: String,
    /// Crate version
    pub version: String,
    /// When the service was constructed
    pub started_at: DateTime<Utc>,
    /// Seconds since `started_at`
    pub uptime_secs: i64,
    /// Registered resources
    pub resources: usize,
    /// Result cache counters
    pub cache: CacheStats,
    /// Materialization counters
    pub materialization: MaterializationStats,
}

/// Interrupts a SQLite statement when dropped, unless disarmed.
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            debug!("Interrupting in-flight query");
            handle.interrupt();
        }
    }
}

/// Counts detached tasks so callers can wait for them to drain.
#[derive(Default)]
struct BackgroundWork {
    pending: AtomicUsize,
    idle: Notify,
}

impl BackgroundWork {
    fn begin(self: &Arc<Self>) -> WorkGuard {
        self.pending.fetch_add(1, Ordering::AcqRel);
        WorkGuard(self.clone())
    }
}

/// Marks one detached task as finished when dropped.
struct WorkGuard(Arc<BackgroundWork>);

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Columns a query's ordering and filters would use; `None` stands for the
/// table's default-order column.
fn index_candidates(spec: &QuerySpec) -> Vec<Option<String>> {
    let mut candidates = vec![None];
    candidates.extend(spec.sort_column.clone().map(Some));
    candidates.extend(
        spec.column_filters
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(column, _)| Some(column.clone())),
    );
    candidates
}

fn join_error(e: tokio::task::JoinError) -> TabularError {
    TabularError::QueryExecution(format!("query task failed: {}", e))
}

/// Serves table listings and queries over materialized resources.
pub struct QueryService {
    materializer: Arc<MaterializationCache>,
    cache: Arc<ResultCache>,
    inventory: Arc<dyn ResourceInventory>,
    query_timeout: Duration,
    index_on_read: bool,
    /// (local copy, table, column) triples already handed to an indexing task
    indexed: Arc<DashSet<(PathBuf, String, Option<String>)>>,
    background: Arc<BackgroundWork>,
    started_at: DateTime<Utc>,
}

impl QueryService {
    /// Assemble a service from its parts.
    pub fn new(
        materializer: Arc<MaterializationCache>,
        cache: Arc<ResultCache>,
        inventory: Arc<dyn ResourceInventory>,
        query: &QueryConfig,
    ) -> Self {
        Self {
            materializer,
            cache,
            inventory,
            query_timeout: query.timeout(),
            index_on_read: query.index_on_read,
            indexed: Arc::new(DashSet::new()),
            background: Arc::new(BackgroundWork::default()),
            started_at: Utc::now(),
        }
    }

    /// Build every component from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = Arc::new(ResourceRegistry::from_config(config));
        let materializer = Arc::new(MaterializationCache::from_config(
            &config.materialization,
            registry.clone(),
        ));
        let cache = Arc::new(ResultCache::from_config(&config.cache)?);

        info!(
            "Query service ready: {} resources, {} cache, materialization root {}",
            registry.resources().len(),
            cache.stats().backend,
            materializer.root().display()
        );
        Ok(Self::new(materializer, cache, registry, &config.query))
    }

    /// Materialization cache.
    pub fn materializer(&self) -> &Arc<MaterializationCache> {
        &self.materializer
    }

    /// Result cache.
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Resources known to the inventory.
    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        self.inventory.resources()
    }

    /// Table names for a resource.
    ///
    /// Uses the inventory's list when it has one; otherwise materializes the
    /// resource and reads its catalog.
    pub async fn list_tables(&self, caller: &CallerId, resource_id: &str) -> Result<Vec<String>> {
        if let Some(tables) = self.inventory.tables(resource_id) {
            debug!("Using inventory table list for {}", resource_id);
            return Ok(tables);
        }

        let resource = self.materializer.resolve(caller.as_str(), resource_id).await?;
        tokio::task::spawn_blocking(move || {
            let store = SqliteStore::open(&resource.local_path)?;
            store.list_tables()
        })
        .await
        .map_err(join_error)?
    }

    /// Validate a transport request and run it.
    pub async fn query_request(
        &self,
        caller: &CallerId,
        resource_id: &str,
        request: QueryRequest,
    ) -> Result<QueryResult> {
        let spec = QuerySpec::try_from(request)?;
        self.query(caller, resource_id, spec).await
    }

    /// Run one query, serving from the result cache when possible.
    pub async fn query(
        &self,
        caller: &CallerId,
        resource_id: &str,
        spec: QuerySpec,
    ) -> Result<QueryResult> {
        let start = Instant::now();
        if spec.table_name.trim().is_empty() {
            return Err(TabularError::InvalidQuerySpec(
                "table_name is required".to_string(),
            ));
        }

        let key = fingerprint(caller.as_str(), resource_id, &spec.table_name, &spec);
        if let Some(mut hit) = self.cache.get(&key).await {
            hit.response_time_ms = elapsed_ms(start);
            hit.source = ResultSource::Cache;
            info!(
                "Served {} rows of {} for {} from cache in {:.2}ms",
                hit.row_count,
                spec.table_name,
                caller.as_str(),
                hit.response_time_ms
            );
            return Ok(hit);
        }

        let resource = self.materializer.resolve(caller.as_str(), resource_id).await?;
        if resource.transferred {
            let path = resource.local_path.clone();
            self.indexed.retain(|(copy, _, _)| copy != &path);
        }
        let indexing = self.index_on_read.then(|| {
            (
                resource.local_path.clone(),
                resource.lease().clone(),
                spec.table_name.clone(),
                index_candidates(&spec),
            )
        });

        let mut result = self.execute(resource, spec).await?;
        result.response_time_ms = elapsed_ms(start);
        result.source = ResultSource::Database;

        info!(
            "Served {} of {} rows of {} for {} in {:.2}ms (db {:.2}ms, convert {:.2}ms)",
            result.row_count,
            result.filtered_count,
            result.table_name,
            caller.as_str(),
            result.response_time_ms,
            result.db_query_ms,
            result.conversion_ms
        );

        if let Some((path, lease, table, candidates)) = indexing {
            self.schedule_indexing(path, lease, table, candidates);
        }
        let cache = self.cache.clone();
        let cached = result.clone();
        let work = self.background.begin();
        tokio::spawn(async move {
            let _work = work;
            cache.put(&key, &cached, None).await;
        });
        Ok(result)
    }

    /// Wait until every detached cache write and index build has finished.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.background.idle.notified();
            if self.background.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Build supporting indices for `table` on a local copy in the
    /// background. Each (copy, table, column) is attempted once per
    /// materialization; a failed attempt is forgotten so a later query retries.
    fn schedule_indexing(
        &self,
        path: PathBuf,
        lease: Lease,
        table: String,
        candidates: Vec<Option<String>>,
    ) {
        let fresh: Vec<Option<String>> = candidates
            .into_iter()
            .filter(|column| {
                self.indexed
                    .insert((path.clone(), table.clone(), column.clone()))
            })
            .collect();
        if fresh.is_empty() {
            return;
        }

        let indexed = self.indexed.clone();
        let work = self.background.begin();
        tokio::task::spawn_blocking(move || {
            let _work = work;
            let _lease = lease;
            let columns: Vec<String> = fresh.iter().flatten().cloned().collect();
            let ensured = match SqliteStore::open(&path) {
                Ok(store) => store.ensure_supporting_indices(&table, &columns),
                Err(e) => {
                    warn!("Skipping indices for {}: {}", table, e);
                    0
                }
            };
            if ensured == 0 {
                for column in fresh {
                    indexed.remove(&(path.clone(), table.clone(), column));
                }
            }
        });
    }

    async fn execute(&self, resource: MaterializedResource, spec: QuerySpec) -> Result<QueryResult> {
        let path = resource.local_path.clone();
        let store = tokio::task::spawn_blocking(move || SqliteStore::open(path))
            .await
            .map_err(join_error)??;
        let interrupt = InterruptOnDrop(Some(store.interrupt_handle()));

        // The lease moves into the task so the entry outlives a timed-out query.
        let task = tokio::task::spawn_blocking(move || {
            let _lease = resource;
            let table = spec.table_name.as_str();
            if !store.validate_table_exists(table)? {
                return Err(TabularError::TableNotFound {
                    table: table.to_string(),
                    available: store.list_tables()?,
                });
            }
            QueryExecutor::new(&store).execute(&spec)
        });

        match tokio::time::timeout(self.query_timeout, task).await {
            Ok(joined) => {
                interrupt.disarm();
                joined.map_err(join_error)?
            }
            Err(_) => {
                warn!("Query exceeded {:?}; interrupting", self.query_timeout);
                drop(interrupt);
                Err(TabularError::QueryExecution(format!(
                    "query timed out after {:?}",
                    self.query_timeout
                )))
            }
        }
    }

    /// Row counts for every table of a resource.
    pub async fn table_summary(
        &self,
        caller: &CallerId,
        resource_id: &str,
    ) -> Result<Vec<TableSummary>> {
        let resource = self.materializer.resolve(caller.as_str(), resource_id).await?;
        tokio::task::spawn_blocking(move || {
            let store = SqliteStore::open(&resource.local_path)?;
            store
                .list_tables()?
                .into_iter()
                .map(|name| {
                    let row_count = store.row_count(&name)?;
                    Ok(TableSummary { name, row_count })
                })
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(join_error)?
    }

    /// Evict materialized entries untouched for longer than `retention`.
    pub async fn maintenance_sweep(&self, retention: Duration) -> EvictionReport {
        let materializer = self.materializer.clone();
        match tokio::task::spawn_blocking(move || materializer.evict_stale(retention)).await {
            Ok(report) => report,
            Err(e) => {
                error!("Eviction sweep panicked: {}", e);
                EvictionReport::default()
            }
        }
    }

    /// Current health and counters.
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            state: "OK".to_string(),
            version: VERSION.to_string(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            resources: self.inventory.resources().len(),
            cache: self.cache.stats(),
            materialization: self.materializer.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_resolution() {
        assert_eq!(CallerId::resolve(Some("alice")).as_str(), "alice");
        assert_eq!(CallerId::resolve(Some("  bob ")).as_str(), "bob");
        assert_eq!(CallerId::resolve(Some("")).as_str(), UNKNOWN_CALLER);
        assert_eq!(CallerId::resolve(None).as_str(), UNKNOWN_CALLER);
    }

    #[test]
    fn test_index_candidates() {
        let spec = QuerySpec::new("Genes")
            .with_sort("Length", crate::query::SortOrder::Desc)
            .with_filter("Primary_function", "DNA")
            .with_filter("ID", "");
        assert_eq!(
            index_candidates(&spec),
            vec![
                None,
                Some("Length".to_string()),
                Some("Primary_function".to_string())
            ]
        );
    }

    #[test]
    fn test_interrupt_guard_stops_running_statement() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("spin.db");
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER);")
            .unwrap();

        let store = SqliteStore::open(&path).unwrap();
        let guard = InterruptOnDrop(Some(store.interrupt_handle()));
        let backstop = store.interrupt_handle();

        let runner = std::thread::spawn(move || {
            let spin = crate::query::CompiledQuery {
                sql: "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                      SELECT COUNT(*) FROM c"
                    .to_string(),
                params: vec![],
            };
            store.count(&spin)
        });

        std::thread::sleep(Duration::from_millis(100));
        drop(guard);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !runner.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if !runner.is_finished() {
            backstop.interrupt();
            panic!("dropping the guard did not interrupt the statement");
        }
        let outcome = runner.join().unwrap();
        assert!(matches!(outcome, Err(TabularError::QueryExecution(_))));
    }

    #[test]
    fn test_interrupt_guard_disarm() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let guard = InterruptOnDrop(Some(conn.get_interrupt_handle()));
        guard.disarm();
        // A disarmed guard must leave the connection usable.
        let one: i64 = conn.query_row("SELECT 1", [], |r| r.get(0)).unwrap();
        assert_eq!(one, 1);
    }
}
