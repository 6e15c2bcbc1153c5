//! Query execution against a [`TableStore`].

use std::time::Instant;

use tracing::debug;

use super::{QueryBuilder, QueryResult, QuerySpec, ResultSource};
use crate::error::Result;
use crate::store::{CellValue, TableStore};

/// Runs a [`QuerySpec`] against one store and assembles the result.
///
/// `response_time_ms` is left at zero; the caller owns the end-to-end clock.
pub struct QueryExecutor<'a, S: TableStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: TableStore + ?Sized> QueryExecutor<'a, S> {
    /// Create an executor over `store`.
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Execute `spec`.
    ///
    /// A table with no resolvable columns yields an empty result rather than
    /// an error.
    pub fn execute(&self, spec: &QuerySpec) -> Result<QueryResult> {
        let table = spec.table_name.as_str();
        let columns = self.store.columns(table)?;
        if columns.is_empty() {
            debug!("No columns resolved for {}, returning empty result", table);
            return Ok(QueryResult::empty(table));
        }

        let plan = QueryBuilder::new(table, &columns).build(spec)?;

        let query_start = Instant::now();
        let total_count = self.store.row_count(table)?;
        let filtered_count = if plan.filtered {
            self.store.count(&plan.count)?
        } else {
            total_count
        };
        let raw = self.store.execute(&plan.data)?;
        let db_query_ms = elapsed_ms(query_start);

        let convert_start = Instant::now();
        let rows: Vec<Vec<String>> = raw
            .into_iter()
            .map(|row| row.into_iter().map(CellValue::into_display_string).collect())
            .collect();
        let conversion_ms = elapsed_ms(convert_start);

        debug!(
            "Table {}: {} rows of {} filtered / {} total (db {:.2}ms, convert {:.2}ms)",
            table,
            rows.len(),
            filtered_count,
            total_count,
            db_query_ms,
            conversion_ms
        );

        Ok(QueryResult {
            table_name: table.to_string(),
            headers: columns,
            row_count: rows.len(),
            rows,
            total_count,
            filtered_count,
            db_query_ms,
            conversion_ms,
            response_time_ms: 0.0,
            source: ResultSource::Database,
        })
    }
}

/// Milliseconds since `start`, as a float.
pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
