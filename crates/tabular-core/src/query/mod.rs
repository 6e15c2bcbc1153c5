//! # Table Queries
//!
//! Paginated, filtered, sorted views over a single table.
//!
//! A request flows through three shapes:
//!
//! - [`QueryRequest`]: what the transport delivers. Loosely typed; `limit`
//!   and `offset` may be numbers or numeric strings.
//! - [`QuerySpec`]: the validated, canonical form. This is what gets
//!   fingerprinted for the result cache and handed to the builder.
//! - [`QueryResult`]: headers, stringified rows, counts, and timings.
//!
//! ## Example
//!
//! ```no_run
//! use tabular_core::query::{QueryExecutor, QuerySpec, SortOrder};
//! use tabular_core::store::SqliteStore;
//!
//! # fn example() -> tabular_core::Result<()> {
//! let store = SqliteStore::open("lims_mirror.db")?;
//! let spec = QuerySpec::new("Genes")
//!     .with_limit(10)
//!     .with_offset(20)
//!     .with_sort("ID", SortOrder::Desc)
//!     .with_filter("Primary_function", "DNA");
//!
//! let result = QueryExecutor::new(&store).execute(&spec)?;
//! println!("{} of {} rows", result.row_count, result.filtered_count);
//! # Ok(())
//! # }
//! ```
//!
//! ## Filtering semantics
//!
//! | Input | Behavior |
//! |-------|----------|
//! | `search_value` | substring match, OR across every column |
//! | `column_filters` | substring match per column, AND across filters |
//! | unknown filter / sort column | ignored |
//! | no sort column | first column ascending |
//!
//! Matching is case-insensitive for ASCII and treats `%` and `_` literally.

/// Compiles a spec into bound SQL.
pub mod builder;
/// Runs compiled queries against a store.
pub mod engine;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use builder::{QueryBuilder, QueryPlan};
pub use engine::QueryExecutor;

use crate::error::{Result, TabularError};

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Ascending (default)
    #[default]
    Asc,
    /// Descending
    Desc,
}

impl SortOrder {
    /// `desc` in any case is descending; anything else is ascending.
    pub fn parse_lenient(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("desc") {
            SortOrder::Desc
        } else {
            SortOrder::Asc
        }
    }

    /// SQL keyword for this direction.
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::Asc => write!(f, "asc"),
            SortOrder::Desc => write!(f, "desc"),
        }
    }
}

/// Validated query specification for one table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Table to read
    pub table_name: String,
    /// Maximum rows to return
    pub limit: Option<u64>,
    /// Rows to skip
    pub offset: Option<u64>,
    /// Column to order by
    pub sort_column: Option<String>,
    /// Direction for `sort_column`
    pub sort_order: SortOrder,
    /// Substring matched against every column
    pub search_value: Option<String>,
    /// Per-column substring filters
    pub column_filters: BTreeMap<String, String>,
}

impl QuerySpec {
    /// Creates an unpaginated, unfiltered spec for `table_name`.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Default::default()
        }
    }

    /// Sets the page size.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the page start.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Orders by `column` in `order`.
    pub fn with_sort(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.sort_column = Some(column.into());
        self.sort_order = order;
        self
    }

    /// Sets the free-text search term.
    pub fn with_search(mut self, term: impl Into<String>) -> Self {
        self.search_value = Some(term.into());
        self
    }

    /// Adds a per-column substring filter.
    pub fn with_filter(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.column_filters.insert(column.into(), value.into());
        self
    }
}

/// Transport-shaped query parameters, before validation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    /// Table to read
    pub table_name: String,
    /// Page size; number or numeric string
    pub limit: Option<serde_json::Value>,
    /// Page start; number or numeric string
    pub offset: Option<serde_json::Value>,
    /// Column to order by
    pub sort_column: Option<String>,
    /// `asc` or `desc`
    pub sort_order: Option<String>,
    /// Free-text search term
    pub search_value: Option<String>,
    /// Per-column substring filters; scalar values of any JSON type
    #[serde(alias = "query_filters")]
    pub column_filters: Option<BTreeMap<String, serde_json::Value>>,
}

impl TryFrom<QueryRequest> for QuerySpec {
    type Error = TabularError;

    fn try_from(req: QueryRequest) -> Result<Self> {
        let table_name = req.table_name.trim().to_string();
        if table_name.is_empty() {
            return Err(TabularError::InvalidQuerySpec(
                "table_name is required".to_string(),
            ));
        }

        Ok(QuerySpec {
            table_name,
            limit: coerce_bound("limit", req.limit.as_ref())?,
            offset: coerce_bound("offset", req.offset.as_ref())?,
            sort_column: req.sort_column.filter(|c| !c.is_empty()),
            sort_order: req
                .sort_order
                .as_deref()
                .map(SortOrder::parse_lenient)
                .unwrap_or_default(),
            search_value: req.search_value.filter(|s| !s.is_empty()),
            column_filters: coerce_filters(req.column_filters.unwrap_or_default())?,
        })
    }
}

/// Stringifies scalar filter values. Nulls drop out; arrays and objects are
/// rejected.
fn coerce_filters(
    raw: BTreeMap<String, serde_json::Value>,
) -> Result<BTreeMap<String, String>> {
    use serde_json::Value;

    let mut filters = BTreeMap::new();
    for (column, value) in raw {
        let value = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(TabularError::InvalidQuerySpec(format!(
                    "filter on {} must be a scalar, got {}",
                    column, other
                )))
            }
        };
        filters.insert(column, value);
    }
    Ok(filters)
}

/// Coerces a pagination bound to a non-negative integer.
fn coerce_bound(name: &str, raw: Option<&serde_json::Value>) -> Result<Option<u64>> {
    use serde_json::Value;

    let invalid = |detail: String| {
        TabularError::InvalidQuerySpec(format!("{} must be a non-negative integer, got {}", name, detail))
    };

    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_u64() {
                Ok(Some(v))
            } else if let Some(f) = n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0) {
                Ok(Some(f as u64))
            } else {
                Err(invalid(n.to_string()))
            }
        }
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| invalid(format!("'{}'", s))),
        Some(other) => Err(invalid(other.to_string())),
    }
}

/// Where a result was served from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    /// Computed against the table store
    #[default]
    Database,
    /// Replayed from the result cache
    Cache,
}

/// Result of one table query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Table the rows came from
    pub table_name: String,
    /// Column names, in row order
    pub headers: Vec<String>,
    /// Stringified rows; NULL is the empty string
    #[serde(rename = "data")]
    pub rows: Vec<Vec<String>>,
    /// Number of rows in `rows`
    pub row_count: usize,
    /// Table row count ignoring filters
    pub total_count: u64,
    /// Row count after filters and search, before pagination
    pub filtered_count: u64,
    /// Time spent in the store
    pub db_query_ms: f64,
    /// Time spent stringifying values
    pub conversion_ms: f64,
    /// End-to-end service time for this response
    pub response_time_ms: f64,
    /// Database or cache
    pub source: ResultSource,
}

impl QueryResult {
    /// Result for a table whose schema could not be resolved.
    pub fn empty(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Default::default()
        }
    }
}

/// A value bound to a `?` placeholder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BoundValue {
    /// Text parameter
    Text(String),
    /// Integer parameter
    Integer(i64),
}

/// Query text plus its bound values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledQuery {
    /// SQL with `?` placeholders
    pub sql: String,
    /// Values for the placeholders, in order
    pub params: Vec<BoundValue>,
}
