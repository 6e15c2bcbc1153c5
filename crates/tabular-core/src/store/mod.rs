//! Table Store Accessor
//!
//! A narrow capability interface over a row-oriented table store: list
//! tables, resolve columns, count rows, and execute compiled queries. No
//! caching and no business logic live here.
//!
//! [`SqliteStore`] is the production implementation. Stores are blocking; the
//! service runs them on tokio's blocking pool.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::query::CompiledQuery;

/// Table-name prefix reserved for store-internal tables.
pub const RESERVED_TABLE_PREFIX: &str = "sqlite_";

/// Maximum number of columns that receive a supporting index per call.
pub const MAX_INDEXED_COLUMNS: usize = 8;

/// One raw cell as returned by the store, before stringification.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    /// SQL NULL
    Null,
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit floating point
    Real(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Blob(Vec<u8>),
}

impl CellValue {
    /// Renders the cell the way result rows carry it: NULL becomes an empty
    /// string, reals always keep a fractional part.
    pub fn into_display_string(self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Integer(n) => n.to_string(),
            CellValue::Real(f) => {
                if f.is_finite() && f.fract() == 0.0 {
                    format!("{:.1}", f)
                } else {
                    f.to_string()
                }
            }
            CellValue::Text(s) => s,
            CellValue::Blob(b) => String::from_utf8_lossy(&b).into_owned(),
        }
    }
}

/// A raw result row.
pub type RawRow = Vec<CellValue>;

/// Capability interface over a backing table store.
pub trait TableStore {
    /// User tables ordered by name, excluding [`RESERVED_TABLE_PREFIX`] tables.
    fn list_tables(&self) -> Result<Vec<String>>;

    /// Ordered column names; empty when the table does not exist.
    fn columns(&self, table: &str) -> Result<Vec<String>>;

    /// Total row count; `TableNotFound` when the table does not exist.
    fn row_count(&self, table: &str) -> Result<u64>;

    /// Whether `table` is one of [`TableStore::list_tables`].
    fn validate_table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.list_tables()?.iter().any(|t| t == table))
    }

    /// Best-effort, idempotent creation of the indices the query builder's
    /// ordering and filters rely on: the table's first column plus those of
    /// `columns` that exist, capped at [`MAX_INDEXED_COLUMNS`]. Never fails;
    /// returns how many indices are now in place.
    fn ensure_supporting_indices(&self, table: &str, columns: &[String]) -> usize;

    /// Runs a data query.
    fn execute(&self, query: &CompiledQuery) -> Result<Vec<RawRow>>;

    /// Runs a single-value `COUNT(*)` query.
    fn count(&self, query: &CompiledQuery) -> Result<u64>;
}

/// Quotes an identifier for interpolation into query text.
///
/// Callers must only pass names already validated against the store's own
/// table or column list.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
