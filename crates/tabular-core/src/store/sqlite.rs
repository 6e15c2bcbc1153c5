//! SQLite-backed table store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, InterruptHandle, OpenFlags, ToSql};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{quote_ident, CellValue, RawRow, TableStore, MAX_INDEXED_COLUMNS, RESERVED_TABLE_PREFIX};
use crate::error::{Result, TabularError};
use crate::query::{BoundValue, CompiledQuery};

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl ToSql for BoundValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            BoundValue::Text(s) => Ok(ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes()))),
            BoundValue::Integer(n) => Ok(ToSqlOutput::Borrowed(ValueRef::Integer(*n))),
        }
    }
}

impl From<ValueRef<'_>> for CellValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => CellValue::Null,
            ValueRef::Integer(n) => CellValue::Integer(n),
            ValueRef::Real(f) => CellValue::Real(f),
            ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => CellValue::Blob(b.to_vec()),
        }
    }
}

/// A table store over one SQLite database file.
///
/// Opening never creates a missing file. The connection is read-write so
/// supporting indices can be added to a local working copy.
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteStore {
    /// Open the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(TabularError::store_unavailable(&path, "no such file"));
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&path, flags)
            .map_err(|e| TabularError::store_unavailable(&path, e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| TabularError::store_unavailable(&path, e))?;

        Ok(Self { conn, path })
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handle that aborts the statement currently running on this store.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.conn.get_interrupt_handle()
    }
}

/// Index name for one (table, column) pair.
///
/// Hashed so that no two pairs collide however their names are split.
fn index_name(table: &str, column: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(table.as_bytes());
    hasher.update([0u8]);
    hasher.update(column.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("tabular_idx_{}", &digest[..16])
}

impl TableStore for SqliteStore {
    fn list_tables(&self) -> Result<Vec<String>> {
        let pattern = format!("{}%", RESERVED_TABLE_PREFIX);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE ?1 \
                 ORDER BY name",
            )
            .map_err(|e| TabularError::store_unavailable(&self.path, e))?;
        let tables = stmt
            .query_map([pattern], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| TabularError::store_unavailable(&self.path, e))?;

        debug!("Found {} tables in {}", tables.len(), self.path.display());
        Ok(tables)
    }

    fn columns(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
        let columns = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }

    fn row_count(&self, table: &str) -> Result<u64> {
        let available = self.list_tables()?;
        if !available.iter().any(|t| t == table) {
            return Err(TabularError::TableNotFound {
                table: table.to_string(),
                available,
            });
        }

        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn ensure_supporting_indices(&self, table: &str, columns: &[String]) -> usize {
        let available = match self.columns(table) {
            Ok(available) => available,
            Err(e) => {
                warn!("Failed to resolve columns for indexing {}: {}", table, e);
                return 0;
            }
        };
        let Some(default_column) = available.first() else {
            return 0;
        };

        let mut wanted = vec![default_column];
        for column in columns {
            if available.contains(column) && !wanted.contains(&column) {
                wanted.push(column);
            }
        }

        let mut ensured = 0;
        for column in wanted.into_iter().take(MAX_INDEXED_COLUMNS) {
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&index_name(table, column)),
                quote_ident(table),
                quote_ident(column)
            );
            match self.conn.execute(&sql, []) {
                Ok(_) => ensured += 1,
                Err(e) => warn!(
                    "Failed to ensure index on {}.{} in {}: {}",
                    table,
                    column,
                    self.path.display(),
                    e
                ),
            }
        }
        debug!("Ensured {} indices on {}", ensured, table);
        ensured
    }

    fn execute(&self, query: &CompiledQuery) -> Result<Vec<RawRow>> {
        let mut stmt = self.conn.prepare(&query.sql)?;
        let width = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(query.params.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(CellValue::from(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    fn count(&self, query: &CompiledQuery) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &query.sql,
            params_from_iter(query.params.iter()),
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}
