//! # Tabular
//!
//! Read-only, paginated table views over SQLite resources, with two caching
//! layers: a fingerprinted result cache (Redis or in-process) and a local
//! materialization cache that mirrors canonical sources on demand.
//!
//! This is the top-level crate; it re-exports `tabular-core` and ships the
//! `tabular` binary.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tabular::{CallerId, Config, QueryService, QuerySpec};
//!
//! # async fn example() -> tabular::Result<()> {
//! let config = Config::from_file(&"tabular.toml".into())?;
//! let service = QueryService::from_config(&config)?;
//!
//! let caller = CallerId::resolve(Some("alice"));
//! let page = service
//!     .query(&caller, "76990/7/2", QuerySpec::new("Genes").with_limit(50))
//!     .await?;
//! println!("{} / {} rows", page.row_count, page.filtered_count);
//! # Ok(())
//! # }
//! ```

// ── Re-exports from tabular-core ─────────────────────────────────────────────

pub use tabular_core::cache;
pub use tabular_core::config;
pub use tabular_core::error;
pub use tabular_core::maintenance;
pub use tabular_core::materialize;
pub use tabular_core::query;
pub use tabular_core::registry;
pub use tabular_core::service;
pub use tabular_core::store;

pub use tabular_core::{
    CallerId, Config, QueryRequest, QueryResult, QueryService, QuerySpec, Result, SortOrder,
    TabularError,
};
