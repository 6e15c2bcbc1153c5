//! # Tabular Core
//!
//! Core engine for Tabular: paginated table queries over SQLite resources,
//! a fingerprinted result cache, and a lazily populated materialization cache.
//!
//! Start from [`service::QueryService`]; everything else is a component it
//! composes.

// ── Leaves ───────────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod store;
pub mod query;

// ── Caching ──────────────────────────────────────────────────────────────────

pub mod cache;
pub mod materialize;
pub mod registry;

// ── Orchestration ────────────────────────────────────────────────────────────

pub mod service;
pub mod maintenance;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use config::Config;
pub use error::{Result, TabularError};
pub use query::{QueryRequest, QueryResult, QuerySpec, SortOrder};
pub use service::{CallerId, QueryService};
