//! # Materialization Cache
//!
//! Keeps a local, queryable working copy of each resource a caller touches.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//! ├── alice.76990_7_2-<hash>/   # one entry per (caller, resource)
//! │   └── source.db
//! ├── .staging-alice.x-<uuid>/  # transfer in progress
//! └── .trash-bob.y-<uuid>/      # evicted, being deleted
//! ```
//!
//! Entries are populated lazily: the first [`resolve`](MaterializationCache::resolve)
//! transfers the canonical source into a staging directory and renames it
//! into place, so a half-written copy is never visible under the entry name.
//! A directory's mtime is its last access time; hits touch it.
//!
//! ## Concurrency
//!
//! - One async gate per entry gives single-flight population without a
//!   global lock. Followers wait on the gate and reuse the first result.
//! - A [`Lease`] is taken before the gate and held by the returned
//!   [`MaterializedResource`]. Eviction skips leased entries and only
//!   `try_lock`s gates, so it never blocks a request.
//! - Eviction renames a victim to `.trash-*` under its gate before deleting,
//!   so a concurrent `resolve` either sees the whole entry or none of it.

mod transfer;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use transfer::{CopyTransfer, SimulatedTransfer, SourceTransfer, TransferError};

use crate::config::{MaterializationConfig, TransferKind};
use crate::error::{Result, TabularError};
use crate::registry::BUNDLED_RESOURCE;

/// File name of the database inside an entry directory.
pub const DB_FILE_NAME: &str = "source.db";

const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";
const ENTRY_HASH_LEN: usize = 16;

/// Resolves a resource id to its canonical source file.
pub trait SourceLocator: Send + Sync {
    /// Path of the canonical copy.
    ///
    /// `ResourceUnavailable` when the source cannot be found,
    /// `ResourceNotProvisioned` when no real data path backs the id.
    fn locate(&self, resource_id: &str) -> Result<PathBuf>;
}

/// Replaces every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Directory name for a (caller, resource) entry.
///
/// The readable part is sanitized and therefore lossy; the suffix hashes the
/// raw pair so distinct ids never share a directory.
pub fn entry_name(caller: &str, resource_id: &str) -> String {
    let resource = resource_id.trim();
    let readable = if resource.is_empty() {
        BUNDLED_RESOURCE
    } else {
        resource
    };

    let mut hasher = Sha256::new();
    hasher.update(caller.as_bytes());
    hasher.update([0u8]);
    hasher.update(resource.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let caller = match sanitize_component(caller) {
        c if c.is_empty() => "_".to_string(),
        c => c,
    };
    format!(
        "{}.{}-{}",
        caller,
        sanitize_component(readable),
        &digest[..ENTRY_HASH_LEN]
    )
}

struct EntrySlot {
    gate: tokio::sync::Mutex<()>,
    leases: AtomicUsize,
}

impl EntrySlot {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            leases: AtomicUsize::new(0),
        }
    }
}

/// Keeps a materialized entry from being evicted while held.
pub struct Lease {
    slot: Arc<EntrySlot>,
}

impl Lease {
    fn acquire(slot: Arc<EntrySlot>) -> Self {
        slot.leases.fetch_add(1, Ordering::AcqRel);
        Self { slot }
    }
}

impl Clone for Lease {
    fn clone(&self) -> Self {
        Self::acquire(self.slot.clone())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.slot.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("holders", &self.slot.leases.load(Ordering::Relaxed))
            .finish()
    }
}

/// A local, queryable copy of a resource.
#[derive(Debug)]
pub struct MaterializedResource {
    /// Resource identifier as requested
    pub resource_id: String,
    /// Path of the local database file
    pub local_path: PathBuf,
    /// When this access happened
    pub last_access: DateTime<Utc>,
    /// Whether this call performed the transfer
    pub transferred: bool,
    lease: Lease,
}

impl MaterializedResource {
    /// Lease held by this handle.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }
}

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionReport {
    /// Entry directories examined
    pub scanned: usize,
    /// Entries removed
    pub removed: usize,
    /// Stale entries skipped because they were leased or being populated
    pub skipped_active: usize,
    /// Entries that could not be removed
    pub failed: usize,
    /// Abandoned staging and trash directories cleaned up
    pub debris_cleaned: usize,
}

/// Materialization counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializationStats {
    /// Root directory
    pub root: PathBuf,
    /// Transfer implementation name
    pub transfer: String,
    /// Resolves served from an existing local copy
    pub local_hits: u64,
    /// Completed transfers
    pub transfers: u64,
    /// Failed transfers
    pub transfer_failures: u64,
    /// Entries removed by eviction
    pub evicted: u64,
    /// Leases currently held
    pub active_leases: usize,
}

/// Removes a staging directory unless disarmed.
struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl StagingGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove staging dir {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

/// Lazily populated local copies of resources.
pub struct MaterializationCache {
    root: PathBuf,
    locator: Arc<dyn SourceLocator>,
    transfer: Arc<dyn SourceTransfer>,
    slots: DashMap<String, Arc<EntrySlot>>,
    local_hits: AtomicU64,
    transfers: AtomicU64,
    transfer_failures: AtomicU64,
    evicted: AtomicU64,
}

impl MaterializationCache {
    /// Create a cache rooted at `root`. The directory is created on first
    /// transfer.
    pub fn new(
        root: impl Into<PathBuf>,
        locator: Arc<dyn SourceLocator>,
        transfer: Arc<dyn SourceTransfer>,
    ) -> Self {
        Self {
            root: root.into(),
            locator,
            transfer,
            slots: DashMap::new(),
            local_hits: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
            transfer_failures: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Create a cache using the transfer selected in `config`.
    pub fn from_config(config: &MaterializationConfig, locator: Arc<dyn SourceLocator>) -> Self {
        let transfer: Arc<dyn SourceTransfer> = match config.transfer {
            TransferKind::Copy => Arc::new(CopyTransfer),
            TransferKind::Simulated => Arc::new(SimulatedTransfer::new(
                config.transfer_rate_bytes_per_sec,
                config.min_transfer(),
            )),
        };
        Self::new(config.root.clone(), locator, transfer)
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot(&self, name: &str) -> Arc<EntrySlot> {
        self.slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(EntrySlot::new()))
            .clone()
    }

    /// Return the local copy of `resource_id` for `caller`, transferring it
    /// first if needed.
    pub async fn resolve(&self, caller: &str, resource_id: &str) -> Result<MaterializedResource> {
        let name = entry_name(caller, resource_id);
        let slot = self.slot(&name);
        let lease = Lease::acquire(slot.clone());
        let _gate = slot.gate.lock().await;

        let dir = self.root.join(&name);
        let local_path = dir.join(DB_FILE_NAME);

        if local_path.is_file() {
            touch(&dir);
            self.local_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Using materialized copy {}", local_path.display());
            return Ok(MaterializedResource {
                resource_id: resource_id.to_string(),
                local_path,
                last_access: Utc::now(),
                transferred: false,
                lease,
            });
        }

        let source = self.locator.locate(resource_id)?;
        info!(
            "Materializing {} from {} via {} transfer",
            name,
            source.display(),
            self.transfer.name()
        );

        tokio::fs::create_dir_all(&self.root).await?;
        let staging_path = self
            .root
            .join(format!("{}{}-{}", STAGING_PREFIX, name, Uuid::new_v4().simple()));
        tokio::fs::create_dir(&staging_path).await?;
        let staging = StagingGuard {
            path: staging_path,
            armed: true,
        };

        let bytes = match self
            .transfer
            .fetch(&source, &staging.path.join(DB_FILE_NAME))
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                self.transfer_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Transfer for {} failed: {}", name, e);
                return Err(TabularError::resource_unavailable(resource_id, e));
            }
        };

        // A leftover directory without a database is debris from an older
        // process; replace it.
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::rename(&staging.path, &dir).await?;
        staging.disarm();
        self.transfers.fetch_add(1, Ordering::Relaxed);

        info!("Materialized {} ({} bytes)", local_path.display(), bytes);
        Ok(MaterializedResource {
            resource_id: resource_id.to_string(),
            local_path,
            last_access: Utc::now(),
            transferred: true,
            lease,
        })
    }

    /// Remove entries not accessed within `retention`.
    ///
    /// Blocking; run it on the blocking pool. Never fails as a whole:
    /// per-entry problems are logged and counted in the report.
    pub fn evict_stale(&self, retention: Duration) -> EvictionReport {
        let sweep_start = SystemTime::now();
        let cutoff = sweep_start.checked_sub(retention);
        let mut report = EvictionReport::default();

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return report,
            Err(e) => {
                warn!(
                    "Cannot scan materialization root {}: {}",
                    self.root.display(),
                    e
                );
                return report;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Failed to read materialization entry: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            if name.starts_with(TRASH_PREFIX) {
                if remove_tree(&path) {
                    report.debris_cleaned += 1;
                }
                continue;
            }
            if name.starts_with(STAGING_PREFIX) {
                if is_stale(&path, cutoff) && remove_tree(&path) {
                    report.debris_cleaned += 1;
                }
                continue;
            }

            report.scanned += 1;
            if !is_stale(&path, cutoff) {
                continue;
            }

            match self.evict_entry(&name, &path, cutoff) {
                Eviction::Removed => report.removed += 1,
                Eviction::Active => report.skipped_active += 1,
                Eviction::Fresh => {}
                Eviction::Failed => report.failed += 1,
            }
        }

        self.evicted
            .fetch_add(report.removed as u64, Ordering::Relaxed);
        if report.removed > 0 || report.failed > 0 {
            info!(
                "Eviction sweep: removed {} of {} entries ({} active, {} failed)",
                report.removed, report.scanned, report.skipped_active, report.failed
            );
        } else {
            debug!("Eviction sweep: nothing to remove ({} entries)", report.scanned);
        }
        report
    }

    fn evict_entry(&self, name: &str, path: &Path, cutoff: Option<SystemTime>) -> Eviction {
        let slot = self.slot(name);
        let outcome = {
            if slot.leases.load(Ordering::Acquire) > 0 {
                Eviction::Active
            } else if let Ok(_gate) = slot.gate.try_lock() {
                if slot.leases.load(Ordering::Acquire) > 0 {
                    Eviction::Active
                } else if !is_stale(path, cutoff) {
                    // Touched between scan and lock.
                    Eviction::Fresh
                } else {
                    let trash = self
                        .root
                        .join(format!("{}{}-{}", TRASH_PREFIX, name, Uuid::new_v4().simple()));
                    match fs::rename(path, &trash) {
                        Ok(()) => {
                            remove_tree(&trash);
                            info!("Evicted stale materialization {}", name);
                            Eviction::Removed
                        }
                        Err(e) if e.kind() == io::ErrorKind::NotFound => Eviction::Fresh,
                        Err(e) => {
                            warn!("Failed to evict {}: {}", path.display(), e);
                            Eviction::Failed
                        }
                    }
                }
            } else {
                Eviction::Active
            }
        };

        drop(slot);
        self.slots.remove_if(name, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.leases.load(Ordering::Acquire) == 0
        });
        outcome
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> MaterializationStats {
        MaterializationStats {
            root: self.root.clone(),
            transfer: self.transfer.name().to_string(),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            transfers: self.transfers.load(Ordering::Relaxed),
            transfer_failures: self.transfer_failures.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            active_leases: self
                .slots
                .iter()
                .map(|slot| slot.leases.load(Ordering::Relaxed))
                .sum(),
        }
    }
}

enum Eviction {
    Removed,
    Active,
    Fresh,
    Failed,
}

/// Sets a directory's mtime to now. Best-effort.
fn touch(dir: &Path) {
    let result = fs::File::open(dir).and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        warn!("Failed to touch {}: {}", dir.display(), e);
    }
}

fn is_stale(path: &Path, cutoff: Option<SystemTime>) -> bool {
    let Some(cutoff) = cutoff else {
        return false;
    };
    match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(mtime) => mtime < cutoff,
        Err(_) => false,
    }
}

/// Recursive delete; logs and returns false on failure.
fn remove_tree(path: &Path) -> bool {
    match fs::remove_dir_all(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}
