//! Source transfer capability.
//!
//! A transfer moves the canonical copy of a resource into a staging path.
//! [`CopyTransfer`] is a plain local copy. [`SimulatedTransfer`] paces the
//! same copy to a nominal rate so callers observe download-like latency
//! until a real remote fetch replaces it.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Transfer failures.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Canonical source vanished between locate and fetch
    #[error("source {} does not exist", .0.display())]
    SourceMissing(PathBuf),

    /// Copy failed
    #[error("transfer I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Moves a canonical source file to a local destination.
#[async_trait]
pub trait SourceTransfer: Send + Sync {
    /// Copy `source` to `dest`, returning bytes transferred.
    async fn fetch(&self, source: &Path, dest: &Path) -> Result<u64, TransferError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

async fn source_len(source: &Path) -> Result<u64, TransferError> {
    match tokio::fs::metadata(source).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(TransferError::SourceMissing(source.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(TransferError::SourceMissing(source.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Plain local file copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyTransfer;

#[async_trait]
impl SourceTransfer for CopyTransfer {
    async fn fetch(&self, source: &Path, dest: &Path) -> Result<u64, TransferError> {
        source_len(source).await?;
        let bytes = tokio::fs::copy(source, dest).await?;
        Ok(bytes)
    }

    fn name(&self) -> &'static str {
        "copy"
    }
}

/// Local copy whose elapsed time is at least
/// `max(min_duration, size / rate_bytes_per_sec)`.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedTransfer {
    rate_bytes_per_sec: u64,
    min_duration: Duration,
}

impl SimulatedTransfer {
    /// Create a simulated transfer. A zero rate is treated as one byte per
    /// second.
    pub fn new(rate_bytes_per_sec: u64, min_duration: Duration) -> Self {
        Self {
            rate_bytes_per_sec: rate_bytes_per_sec.max(1),
            min_duration,
        }
    }

    /// Modeled duration for a source of `size` bytes.
    pub fn modeled_duration(&self, size: u64) -> Duration {
        let proportional = Duration::from_secs_f64(size as f64 / self.rate_bytes_per_sec as f64);
        proportional.max(self.min_duration)
    }
}

#[async_trait]
impl SourceTransfer for SimulatedTransfer {
    async fn fetch(&self, source: &Path, dest: &Path) -> Result<u64, TransferError> {
        let start = Instant::now();
        let size = source_len(source).await?;
        let target = self.modeled_duration(size);

        let bytes = tokio::fs::copy(source, dest).await?;

        let elapsed = start.elapsed();
        if elapsed < target {
            debug!(
                "Simulated transfer of {} bytes: padding {:?}",
                bytes,
                target - elapsed
            );
            tokio::time::sleep(target - elapsed).await;
        }
        Ok(bytes)
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
