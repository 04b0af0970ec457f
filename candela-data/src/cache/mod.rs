use crate::{
    error::DataError,
    frame::{Frame, Source},
};
use candela_instrument::{Interval, MarketDescriptor, Symbol};
use chrono::NaiveDate;
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Arrow IPC encode/decode with embedded cache metadata.
pub mod ipc;

/// Append-only registry of checksum verification failures.
pub mod registry;

pub use ipc::{CacheMeta, SCHEMA_VERSION};

/// File extension of cache entries.
const CACHE_EXT: &str = "arrow";

/// Suffix appended to corrupt files moved out of the way on load.
const QUARANTINE_EXT: &str = "quarantine";

/// Identity of one cache entry: exactly one UTC day of rows for one
/// (symbol, interval) on one market.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub descriptor: MarketDescriptor,
    pub symbol: Symbol,
    pub interval: Interval,
    pub date: NaiveDate,
}

impl CacheKey {
    pub fn new(
        descriptor: MarketDescriptor,
        symbol: Symbol,
        interval: Interval,
        date: NaiveDate,
    ) -> Self {
        Self {
            descriptor,
            symbol,
            interval,
            date,
        }
    }
}

/// Why a [`CacheStore::load`] did not produce rows.
///
/// Every failure mode of the store degrades to one of these; the orchestrator
/// treats them all as "go fetch from the next source".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    /// No file at the canonical path.
    Absent,
    /// The file exists but could not be read.
    Io(String),
    /// The file is not a readable IPC file or its metadata is incoherent.
    Malformed(String),
    /// The file was written by an incompatible layout version.
    SchemaVersion { found: u32 },
    /// The stored content checksum does not match the recomputed one.
    ChecksumMismatch { expected: String, actual: String },
}

impl std::fmt::Display for MissReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissReason::Absent => f.write_str("absent"),
            MissReason::Io(e) => write!(f, "io error: {e}"),
            MissReason::Malformed(e) => write!(f, "malformed: {e}"),
            MissReason::SchemaVersion { found } => {
                write!(f, "schema version {found} (expected {SCHEMA_VERSION})")
            }
            MissReason::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch (expected {expected}, got {actual})")
            }
        }
    }
}

/// Outcome of a cache load.
#[derive(Debug, Clone)]
pub enum CacheLoad {
    Hit(Frame, CacheMeta),
    Miss(MissReason),
}

/// Hit/miss/error counters, monotonically increasing over the store's
/// lifetime.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time snapshot of [`CacheStats`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

/// Per-day outcome of an integrity sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    Ok,
    Missing,
    Corrupt(MissReason),
}

/// Per-day immutable columnar cache.
///
/// Entries live at
/// `root/{provider}/{market_type}/{data_nature}/{packaging}/{symbol}/{interval}/{YYYY-MM-DD}.arrow`
/// and are written atomically (temp sibling + fsync + rename). The store
/// assumes a single writing process; concurrent readers are safe, and a
/// write race between processes resolves to last-rename-wins.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    stats: CacheStats,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stats: CacheStats::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical path of the entry for `key`. Pure computation; the file
    /// need not exist.
    pub fn locate(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(key.descriptor.provider.as_str())
            .join(key.descriptor.market_type.as_str())
            .join(key.descriptor.data_nature.as_str())
            .join(key.descriptor.packaging.as_str())
            .join(key.symbol.as_str())
            .join(key.interval.as_str())
            .join(format!("{}.{CACHE_EXT}", key.date.format("%Y-%m-%d")))
    }

    /// Load the entry for `key`, verifying checksum and schema version.
    ///
    /// Never returns an error: integrity and IO failures demote to a typed
    /// miss (quarantining the file where applicable) so the caller can fall
    /// through to the next source.
    pub async fn load(&self, key: &CacheKey) -> CacheLoad {
        let path = self.locate(key);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(path = %path.display(), "cache miss");
                return CacheLoad::Miss(MissReason::Absent);
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(path = %path.display(), error = %e, "cache read failed");
                return CacheLoad::Miss(MissReason::Io(e.to_string()));
            }
        };

        match ipc::decode(&bytes) {
            Ok((frame, meta)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(path = %path.display(), rows = frame.len(), "cache hit");
                CacheLoad::Hit(frame, meta)
            }
            Err(reason) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(path = %path.display(), %reason, "cache entry corrupt, quarantining");
                self.quarantine(&path).await;
                CacheLoad::Miss(reason)
            }
        }
    }

    /// Atomically persist `frame` under `key`.
    ///
    /// Writes to a temp sibling, fsyncs, then renames into place so readers
    /// never observe a partially written entry, and a cancelled write leaves
    /// no entry at all.
    pub async fn store(
        &self,
        key: &CacheKey,
        frame: &Frame,
        provenance: Source,
    ) -> Result<(), DataError> {
        let path = self.locate(key);
        let parent = path
            .parent()
            .ok_or_else(|| DataError::Integrity(format!("no parent for {}", path.display())))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DataError::Integrity(format!("create {}: {e}", parent.display())))?;

        let meta = CacheMeta::for_frame(
            frame,
            provenance,
            &key.symbol,
            key.interval,
            key.descriptor.market_type,
            key.date,
        );
        let bytes = ipc::encode(frame, &meta)
            .map_err(|e| DataError::Integrity(format!("encode cache entry: {e}")))?;

        let tmp = path.with_extension(format!("{CACHE_EXT}.tmp"));
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = result {
            // Leave nothing half-written behind.
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(DataError::Integrity(format!(
                "write {}: {e}",
                path.display()
            )));
        }

        info!(path = %path.display(), rows = frame.len(), source = %provenance, "cached day");
        Ok(())
    }

    /// Remove the entry for `key`, if present.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<(), DataError> {
        let path = self.locate(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "invalidated cache entry");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DataError::Integrity(format!(
                "invalidate {}: {e}",
                path.display()
            ))),
        }
    }

    /// Sweep the stored days for `(symbol, interval)` and report each one's
    /// status without mutating anything beyond quarantine of corrupt files.
    pub async fn validate_integrity(
        &self,
        descriptor: MarketDescriptor,
        symbol: &Symbol,
        interval: Interval,
        dates: &[NaiveDate],
    ) -> Vec<(NaiveDate, IntegrityStatus)> {
        let mut report = Vec::with_capacity(dates.len());
        for &date in dates {
            let key = CacheKey::new(descriptor, symbol.clone(), interval, date);
            let status = match self.load(&key).await {
                CacheLoad::Hit(..) => IntegrityStatus::Ok,
                CacheLoad::Miss(MissReason::Absent) => IntegrityStatus::Missing,
                CacheLoad::Miss(reason) => IntegrityStatus::Corrupt(reason),
            };
            report.push((date, status));
        }
        report
    }

    /// Snapshot of the hit/miss/error counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }

    async fn quarantine(&self, path: &Path) {
        let quarantined = path.with_extension(format!("{CACHE_EXT}.{QUARANTINE_EXT}"));
        if let Err(e) = tokio::fs::rename(path, &quarantined).await {
            warn!(path = %path.display(), error = %e, "failed to quarantine corrupt entry");
        }
    }
}
