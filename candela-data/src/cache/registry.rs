use crate::error::DataError;
use candela_instrument::{Interval, Symbol};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::{io::AsyncWriteExt, sync::Mutex};
use tracing::{info, warn};

/// What the pipeline did when the checksum failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// The day's rows were discarded and the request escalated.
    Rejected,
    /// The caller opted into `proceed_on_checksum_failure`; the rows were
    /// used anyway.
    Proceeded,
}

/// One recorded checksum verification failure.
///
/// Records accrete; nothing prunes them automatically. A later successful
/// re-fetch of the same day flips `resolved` in place.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChecksumFailureRecord {
    pub symbol: Symbol,
    pub interval: Interval,
    pub date: NaiveDate,
    pub expected: String,
    pub actual: String,
    pub action: FailureAction,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
}

/// Append-only JSON registry of checksum failures.
///
/// Stored as a single JSON array at
/// `{logs_root}/checksum_failures/registry.json`. One appender per process;
/// concurrent processes are operator error, not guarded against.
#[derive(Debug)]
pub struct ChecksumFailureRegistry {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl ChecksumFailureRegistry {
    /// Registry rooted under `logs_root` (conventionally `<cache_root>/logs`).
    pub fn new(logs_root: impl Into<PathBuf>) -> Self {
        Self {
            path: logs_root
                .into()
                .join("checksum_failures")
                .join("registry.json"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a failure record.
    pub async fn record(&self, record: ChecksumFailureRecord) -> Result<(), DataError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_all().await?;
        warn!(
            symbol = %record.symbol,
            interval = %record.interval,
            date = %record.date,
            action = ?record.action,
            "recording checksum failure"
        );
        records.push(record);
        self.write_all(&records).await
    }

    /// All records, oldest first.
    pub async fn load(&self) -> Result<Vec<ChecksumFailureRecord>, DataError> {
        let _guard = self.write_lock.lock().await;
        self.read_all().await
    }

    /// Records not yet marked resolved.
    pub async fn unresolved(&self) -> Result<Vec<ChecksumFailureRecord>, DataError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|record| !record.resolved)
            .collect())
    }

    /// Mark every record for `(symbol, interval, date)` resolved. Returns
    /// how many records were updated.
    pub async fn mark_resolved(
        &self,
        symbol: &Symbol,
        interval: Interval,
        date: NaiveDate,
    ) -> Result<usize, DataError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_all().await?;

        let mut updated = 0;
        for record in records.iter_mut() {
            if !record.resolved
                && record.symbol == *symbol
                && record.interval == interval
                && record.date == date
            {
                record.resolved = true;
                updated += 1;
            }
        }

        if updated > 0 {
            info!(%symbol, %interval, %date, updated, "marked checksum failures resolved");
            self.write_all(&records).await?;
        }
        Ok(updated)
    }

    async fn read_all(&self) -> Result<Vec<ChecksumFailureRecord>, DataError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                DataError::Integrity(format!("registry {} is corrupt: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(DataError::Integrity(format!(
                "read registry {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn write_all(&self, records: &[ChecksumFailureRecord]) -> Result<(), DataError> {
        let parent = self.path.parent().ok_or_else(|| {
            DataError::Integrity(format!("no parent for {}", self.path.display()))
        })?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DataError::Integrity(format!("create {}: {e}", parent.display())))?;

        let bytes = serde_json::to_vec_pretty(records)
            .map_err(|e| DataError::Integrity(format!("serialize registry: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;

        result.map_err(|e| {
            DataError::Integrity(format!("write registry {}: {e}", self.path.display()))
        })
    }
}
