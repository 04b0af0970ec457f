use crate::{
    cache::{
        ipc::sha256_hex,
        registry::{ChecksumFailureRecord, ChecksumFailureRegistry, FailureAction},
    },
    error::DataError,
    frame::Frame,
    normalize::{self, GapAction},
    rest::retry::{retry_with_backoff, RetryPolicy},
    time,
};
use candela_instrument::{Interval, MarketType, Symbol};
use chrono::{DateTime, NaiveDate, Utc};
use futures::{stream, StreamExt};
use std::{io::Read, sync::Arc, time::Duration};
use tracing::{debug, info, warn, Instrument};

/// Raw archive CSV row parsing and timestamp-unit detection.
pub mod record;

use record::{detect_timestamp_unit, has_header, ArchiveRow};

/// Public host of the daily bulk archive.
pub const DEFAULT_ARCHIVE_BASE_URL: &str = "https://data.binance.vision";

/// Configuration for the bulk archive adapter.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Base URL of the archive host.
    pub base_url: String,
    /// Per-day download timeout.
    pub timeout: Duration,
    /// Retries for transport errors. 404 is never retried; it means the day
    /// is not in the archive.
    pub transport_retries: u32,
    /// Concurrent day downloads in [`ArchiveClient::fetch_days`].
    pub parallelism: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ARCHIVE_BASE_URL.to_string(),
            timeout: Duration::from_secs(3),
            transport_retries: 2,
            parallelism: 4,
        }
    }
}

/// Per-day ZIP adapter over the bulk archive.
///
/// Each day of each `(symbol, interval, market)` lives at a predictable URL
/// with a `.CHECKSUM` sibling. Both are fetched concurrently, the payload is
/// SHA-256 verified, the single-entry ZIP is decompressed in memory and its
/// CSV parsed into a [`Frame`].
#[derive(Debug, Clone)]
pub struct ArchiveClient {
    http: reqwest::Client,
    config: ArchiveConfig,
    registry: Arc<ChecksumFailureRegistry>,
}

impl ArchiveClient {
    pub fn new(registry: Arc<ChecksumFailureRegistry>) -> Self {
        Self::with_config(ArchiveConfig::default(), registry)
    }

    pub fn with_config(config: ArchiveConfig, registry: Arc<ChecksumFailureRegistry>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            registry,
        }
    }

    /// Construct an [`ArchiveClient`] with a custom base URL.
    ///
    /// Useful for testing with a mock server where the URL is not known at
    /// compile time.
    pub fn with_base_url(base_url: impl Into<String>, registry: Arc<ChecksumFailureRegistry>) -> Self {
        Self::with_config(
            ArchiveConfig {
                base_url: base_url.into(),
                ..ArchiveConfig::default()
            },
            registry,
        )
    }

    /// URL of the daily data ZIP for `(symbol, interval, market, date)`.
    ///
    /// `1s` files are published under the `1m` directory; the file name
    /// keeps the real interval.
    pub fn day_url(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        date: NaiveDate,
    ) -> String {
        let directory_interval = match interval {
            Interval::S1 => Interval::M1,
            other => other,
        };
        format!(
            "{}/data/{}/daily/klines/{}/{}/{}-{}-{}.zip",
            self.config.base_url,
            market.archive_path(),
            symbol.as_str(),
            directory_interval.as_str(),
            symbol.as_str(),
            interval.as_str(),
            date.format("%Y-%m-%d"),
        )
    }

    /// Fetch one UTC day of klines from the archive.
    ///
    /// Returns [`DataError::NotFound`] when the day is absent from the
    /// archive (an expected outcome, distinct from transport failure) and
    /// [`DataError::Integrity`] on checksum mismatch unless the caller asked
    /// to proceed anyway.
    pub async fn fetch_day(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        date: NaiveDate,
        proceed_on_checksum_failure: bool,
    ) -> Result<Frame, DataError> {
        let span = tracing::info_span!(
            "archive_fetch_day",
            symbol = %symbol,
            interval = %interval,
            market = %market,
            date = %date,
        );
        async move {
            let data_url = self.day_url(symbol, interval, market, date);
            let checksum_url = format!("{data_url}.CHECKSUM");
            debug!(url = %data_url, "downloading archive day");

            // Data and checksum sibling travel together; fetching them
            // concurrently saves one RTT on every day.
            let (payload, checksum_body) = tokio::join!(
                self.download(&data_url, date),
                self.download(&checksum_url, date),
            );
            let payload = payload?;

            match checksum_body {
                Ok(body) => {
                    self.verify_checksum(
                        &payload,
                        &body,
                        symbol,
                        interval,
                        date,
                        proceed_on_checksum_failure,
                    )
                    .await?;
                }
                // A data file without its sibling cannot be verified;
                // treat like a mismatch unless the caller opted out.
                Err(DataError::NotFound { .. }) => {
                    if proceed_on_checksum_failure {
                        warn!(url = %checksum_url, "checksum sibling missing, proceeding unverified");
                    } else {
                        return Err(DataError::Integrity(format!(
                            "checksum sibling missing for {date}"
                        )));
                    }
                }
                Err(e) => return Err(e),
            }

            let rows = self.parse_zip(&payload, interval)?;
            let normalized = normalize::normalize(rows, interval, None, GapAction::Report)?;
            info!(rows = normalized.frame.len(), "archive day fetched");
            Ok(normalized.frame)
        }
        .instrument(span)
        .await
    }

    /// Fetch many days concurrently, bounded by the configured parallelism.
    ///
    /// One day's failure does not cancel its siblings; each day reports its
    /// own outcome.
    pub async fn fetch_days(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        dates: Vec<NaiveDate>,
        proceed_on_checksum_failure: bool,
    ) -> Vec<(NaiveDate, Result<Frame, DataError>)> {
        stream::iter(dates)
            .map(|date| async move {
                let result = self
                    .fetch_day(symbol, interval, market, date, proceed_on_checksum_failure)
                    .await;
                (date, result)
            })
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await
    }

    /// Newest day expected to be archived that actually is, scanning back
    /// from the publication-delay edge. `None` when the first `probe_limit`
    /// candidates are all absent.
    pub async fn latest_available_day(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        now: DateTime<Utc>,
        probe_limit: u32,
    ) -> Result<Option<NaiveDate>, DataError> {
        let mut candidate = now.date_naive();
        for _ in 0..probe_limit {
            if time::is_past_publication_delay(candidate, now, time::default_publication_delay()) {
                match self
                    .fetch_day(symbol, interval, market, candidate, false)
                    .await
                {
                    Ok(_) => return Ok(Some(candidate)),
                    Err(DataError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            candidate = candidate
                .pred_opt()
                .ok_or_else(|| DataError::Validation("date underflow".to_string()))?;
        }
        Ok(None)
    }

    /// GET `url` with the per-day timeout and transport retry budget.
    /// 404 maps to [`DataError::NotFound`] and is never retried.
    async fn download(&self, url: &str, date: NaiveDate) -> Result<Vec<u8>, DataError> {
        let policy = RetryPolicy {
            max_retries: self.config.transport_retries,
            ..RetryPolicy::default()
        };

        retry_with_backoff(&policy, DataError::is_retriable, || async {
            let response = self
                .http
                .get(url)
                .timeout(self.config.timeout)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                Ok(response.bytes().await?.to_vec())
            } else if status == reqwest::StatusCode::NOT_FOUND {
                Err(DataError::NotFound { day: date })
            } else if status.is_server_error() {
                Err(DataError::Transport(format!(
                    "archive returned {status} for {url}"
                )))
            } else {
                Err(DataError::Integrity(format!(
                    "archive returned {status} for {url}"
                )))
            }
        })
        .await
    }

    async fn verify_checksum(
        &self,
        payload: &[u8],
        checksum_body: &[u8],
        symbol: &Symbol,
        interval: Interval,
        date: NaiveDate,
        proceed: bool,
    ) -> Result<(), DataError> {
        // Body format: `{hex-sha256}  {filename}`; whitespace-split and take
        // the first token.
        let expected = String::from_utf8_lossy(checksum_body)
            .split_whitespace()
            .next()
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| DataError::Integrity(format!("empty checksum file for {date}")))?;

        let actual = sha256_hex(payload);
        if actual == expected {
            return Ok(());
        }

        let action = if proceed {
            FailureAction::Proceeded
        } else {
            FailureAction::Rejected
        };
        self.registry
            .record(ChecksumFailureRecord {
                symbol: symbol.clone(),
                interval,
                date,
                expected: expected.clone(),
                actual: actual.clone(),
                action,
                timestamp: Utc::now(),
                resolved: false,
            })
            .await?;

        if proceed {
            warn!(%date, %expected, %actual, "checksum mismatch ignored on caller request");
            Ok(())
        } else {
            Err(DataError::Integrity(format!(
                "checksum mismatch for {date}: expected {expected}, got {actual}"
            )))
        }
    }

    /// Decompress the single-entry ZIP payload in memory and parse its CSV.
    fn parse_zip(
        &self,
        payload: &[u8],
        interval: Interval,
    ) -> Result<Vec<crate::frame::Candle>, DataError> {
        let cursor = std::io::Cursor::new(payload);
        let mut archive = zip::ZipArchive::new(cursor)
            .map_err(|e| DataError::Integrity(format!("unreadable zip: {e}")))?;
        if archive.len() == 0 {
            return Err(DataError::Integrity("zip contains no entries".to_string()));
        }

        let mut entry = archive
            .by_index(0)
            .map_err(|e| DataError::Integrity(format!("unreadable zip entry: {e}")))?;
        let mut buffer = String::with_capacity(entry.size() as usize);
        entry
            .read_to_string(&mut buffer)
            .map_err(|e| DataError::Integrity(format!("decompress failed: {e}")))?;

        parse_csv(&buffer, interval)
    }
}

/// Parse an archive CSV buffer into candles, sniffing the optional header
/// and the timestamp granularity from the first data row.
fn parse_csv(buffer: &str, interval: Interval) -> Result<Vec<crate::frame::Candle>, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_header(buffer))
        .from_reader(buffer.as_bytes());

    // The unit is detected once from the first data row and assumed for the
    // rest of the file.
    let mut unit: Option<record::TimestampUnit> = None;
    let mut rows = Vec::new();
    for result in reader.deserialize::<ArchiveRow>() {
        let raw = result.map_err(|e| DataError::Integrity(format!("csv parse: {e}")))?;
        let row_unit = match unit {
            Some(existing) => existing,
            None => {
                let detected = detect_timestamp_unit(raw.0)?;
                unit = Some(detected);
                detected
            }
        };
        rows.push(raw.into_candle(row_unit, interval)?);
    }
    Ok(rows)
}
