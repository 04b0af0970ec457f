use crate::{
    archive::{ArchiveClient, ArchiveConfig},
    cache::{registry::ChecksumFailureRegistry, CacheKey, CacheLoad, CacheStatsSnapshot, CacheStore},
    error::{DataError, DayFailure},
    frame::{DayProvenance, Frame, Source},
    normalize::{self, GapAction},
    rest::{RestClient, RestConfig},
    time,
};
use candela_instrument::{Interval, MarketDescriptor, MarketType, Provider, Symbol};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, path::PathBuf, sync::Arc, time::Duration};
use tracing::{debug, info, warn, Instrument};

/// Source-selection override for one request.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforceSource {
    /// Full failover: cache → archive → REST per day.
    #[default]
    Auto,
    /// Serve from cache only; a miss is a policy error, never a fallback.
    Cache,
    /// Serve from the bulk archive only.
    Archive,
    /// Serve from the live endpoint only.
    Rest,
}

/// Per-request options.
#[derive(Debug, Clone)]
pub struct GetOptions {
    /// Bypass failover and use one named source only.
    pub enforce_source: EnforceSource,
    /// Enable cache reads and writes.
    pub use_cache: bool,
    /// Pad missing intervals with NaN rows so the row count is exactly
    /// `⌈(end-start)/interval⌉`. Off by default: sparse series stay sparse.
    pub auto_reindex: bool,
    /// Cutoff for archive candidacy. Days newer than this are served from
    /// the live endpoint and never cached.
    pub publication_delay: TimeDelta,
    /// Concurrent day-bucket resolutions.
    pub parallelism: usize,
    /// Gap handling for the final merged frame.
    pub gap_action: GapAction,
    /// Accept archive rows even when the checksum sibling does not match.
    pub proceed_on_checksum_failure: bool,
    /// Whole-request soft deadline. On expiry the request fails with the
    /// set of days already resolved.
    pub deadline: Option<Duration>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            enforce_source: EnforceSource::Auto,
            use_cache: true,
            auto_reindex: false,
            publication_delay: time::default_publication_delay(),
            parallelism: 4,
            gap_action: GapAction::Report,
            proceed_on_checksum_failure: false,
            deadline: None,
        }
    }
}

/// A retrieved frame plus per-day provenance and the gap report.
#[derive(Debug, Clone)]
pub struct HistoryResponse {
    pub frame: Frame,
    /// Source identity per day (plus an `imputed` entry for days that
    /// received padding rows).
    pub provenance: Vec<DayProvenance>,
    /// Interval boundaries with no source row, judged against the exact
    /// requested range before any imputation.
    pub gaps: Vec<DateTime<Utc>>,
}

/// Builder for [`HistoryClient`].
#[derive(Debug)]
pub struct HistoryClientBuilder {
    cache_root: PathBuf,
    provider: Provider,
    archive_config: ArchiveConfig,
    rest_config: RestConfig,
}

impl HistoryClientBuilder {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            provider: Provider::Binance,
            archive_config: ArchiveConfig::default(),
            rest_config: RestConfig::default(),
        }
    }

    pub fn archive_config(mut self, config: ArchiveConfig) -> Self {
        self.archive_config = config;
        self
    }

    pub fn rest_config(mut self, config: RestConfig) -> Self {
        self.rest_config = config;
        self
    }

    pub fn build(self) -> HistoryClient {
        let registry = Arc::new(ChecksumFailureRegistry::new(self.cache_root.join("logs")));
        HistoryClient {
            cache: Arc::new(CacheStore::new(self.cache_root)),
            archive: ArchiveClient::with_config(self.archive_config, Arc::clone(&registry)),
            rest: RestClient::with_config(self.rest_config),
            registry,
            provider: self.provider,
        }
    }
}

/// Failover orchestrator over the three sources.
///
/// Each request is decomposed into UTC day buckets. Per day the sources are
/// consulted in priority order — cache, then (for days past the publication
/// delay) the bulk archive, then the live endpoint — and successful
/// non-cache fetches of immutable days are persisted back to the cache.
/// Per-day results merge through the normalizer, which resolves midnight
/// seam duplicates and reports gaps against the exact requested range.
///
/// Requests are cancel-safe: dropping the returned future aborts in-flight
/// fetches, and the cache's temp-file + rename protocol means a cancelled
/// write leaves no partial entry behind.
#[derive(Debug)]
pub struct HistoryClient {
    cache: Arc<CacheStore>,
    archive: ArchiveClient,
    rest: RestClient,
    registry: Arc<ChecksumFailureRegistry>,
    provider: Provider,
}

/// One successfully resolved day bucket.
struct DayResult {
    day: NaiveDate,
    frame: Frame,
    source: Source,
}

impl HistoryClient {
    /// Client with default configuration, caching under `cache_root`.
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        HistoryClientBuilder::new(cache_root).build()
    }

    pub fn builder(cache_root: impl Into<PathBuf>) -> HistoryClientBuilder {
        HistoryClientBuilder::new(cache_root)
    }

    /// Snapshot of the underlying cache's hit/miss/error counters.
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    /// The checksum-failure registry shared by the cache and archive layers.
    pub fn registry(&self) -> &ChecksumFailureRegistry {
        &self.registry
    }

    /// Retrieve klines for `symbol` over `[start, end)`.
    ///
    /// Returns rows strictly ascending and unique by `open_time`, all
    /// interval-aligned and within the requested range, together with
    /// per-day provenance. Fails with a structured error naming per-day
    /// outcomes when any required day cannot be served.
    pub async fn get(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: &GetOptions,
    ) -> Result<HistoryResponse, DataError> {
        let span = tracing::info_span!(
            "history_get",
            symbol = %symbol,
            interval = %interval,
            market = %market,
            start = %start,
            end = %end,
        );
        async move {
            let now = Utc::now();
            let symbol = self.validate(symbol, interval, market, start, end, now)?;
            if start == end {
                return Ok(HistoryResponse {
                    frame: Frame::empty(),
                    provenance: Vec::new(),
                    gaps: Vec::new(),
                });
            }

            let descriptor = MarketDescriptor::klines_daily(self.provider, market);
            let days = time::enumerate_days(start, end);
            info!(days = days.len(), "resolving day buckets");

            let results = self
                .resolve_days(&symbol, interval, market, descriptor, &days, start, end, now, options)
                .await?;

            let mut failures: Vec<DayFailure> = Vec::new();
            let mut resolved: Vec<DayResult> = Vec::new();
            for result in results {
                match result {
                    Ok(day_result) => resolved.push(day_result),
                    Err(failure) => failures.push(failure),
                }
            }

            if !failures.is_empty() {
                failures.sort_by_key(|failure| failure.day);
                return Err(DataError::Incomplete { failures });
            }

            // Day buckets complete out of order; impose date order before
            // the merge so the normalizer's keep-first dedup prefers the
            // earlier day's copy of a midnight boundary row.
            resolved.sort_by_key(|result| result.day);

            let mut provenance: Vec<DayProvenance> = resolved
                .iter()
                .map(|result| DayProvenance {
                    day: result.day,
                    source: result.source,
                })
                .collect();

            let mut merged = Frame::empty();
            for result in resolved {
                merged.concat(result.frame);
            }
            merged.trim(start, end);

            let effective_gap_action = if options.auto_reindex {
                GapAction::ImputeNan
            } else {
                options.gap_action
            };
            let normalized = normalize::normalize(
                merged.rows,
                interval,
                Some((start, end)),
                effective_gap_action,
            )?;

            if normalized.imputed > 0 {
                let imputed_days: BTreeSet<NaiveDate> =
                    normalized.gaps.iter().map(|gap| gap.date_naive()).collect();
                provenance.extend(imputed_days.into_iter().map(|day| DayProvenance {
                    day,
                    source: Source::Imputed,
                }));
                provenance.sort_by_key(|entry| (entry.day, entry.source));
            }

            info!(
                rows = normalized.frame.len(),
                gaps = normalized.gaps.len(),
                "request complete"
            );

            Ok(HistoryResponse {
                frame: normalized.frame,
                provenance,
                gaps: normalized.gaps,
            })
        }
        .instrument(span)
        .await
    }

    /// Retrieve the same range for several symbols.
    ///
    /// Symbols resolve concurrently, bounded by `options.parallelism`, each
    /// through the full per-day failover. One symbol's failure does not
    /// abort the others; every symbol reports its own outcome.
    pub async fn get_many(
        &self,
        symbols: &[Symbol],
        interval: Interval,
        market: MarketType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: &GetOptions,
    ) -> Vec<(Symbol, Result<HistoryResponse, DataError>)> {
        stream::iter(symbols.iter().cloned())
            .map(|symbol| async move {
                let result = self
                    .get(&symbol, interval, market, start, end, options)
                    .await;
                (symbol, result)
            })
            .buffer_unordered(options.parallelism.max(1))
            .collect()
            .await
    }

    /// Drop the cached entry for one day and restore it from the archive.
    ///
    /// Returns whether the archive had the day. Flagged checksum failures
    /// for the day are marked resolved once the re-fetched payload
    /// verifies.
    pub async fn repair(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        date: NaiveDate,
    ) -> Result<bool, DataError> {
        let symbol = symbol.canonical(market)?;
        let descriptor = MarketDescriptor::klines_daily(self.provider, market);
        let key = CacheKey::new(descriptor, symbol.clone(), interval, date);

        self.cache.invalidate(&key).await?;
        match self
            .archive
            .fetch_day(&symbol, interval, market, date, false)
            .await
        {
            Ok(frame) => {
                self.cache.store(&key, &frame, Source::Archive).await?;
                self.registry
                    .mark_resolved(&symbol, interval, date)
                    .await?;
                info!(%symbol, %date, "repaired cached day from archive");
                Ok(true)
            }
            Err(DataError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Re-fetch archive days flagged in the checksum-failure registry and
    /// mark successfully verified records resolved. Returns how many
    /// records were resolved.
    pub async fn retry_flagged(&self, market: MarketType) -> Result<usize, DataError> {
        let records = self.registry.unresolved().await?;
        let descriptor = MarketDescriptor::klines_daily(self.provider, market);

        let mut resolved = 0usize;
        for record in records {
            match self
                .archive
                .fetch_day(&record.symbol, record.interval, market, record.date, false)
                .await
            {
                Ok(frame) => {
                    let key = CacheKey::new(
                        descriptor,
                        record.symbol.clone(),
                        record.interval,
                        record.date,
                    );
                    if let Err(e) = self.cache.store(&key, &frame, Source::Archive).await {
                        warn!(date = %record.date, error = %e, "flagged day refetched but cache write failed");
                    }
                    resolved += self
                        .registry
                        .mark_resolved(&record.symbol, record.interval, record.date)
                        .await?;
                }
                Err(e) => {
                    warn!(date = %record.date, error = %e, "flagged day still failing");
                }
            }
        }
        Ok(resolved)
    }

    fn validate(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Symbol, DataError> {
        let symbol = symbol.canonical(market)?;
        if !market.supports_interval(interval) {
            return Err(DataError::Validation(format!(
                "interval {interval} is not supported on {market} markets"
            )));
        }
        if start > end {
            return Err(DataError::Validation(format!(
                "start {start} is after end {end}"
            )));
        }
        if end > now {
            return Err(DataError::Validation(format!(
                "end {end} is in the future (now: {now})"
            )));
        }
        Ok(symbol)
    }

    /// Resolve all day buckets with bounded concurrency, honouring the
    /// optional request deadline.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_days(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        descriptor: MarketDescriptor,
        days: &[NaiveDate],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
        options: &GetOptions,
    ) -> Result<Vec<Result<DayResult, DayFailure>>, DataError> {
        let mut day_stream = stream::iter(days.iter().copied())
            .map(|day| {
                self.resolve_day(
                    symbol, interval, market, descriptor, day, start, end, now, options,
                )
            })
            .buffer_unordered(options.parallelism.max(1));

        let mut results = Vec::with_capacity(days.len());
        let drain = async {
            while let Some(result) = day_stream.next().await {
                results.push(result);
            }
        };

        match options.deadline {
            None => drain.await,
            Some(deadline) => {
                let timed_out = tokio::time::timeout(deadline, drain).await.is_err();
                if timed_out {
                    let resolved: Vec<NaiveDate> = results
                        .iter()
                        .filter_map(|result: &Result<DayResult, DayFailure>| {
                            result.as_ref().ok().map(|day_result| day_result.day)
                        })
                        .collect();
                    let unresolved = days
                        .iter()
                        .copied()
                        .filter(|day| !resolved.contains(day))
                        .collect();
                    warn!(?deadline, resolved = resolved.len(), "request deadline exceeded");
                    return Err(DataError::DeadlineExceeded {
                        resolved,
                        unresolved,
                    });
                }
            }
        }

        Ok(results)
    }

    /// Resolve one day bucket through the source priority chain.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_day(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        descriptor: MarketDescriptor,
        day: NaiveDate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
        options: &GetOptions,
    ) -> Result<DayResult, DayFailure> {
        let (day_start, day_end) = time::day_bounds(day);
        let fetch_start = start.max(day_start);
        let fetch_end = end.min(day_end);
        let covers_full_day = fetch_start == day_start && fetch_end == day_end;
        let historical = time::is_past_publication_delay(day, now, options.publication_delay);
        let key = CacheKey::new(descriptor, symbol.clone(), interval, day);

        match options.enforce_source {
            EnforceSource::Cache => {
                if !options.use_cache {
                    return Err(DataError::Policy(
                        "enforce_source=cache with use_cache=false".to_string(),
                    )
                    .day_failure(day, Source::Cache));
                }
                match self.cache.load(&key).await {
                    CacheLoad::Hit(frame, _) => Ok(DayResult {
                        day,
                        frame,
                        source: Source::Cache,
                    }),
                    CacheLoad::Miss(reason) => Err(DataError::Policy(format!(
                        "cache cannot serve {day}: {reason}"
                    ))
                    .day_failure(day, Source::Cache)),
                }
            }
            EnforceSource::Archive => {
                let frame = self
                    .archive
                    .fetch_day(
                        symbol,
                        interval,
                        market,
                        day,
                        options.proceed_on_checksum_failure,
                    )
                    .await
                    .map_err(|e| e.day_failure(day, Source::Archive))?;
                self.store_day(&key, &frame, Source::Archive, options, historical, true)
                    .await;
                Ok(DayResult {
                    day,
                    frame,
                    source: Source::Archive,
                })
            }
            EnforceSource::Rest => {
                let frame = self
                    .rest
                    .fetch_range(symbol, interval, market, fetch_start, fetch_end)
                    .await
                    .map_err(|e| e.day_failure(day, Source::Rest))?;
                self.store_day(&key, &frame, Source::Rest, options, historical, covers_full_day)
                    .await;
                Ok(DayResult {
                    day,
                    frame,
                    source: Source::Rest,
                })
            }
            EnforceSource::Auto => {
                if options.use_cache {
                    if let CacheLoad::Hit(frame, _) = self.cache.load(&key).await {
                        return Ok(DayResult {
                            day,
                            frame,
                            source: Source::Cache,
                        });
                    }
                }

                let mut archive_error: Option<DataError> = None;
                if historical {
                    match self
                        .archive
                        .fetch_day(
                            symbol,
                            interval,
                            market,
                            day,
                            options.proceed_on_checksum_failure,
                        )
                        .await
                    {
                        Ok(frame) => {
                            self.store_day(&key, &frame, Source::Archive, options, true, true)
                                .await;
                            return Ok(DayResult {
                                day,
                                frame,
                                source: Source::Archive,
                            });
                        }
                        // Both a genuine 404 (some days never make it into
                        // the archive) and a transport/integrity failure
                        // fall through to the live endpoint.
                        Err(e) => {
                            debug!(%day, error = %e, "archive unavailable, falling through to rest");
                            archive_error = Some(e);
                        }
                    }
                }

                match self
                    .rest
                    .fetch_range(symbol, interval, market, fetch_start, fetch_end)
                    .await
                {
                    Ok(frame) => {
                        // An immutable (past-publication-delay) day is
                        // cacheable whatever source produced it, but only
                        // when the fetch covered the whole day.
                        self.store_day(
                            &key,
                            &frame,
                            Source::Rest,
                            options,
                            historical,
                            covers_full_day,
                        )
                        .await;
                        Ok(DayResult {
                            day,
                            frame,
                            source: Source::Rest,
                        })
                    }
                    Err(rest_error) => {
                        let mut failure = rest_error.day_failure(day, Source::Rest);
                        if let Some(archive_error) = archive_error {
                            failure.message = format!(
                                "archive: {archive_error}; rest: {}",
                                failure.message
                            );
                        }
                        Err(failure)
                    }
                }
            }
        }
    }

    /// Persist a freshly fetched day when policy allows: cache enabled, the
    /// day immutable, the fetch covering the full day, and rows present.
    async fn store_day(
        &self,
        key: &CacheKey,
        frame: &Frame,
        source: Source,
        options: &GetOptions,
        historical: bool,
        covers_full_day: bool,
    ) {
        if !options.use_cache || !historical || !covers_full_day || frame.is_empty() {
            return;
        }
        // Cache writes are best effort; a failed write must not fail a
        // request that already has its rows.
        if let Err(e) = self.cache.store(key, frame, source).await {
            warn!(date = %key.date, error = %e, "cache write failed");
        }
    }
}
