use crate::{
    error::DataError,
    frame::Frame,
    normalize::{self, GapAction},
    rest::retry::{retry_with_backoff, RetryPolicy},
};
use candela_instrument::{Interval, MarketType, Symbol};
use chrono::{DateTime, Utc};
use governor::Quota;
use reqwest::StatusCode;
use std::{num::NonZeroU32, sync::Arc, time::Duration};
use tracing::{debug, info, warn, Instrument};

/// Raw positional-array kline DTO and conversion to [`Candle`](crate::frame::Candle).
pub mod klines;

/// Exponential-backoff retry used by both network adapters.
pub mod retry;

use klines::RestKlineRaw;

/// Configuration for the live REST adapter.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Override the per-market base URL. Mainly for tests against a mock
    /// server.
    pub base_url: Option<String>,
    /// Prefer the market-data-only host where the market has one.
    pub use_data_only_endpoint: bool,
    /// Per-page request timeout.
    pub page_timeout: Duration,
    /// Retries of one page after a rate-limit or transport failure.
    pub max_retries: u32,
    /// Request weight charged per klines page. Vendor API versions differ;
    /// externalized rather than hard-coded.
    pub weight_per_request: u32,
    /// Per-minute request weight budget.
    pub weight_budget_per_minute: u32,
    /// Rows requested per page. Defaults to the market's maximum.
    pub page_limit: Option<u32>,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            use_data_only_endpoint: false,
            page_timeout: Duration::from_secs(10),
            max_retries: 3,
            weight_per_request: 2,
            weight_budget_per_minute: 6_000,
            page_limit: None,
        }
    }
}

/// Direct (not-keyed) rate limiter tracking the request weight budget.
///
/// Uses an in-memory state with the default clock and no middleware.
type WeightLimiter = governor::RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
    governor::middleware::NoOpMiddleware,
>;

/// Rate-limited klines REST adapter with time-cursor pagination.
///
/// The endpoint returns up to the market's page limit of rows per request,
/// inclusive of `startTime`, ascending. [`RestClient::fetch_range`] pages
/// through `[start, end)` advancing the cursor past the last row's open
/// time, and sleeps whenever the projected next request would exceed the
/// per-minute weight budget.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    limiter: Arc<WeightLimiter>,
    config: RestConfig,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("http", &self.http)
            .field("limiter", &"WeightLimiter { .. }")
            .field("config", &self.config)
            .finish()
    }
}

impl RestClient {
    pub fn new() -> Self {
        Self::with_config(RestConfig::default())
    }

    pub fn with_config(config: RestConfig) -> Self {
        let budget = NonZeroU32::new(config.weight_budget_per_minute.max(1))
            .unwrap_or(NonZeroU32::MIN);
        let limiter = governor::RateLimiter::direct(Quota::per_minute(budget));

        Self {
            http: reqwest::Client::new(),
            limiter: Arc::new(limiter),
            config,
        }
    }

    /// Construct a [`RestClient`] with a custom base URL.
    ///
    /// Useful for testing with a mock server where the URL is not known at
    /// compile time.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self::with_config(RestConfig {
            base_url: Some(base_url.into()),
            ..RestConfig::default()
        })
    }

    fn base_url(&self, market: MarketType) -> &str {
        if let Some(base) = &self.config.base_url {
            return base;
        }
        if self.config.use_data_only_endpoint {
            if let Some(data_only) = market.rest_data_only_url() {
                return data_only;
            }
        }
        market.rest_base_url()
    }

    /// Fetch all klines with `open_time ∈ [start, end)`.
    ///
    /// Pages are requested sequentially; the cursor advances to
    /// `last_row.open_time + interval` (never `last_row.open_time`, which
    /// would duplicate the boundary row). An empty page, or a page whose
    /// last row reaches `end`, terminates the loop.
    pub async fn fetch_range(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Frame, DataError> {
        let span = tracing::info_span!(
            "rest_fetch_range",
            symbol = %symbol,
            interval = %interval,
            market = %market,
            start = %start,
            end = %end,
        );
        async move {
            if start >= end {
                return Ok(Frame::empty());
            }

            let market_limit = market.max_page_limit();
            let limit = self
                .config
                .page_limit
                .map_or(market_limit, |requested| requested.min(market_limit))
                .max(1);

            let mut rows = Vec::new();
            let mut cursor = start;
            let mut pages = 0usize;

            loop {
                let batch = self
                    .fetch_page(symbol, interval, market, cursor, end, limit)
                    .await?;
                pages += 1;

                let Some(last) = batch.last() else {
                    debug!(pages, "pagination complete: empty page");
                    break;
                };
                let last_open_time = DateTime::from_timestamp_millis(last.open_time)
                    .ok_or_else(|| {
                        DataError::Integrity(format!("invalid open_time {}", last.open_time))
                    })?;

                for raw in batch {
                    let candle = raw.into_candle(interval)?;
                    if candle.open_time < end {
                        rows.push(candle);
                    }
                }

                let next = last_open_time + interval.duration();
                if next >= end {
                    debug!(pages, "pagination complete: reached range end");
                    break;
                }
                cursor = next;
            }

            let normalized = normalize::normalize(rows, interval, None, GapAction::Report)?;
            info!(rows = normalized.frame.len(), pages, "fetched range via rest");
            Ok(normalized.frame)
        }
        .instrument(span)
        .await
    }

    /// Fetch one page, waiting for weight budget and retrying rate-limit
    /// and transport failures with exponential backoff.
    async fn fetch_page(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        cursor: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RestKlineRaw>, DataError> {
        let policy = RetryPolicy {
            max_retries: self.config.max_retries,
            ..RetryPolicy::default()
        };

        retry_with_backoff(&policy, DataError::is_retriable, || async {
            self.wait_for_weight().await?;
            self.request_page(symbol, interval, market, cursor, end, limit)
                .await
        })
        .await
    }

    /// Block until the weight budget permits the next request.
    async fn wait_for_weight(&self) -> Result<(), DataError> {
        let weight = NonZeroU32::new(self.config.weight_per_request.max(1))
            .unwrap_or(NonZeroU32::MIN);
        debug!(weight = weight.get(), "waiting for weight budget");
        self.limiter.until_n_ready(weight).await.map_err(|e| {
            DataError::RateLimit(format!(
                "request weight exceeds the whole per-minute budget: {e}"
            ))
        })
    }

    async fn request_page(
        &self,
        symbol: &Symbol,
        interval: Interval,
        market: MarketType,
        cursor: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RestKlineRaw>, DataError> {
        let url = format!("{}{}", self.base_url(market), market.klines_path());

        let response = self
            .http
            .get(&url)
            .query(&[
                ("symbol", symbol.as_str().to_string()),
                ("interval", interval.as_str().to_string()),
                ("startTime", cursor.timestamp_millis().to_string()),
                // The vendor's endTime is inclusive; subtract one unit to
                // respect the half-open range.
                ("endTime", (end.timestamp_millis() - 1).to_string()),
                ("limit", limit.to_string()),
            ])
            .timeout(self.config.page_timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let batch: Vec<RestKlineRaw> = response
                .json()
                .await
                .map_err(|e| DataError::Integrity(format!("malformed klines payload: {e}")))?;
            Ok(batch)
        } else if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::IM_A_TEAPOT {
            // 418 is the vendor's auto-ban escalation of 429.
            warn!(%url, %status, "rate limited by endpoint");
            Err(DataError::RateLimit(format!("endpoint returned {status}")))
        } else if status == StatusCode::FORBIDDEN && cursor > Utc::now() {
            Err(DataError::Validation(
                "requested window starts in the future".to_string(),
            ))
        } else if status.is_server_error() {
            Err(DataError::Transport(format!("endpoint returned {status}")))
        } else {
            Err(DataError::Validation(format!(
                "endpoint rejected request with {status}"
            )))
        }
    }
}

impl Default for RestClient {
    fn default() -> Self {
        Self::new()
    }
}
