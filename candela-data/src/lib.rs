//! Historical kline retrieval with layered failover.
//!
//! Retrieves OHLCV candlesticks for a `(symbol, interval, market, range)`
//! request by composing three heterogeneous sources into one coherent,
//! temporally ordered [`Frame`](frame::Frame):
//!
//! 1. a content-addressed local cache of per-day Arrow IPC files,
//! 2. the provider's bulk archive of daily ZIP files, and
//! 3. the rate-limited live klines REST endpoint.
//!
//! The [`failover`] orchestrator decomposes each request into UTC day buckets,
//! consults the sources in priority order per day, persists freshly fetched
//! immutable days back to the cache, and merges everything through the
//! [`normalize`] pass that guarantees strict ordering, uniqueness and
//! interval alignment.
//!
//! ```no_run
//! use candela_data::failover::{GetOptions, HistoryClient};
//! use candela_instrument::{Interval, MarketType, Symbol};
//! use chrono::{TimeZone, Utc};
//!
//! # async fn run() -> Result<(), candela_data::error::DataError> {
//! let client = HistoryClient::new("./cache");
//! let response = client
//!     .get(
//!         &Symbol::new("BTCUSDT"),
//!         Interval::H1,
//!         MarketType::Spot,
//!         Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
//!         Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap(),
//!         &GetOptions::default(),
//!     )
//!     .await?;
//! println!("{} rows", response.frame.len());
//! # Ok(())
//! # }
//! ```

/// Bulk archive adapter: per-day ZIP download, checksum verification and
/// CSV parsing.
pub mod archive;

/// Per-day immutable columnar cache with content checksums, plus the
/// checksum-failure registry.
pub mod cache;

/// Error taxonomy for every fallible operation in this crate.
pub mod error;

/// Failover orchestrator composing cache, archive and REST into one answer.
pub mod failover;

/// Candle, frame and provenance value types.
pub mod frame;

/// Sort / dedup / alignment / gap handling for raw rows.
pub mod normalize;

/// Live klines REST adapter with weight-budget rate limiting and
/// time-cursor pagination.
pub mod rest;

/// Canonical UTC time and interval arithmetic: alignment, day buckets and
/// the publication-delay rule.
pub mod time;

pub use error::{DataError, DayFailure, ErrorKind};
pub use failover::{EnforceSource, GetOptions, HistoryClient, HistoryResponse};
pub use frame::{Candle, DayProvenance, Frame, Source};
pub use normalize::GapAction;
