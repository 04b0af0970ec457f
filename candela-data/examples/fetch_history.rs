use candela_data::{
    failover::{GetOptions, HistoryClient},
    time,
};
use candela_instrument::{Interval, MarketType, Symbol};
use chrono::{TimeDelta, Utc};
use tracing::info;

/// Fetch three days of hourly BTCUSDT spot candles, then run the same
/// request again to demonstrate the cache taking over.
///
/// The window ends just past the archive's publication delay, so the first
/// run downloads daily ZIPs from the bulk archive and persists them under
/// `./cache`; the second run answers entirely from disk.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise INFO Tracing log subscriber
    init_logging();

    let client = HistoryClient::new("./cache");
    let symbol = Symbol::new("BTCUSDT");

    let end = time::align_down(Utc::now(), Interval::D1) - TimeDelta::days(3);
    let start = end - TimeDelta::days(3);

    for run in ["cold", "warm"] {
        info!(run, %start, %end, "requesting history");
        let response = client
            .get(
                &symbol,
                Interval::H1,
                MarketType::Spot,
                start,
                end,
                &GetOptions::default(),
            )
            .await?;

        info!(
            run,
            rows = response.frame.len(),
            gaps = response.gaps.len(),
            "retrieved history"
        );
        for entry in &response.provenance {
            info!(day = %entry.day, source = %entry.source, "day provenance");
        }
        if let (Some(first), Some(last)) = (response.frame.rows.first(), response.frame.rows.last())
        {
            info!(
                open_time = %first.open_time,
                open = first.open,
                close_time = %last.close_time,
                close = last.close,
                "range endpoints"
            );
        }
    }

    let stats = client.cache_stats();
    info!(hits = stats.hits, misses = stats.misses, "cache statistics");

    Ok(())
}

// Initialise an INFO `Subscriber` for `Tracing` Json logs and install it as the global default.
fn init_logging() {
    tracing_subscriber::fmt()
        // Filter messages based on the INFO
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        // Disable colours on release builds
        .with_ansi(cfg!(debug_assertions))
        // Enable Json formatting
        .json()
        // Install this Tracing subscriber as global default
        .init()
}
