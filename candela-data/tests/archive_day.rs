use candela_data::{archive::ArchiveClient, cache::registry::ChecksumFailureRegistry, error::DataError};
use candela_instrument::{Interval, MarketType, Symbol};
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::{io::Write, sync::Arc};
use tempfile::TempDir;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};
use zip::write::SimpleFileOptions;

fn symbol() -> Symbol {
    Symbol::new("BTCUSDT")
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
}

/// Build a single-entry ZIP holding `csv` under `name`.
fn zip_fixture(name: &str, csv: &str) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(&mut cursor);
    writer
        .start_file(name, SimpleFileOptions::default())
        .unwrap();
    writer.write_all(csv.as_bytes()).unwrap();
    writer.finish().unwrap();
    cursor.into_inner()
}

/// `{hex-sha256}  {filename}`, the archive's checksum sibling format.
fn checksum_body(payload: &[u8], filename: &str) -> String {
    let digest = Sha256::digest(payload);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{hex}  {filename}")
}

/// One day of 1m klines starting at `base_ms`, `count` rows.
fn csv_rows(base_ms: i64, count: usize) -> String {
    let mut out = String::new();
    for i in 0..count {
        let open = base_ms + (i as i64) * 60_000;
        out.push_str(&format!(
            "{open},67000.0,67100.0,66900.0,67050.0,12.5,{},837500.0,1234,6.2,415000.0,0\n",
            open + 59_999
        ));
    }
    out
}

async fn setup() -> (MockServer, ArchiveClient, TempDir) {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ChecksumFailureRegistry::new(dir.path().join("logs")));
    let client = ArchiveClient::with_base_url(server.uri(), registry);
    (server, client, dir)
}

const DAY_PATH: &str = "/data/spot/daily/klines/BTCUSDT/1m/BTCUSDT-1m-2024-03-10.zip";

#[tokio::test]
async fn test_fetch_day_happy_path() {
    let (server, client, _dir) = setup().await;

    // 2024-03-10T00:00:00Z in ms.
    let csv = csv_rows(1_710_028_800_000, 60);
    let payload = zip_fixture("BTCUSDT-1m-2024-03-10.csv", &csv);

    Mock::given(method("GET"))
        .and(path(DAY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{DAY_PATH}.CHECKSUM")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(checksum_body(&payload, "BTCUSDT-1m-2024-03-10.zip")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let frame = client
        .fetch_day(&symbol(), Interval::M1, MarketType::Spot, date(), false)
        .await
        .unwrap();

    assert_eq!(frame.len(), 60);
    assert_eq!(
        frame.rows[0].open_time.timestamp_millis(),
        1_710_028_800_000
    );
    for pair in frame.rows.windows(2) {
        assert!(pair[0].open_time < pair[1].open_time);
    }
}

#[tokio::test]
async fn test_fetch_day_missing_maps_to_not_found() {
    let (server, client, _dir) = setup().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let result = client
        .fetch_day(&symbol(), Interval::M1, MarketType::Spot, date(), false)
        .await;

    assert!(matches!(result, Err(DataError::NotFound { day }) if day == date()));
    // 404 is semantic, not transient: one data request, one checksum
    // request, no retries.
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_fetch_day_checksum_mismatch_is_recorded_and_rejected() {
    let (server, client, dir) = setup().await;

    let csv = csv_rows(1_710_028_800_000, 5);
    let payload = zip_fixture("BTCUSDT-1m-2024-03-10.csv", &csv);

    Mock::given(method("GET"))
        .and(path(DAY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{DAY_PATH}.CHECKSUM")))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "{}  BTCUSDT-1m-2024-03-10.zip",
            "0".repeat(64)
        )))
        .mount(&server)
        .await;

    let result = client
        .fetch_day(&symbol(), Interval::M1, MarketType::Spot, date(), false)
        .await;
    assert!(matches!(result, Err(DataError::Integrity(_))));

    // The failure lands in the registry, unresolved.
    let registry = ChecksumFailureRegistry::new(dir.path().join("logs"));
    let records = registry.load().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].date, date());
    assert_eq!(records[0].expected, "0".repeat(64));
    assert!(!records[0].resolved);
}

#[tokio::test]
async fn test_fetch_day_checksum_mismatch_proceeds_on_request() {
    let (server, client, dir) = setup().await;

    let csv = csv_rows(1_710_028_800_000, 5);
    let payload = zip_fixture("BTCUSDT-1m-2024-03-10.csv", &csv);

    Mock::given(method("GET"))
        .and(path(DAY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{DAY_PATH}.CHECKSUM")))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "{}  BTCUSDT-1m-2024-03-10.zip",
            "0".repeat(64)
        )))
        .mount(&server)
        .await;

    let frame = client
        .fetch_day(&symbol(), Interval::M1, MarketType::Spot, date(), true)
        .await
        .unwrap();
    assert_eq!(frame.len(), 5);

    // Still recorded, but with the proceeded action.
    let registry = ChecksumFailureRegistry::new(dir.path().join("logs"));
    let records = registry.load().await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_fetch_day_retries_transport_errors() {
    let (server, client, _dir) = setup().await;

    let csv = csv_rows(1_710_028_800_000, 3);
    let payload = zip_fixture("BTCUSDT-1m-2024-03-10.csv", &csv);

    // First data request fails with a 503; the retry succeeds.
    Mock::given(method("GET"))
        .and(path(DAY_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(DAY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{DAY_PATH}.CHECKSUM")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(checksum_body(&payload, "BTCUSDT-1m-2024-03-10.zip")),
        )
        .mount(&server)
        .await;

    let frame = client
        .fetch_day(&symbol(), Interval::M1, MarketType::Spot, date(), false)
        .await
        .unwrap();
    assert_eq!(frame.len(), 3);
}

#[tokio::test]
async fn test_fetch_day_parses_microsecond_era_files() {
    let (server, client, _dir) = setup().await;

    // 2025-01-01T00:00:00Z in µs; includes a header row like newer files.
    let base_us: i64 = 1_735_689_600_000_000;
    let mut csv = String::from(
        "open_time,open,high,low,close,volume,close_time,quote_volume,count,taker_buy_base,taker_buy_quote,ignore\n",
    );
    for i in 0..3i64 {
        let open = base_us + i * 60_000_000;
        csv.push_str(&format!(
            "{open},93000.0,93100.0,92900.0,93050.0,1.5,{},139500.0,99,0.7,65100.0,0\n",
            open + 59_999_999
        ));
    }
    let payload = zip_fixture("BTCUSDT-1m-2025-01-01.csv", &csv);
    let day_path = "/data/spot/daily/klines/BTCUSDT/1m/BTCUSDT-1m-2025-01-01.zip";

    Mock::given(method("GET"))
        .and(path(day_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{day_path}.CHECKSUM")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(checksum_body(&payload, "BTCUSDT-1m-2025-01-01.zip")),
        )
        .mount(&server)
        .await;

    let frame = client
        .fetch_day(
            &symbol(),
            Interval::M1,
            MarketType::Spot,
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            false,
        )
        .await
        .unwrap();

    assert_eq!(frame.len(), 3);
    assert_eq!(
        frame.rows[0].open_time.timestamp_micros(),
        1_735_689_600_000_000
    );
}

#[tokio::test]
async fn test_fetch_days_sibling_failure_does_not_cancel() {
    let (server, client, _dir) = setup().await;

    let good_date = date();
    let bad_date = NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();

    let csv = csv_rows(1_710_028_800_000, 2);
    let payload = zip_fixture("BTCUSDT-1m-2024-03-10.csv", &csv);

    Mock::given(method("GET"))
        .and(path(DAY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{DAY_PATH}.CHECKSUM")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(checksum_body(&payload, "BTCUSDT-1m-2024-03-10.zip")),
        )
        .mount(&server)
        .await;
    // Everything else (the 2024-03-11 pair) 404s.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let mut results = client
        .fetch_days(
            &symbol(),
            Interval::M1,
            MarketType::Spot,
            vec![good_date, bad_date],
            false,
        )
        .await;
    results.sort_by_key(|(day, _)| *day);

    assert_eq!(results.len(), 2);
    assert!(results[0].1.is_ok());
    assert!(matches!(
        results[1].1,
        Err(DataError::NotFound { day }) if day == bad_date
    ));
}
