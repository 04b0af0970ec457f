use super::MissReason;
use crate::frame::{Candle, Frame, Source};
use candela_instrument::{Interval, MarketType, Symbol};
use arrow::{
    array::{Array, ArrayRef, Float64Array, TimestampNanosecondArray, UInt64Array},
    datatypes::{DataType, Field, Schema, TimeUnit},
    ipc::{reader::FileReader, writer::FileWriter},
    record_batch::RecordBatch,
};
use chrono::{DateTime, NaiveDate};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, io::Cursor, str::FromStr, sync::Arc};

/// Version of the on-disk layout. Bump when the column set or metadata
/// contract changes; readers treat any other version as a miss.
pub const SCHEMA_VERSION: u32 = 1;

const META_SCHEMA_VERSION: &str = "schema_version";
const META_SOURCE: &str = "source";
const META_SYMBOL: &str = "symbol";
const META_INTERVAL: &str = "interval";
const META_MARKET_TYPE: &str = "market_type";
const META_DATE: &str = "date";
const META_ROW_COUNT: &str = "row_count";
const META_CONTENT_SHA256: &str = "content_sha256";
const META_MIN_OPEN_TIME_NS: &str = "min_open_time_ns";
const META_MAX_OPEN_TIME_NS: &str = "max_open_time_ns";

/// Metadata embedded in every cache file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMeta {
    pub schema_version: u32,
    pub source: Source,
    pub symbol: Symbol,
    pub interval: Interval,
    pub market_type: MarketType,
    pub date: NaiveDate,
    pub row_count: usize,
    pub content_sha256: String,
    pub min_open_time_ns: Option<i64>,
    pub max_open_time_ns: Option<i64>,
}

impl CacheMeta {
    /// Derive the metadata for `frame` as stored under the given identity.
    pub fn for_frame(
        frame: &Frame,
        source: Source,
        symbol: &Symbol,
        interval: Interval,
        market_type: MarketType,
        date: NaiveDate,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            source,
            symbol: symbol.clone(),
            interval,
            market_type,
            date,
            row_count: frame.len(),
            content_sha256: content_sha256(&frame.rows),
            min_open_time_ns: frame.first_open_time().map(nanos),
            max_open_time_ns: frame.last_open_time().map(nanos),
        }
    }
}

/// Lower-case hex SHA-256 of arbitrary bytes.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Content checksum over the row payload, independent of file encoding and
/// metadata (which embeds this value and so cannot be part of it).
///
/// Each row contributes its fields in declaration order as little-endian
/// bytes; floats hash by bit pattern so NaN rows are stable.
pub fn content_sha256(rows: &[Candle]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update(nanos(row.open_time).to_le_bytes());
        hasher.update(row.open.to_bits().to_le_bytes());
        hasher.update(row.high.to_bits().to_le_bytes());
        hasher.update(row.low.to_bits().to_le_bytes());
        hasher.update(row.close.to_bits().to_le_bytes());
        hasher.update(row.volume.to_bits().to_le_bytes());
        hasher.update(nanos(row.close_time).to_le_bytes());
        hasher.update(row.quote_asset_volume.to_bits().to_le_bytes());
        hasher.update(row.trade_count.to_le_bytes());
        hasher.update(row.taker_buy_base_volume.to_bits().to_le_bytes());
        hasher.update(row.taker_buy_quote_volume.to_bits().to_le_bytes());
    }

    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn nanos(t: DateTime<chrono::Utc>) -> i64 {
    t.timestamp_nanos_opt()
        .expect("timestamp outside nanosecond-representable range")
}

fn timestamp_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())),
        false,
    )
}

fn schema(meta: &CacheMeta) -> Schema {
    let fields = vec![
        timestamp_field("open_time"),
        Field::new("open", DataType::Float64, false),
        Field::new("high", DataType::Float64, false),
        Field::new("low", DataType::Float64, false),
        Field::new("close", DataType::Float64, false),
        Field::new("volume", DataType::Float64, false),
        timestamp_field("close_time"),
        Field::new("quote_asset_volume", DataType::Float64, false),
        Field::new("trade_count", DataType::UInt64, false),
        Field::new("taker_buy_base_volume", DataType::Float64, false),
        Field::new("taker_buy_quote_volume", DataType::Float64, false),
    ];

    let mut metadata = HashMap::new();
    metadata.insert(
        META_SCHEMA_VERSION.to_string(),
        meta.schema_version.to_string(),
    );
    metadata.insert(META_SOURCE.to_string(), meta.source.as_str().to_string());
    metadata.insert(META_SYMBOL.to_string(), meta.symbol.as_str().to_string());
    metadata.insert(
        META_INTERVAL.to_string(),
        meta.interval.as_str().to_string(),
    );
    metadata.insert(
        META_MARKET_TYPE.to_string(),
        meta.market_type.as_str().to_string(),
    );
    metadata.insert(META_DATE.to_string(), meta.date.format("%Y-%m-%d").to_string());
    metadata.insert(META_ROW_COUNT.to_string(), meta.row_count.to_string());
    metadata.insert(
        META_CONTENT_SHA256.to_string(),
        meta.content_sha256.clone(),
    );
    metadata.insert(
        META_MIN_OPEN_TIME_NS.to_string(),
        meta.min_open_time_ns.map_or_else(String::new, |v| v.to_string()),
    );
    metadata.insert(
        META_MAX_OPEN_TIME_NS.to_string(),
        meta.max_open_time_ns.map_or_else(String::new, |v| v.to_string()),
    );

    Schema::new_with_metadata(fields, metadata)
}

/// Encode a frame plus metadata into Arrow IPC file bytes.
pub fn encode(frame: &Frame, meta: &CacheMeta) -> Result<Vec<u8>, arrow::error::ArrowError> {
    let schema = Arc::new(schema(meta));

    let open_time: TimestampNanosecondArray = frame
        .rows
        .iter()
        .map(|row| nanos(row.open_time))
        .collect::<Vec<_>>()
        .into();
    let close_time: TimestampNanosecondArray = frame
        .rows
        .iter()
        .map(|row| nanos(row.close_time))
        .collect::<Vec<_>>()
        .into();

    let float_column = |f: fn(&Candle) -> f64| -> ArrayRef {
        Arc::new(Float64Array::from(
            frame.rows.iter().map(f).collect::<Vec<_>>(),
        ))
    };

    let columns: Vec<ArrayRef> = vec![
        Arc::new(open_time.with_timezone("UTC")),
        float_column(|row| row.open),
        float_column(|row| row.high),
        float_column(|row| row.low),
        float_column(|row| row.close),
        float_column(|row| row.volume),
        Arc::new(close_time.with_timezone("UTC")),
        float_column(|row| row.quote_asset_volume),
        Arc::new(UInt64Array::from(
            frame.rows.iter().map(|row| row.trade_count).collect::<Vec<_>>(),
        )),
        float_column(|row| row.taker_buy_base_volume),
        float_column(|row| row.taker_buy_quote_volume),
    ];

    let batch = RecordBatch::try_new(Arc::clone(&schema), columns)?;

    let mut writer = FileWriter::try_new(Vec::new(), &schema)?;
    writer.write(&batch)?;
    writer.finish()?;
    writer.into_inner()
}

/// Decode Arrow IPC file bytes, validating schema version and content
/// checksum. Every failure maps to a [`MissReason`] so the store can demote
/// the entry rather than surface an error.
pub fn decode(bytes: &[u8]) -> Result<(Frame, CacheMeta), MissReason> {
    let reader = FileReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| MissReason::Malformed(e.to_string()))?;

    let meta = parse_meta(reader.schema().metadata())?;
    if meta.schema_version != SCHEMA_VERSION {
        return Err(MissReason::SchemaVersion {
            found: meta.schema_version,
        });
    }

    let mut rows = Vec::with_capacity(meta.row_count);
    for batch in reader {
        let batch = batch.map_err(|e| MissReason::Malformed(e.to_string()))?;
        decode_batch(&batch, &mut rows)?;
    }

    let actual = content_sha256(&rows);
    if actual != meta.content_sha256 {
        return Err(MissReason::ChecksumMismatch {
            expected: meta.content_sha256.clone(),
            actual,
        });
    }
    if rows.len() != meta.row_count {
        return Err(MissReason::Malformed(format!(
            "row_count metadata {} does not match {} decoded rows",
            meta.row_count,
            rows.len()
        )));
    }

    Ok((Frame::new(rows), meta))
}

fn decode_batch(batch: &RecordBatch, rows: &mut Vec<Candle>) -> Result<(), MissReason> {
    let timestamps = |index: usize| -> Result<&TimestampNanosecondArray, MissReason> {
        batch
            .column(index)
            .as_any()
            .downcast_ref::<TimestampNanosecondArray>()
            .ok_or_else(|| MissReason::Malformed(format!("column {index} is not a timestamp")))
    };
    let floats = |index: usize| -> Result<&Float64Array, MissReason> {
        batch
            .column(index)
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| MissReason::Malformed(format!("column {index} is not a float")))
    };

    let open_time = timestamps(0)?;
    let open = floats(1)?;
    let high = floats(2)?;
    let low = floats(3)?;
    let close = floats(4)?;
    let volume = floats(5)?;
    let close_time = timestamps(6)?;
    let quote_asset_volume = floats(7)?;
    let trade_count = batch
        .column(8)
        .as_any()
        .downcast_ref::<UInt64Array>()
        .ok_or_else(|| MissReason::Malformed("column 8 is not a uint".to_string()))?;
    let taker_buy_base_volume = floats(9)?;
    let taker_buy_quote_volume = floats(10)?;

    for i in 0..batch.num_rows() {
        rows.push(Candle {
            open_time: DateTime::from_timestamp_nanos(open_time.value(i)),
            open: open.value(i),
            high: high.value(i),
            low: low.value(i),
            close: close.value(i),
            volume: volume.value(i),
            close_time: DateTime::from_timestamp_nanos(close_time.value(i)),
            quote_asset_volume: quote_asset_volume.value(i),
            trade_count: trade_count.value(i),
            taker_buy_base_volume: taker_buy_base_volume.value(i),
            taker_buy_quote_volume: taker_buy_quote_volume.value(i),
        });
    }
    Ok(())
}

fn parse_meta(metadata: &HashMap<String, String>) -> Result<CacheMeta, MissReason> {
    let field = |key: &str| -> Result<&String, MissReason> {
        metadata
            .get(key)
            .ok_or_else(|| MissReason::Malformed(format!("missing metadata key '{key}'")))
    };
    let malformed =
        |key: &str, value: &str| MissReason::Malformed(format!("bad metadata '{key}': {value}"));

    let raw_version = field(META_SCHEMA_VERSION)?;
    let schema_version = raw_version
        .parse::<u32>()
        .map_err(|_| malformed(META_SCHEMA_VERSION, raw_version))?;

    let source = match field(META_SOURCE)?.as_str() {
        "cache" => Source::Cache,
        "archive" => Source::Archive,
        "rest" => Source::Rest,
        "imputed" => Source::Imputed,
        other => return Err(malformed(META_SOURCE, other)),
    };

    let raw_interval = field(META_INTERVAL)?;
    let interval =
        Interval::from_str(raw_interval).map_err(|_| malformed(META_INTERVAL, raw_interval))?;
    let raw_market = field(META_MARKET_TYPE)?;
    let market_type =
        MarketType::from_str(raw_market).map_err(|_| malformed(META_MARKET_TYPE, raw_market))?;
    let raw_date = field(META_DATE)?;
    let date = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d")
        .map_err(|_| malformed(META_DATE, raw_date))?;
    let raw_row_count = field(META_ROW_COUNT)?;
    let row_count = raw_row_count
        .parse::<usize>()
        .map_err(|_| malformed(META_ROW_COUNT, raw_row_count))?;

    let optional_nanos = |key: &str| -> Result<Option<i64>, MissReason> {
        let raw = field(key)?;
        if raw.is_empty() {
            Ok(None)
        } else {
            raw.parse::<i64>().map(Some).map_err(|_| malformed(key, raw))
        }
    };

    Ok(CacheMeta {
        schema_version,
        source,
        symbol: Symbol::new(field(META_SYMBOL)?),
        interval,
        market_type,
        date,
        row_count,
        content_sha256: field(META_CONTENT_SHA256)?.clone(),
        min_open_time_ns: optional_nanos(META_MIN_OPEN_TIME_NS)?,
        max_open_time_ns: optional_nanos(META_MAX_OPEN_TIME_NS)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_frame() -> Frame {
        let open_time = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        Frame::new(vec![Candle {
            open_time,
            open: 42000.0,
            high: 42100.0,
            low: 41900.0,
            close: 42050.0,
            volume: 12.5,
            close_time: Candle::expected_close_time(open_time, Interval::H1),
            quote_asset_volume: 525000.0,
            trade_count: 1234,
            taker_buy_base_volume: 6.25,
            taker_buy_quote_volume: 262500.0,
        }])
    }

    fn sample_meta(frame: &Frame) -> CacheMeta {
        CacheMeta::for_frame(
            frame,
            Source::Archive,
            &Symbol::new("BTCUSDT"),
            Interval::H1,
            MarketType::Spot,
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        )
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let frame = sample_frame();
        let meta = sample_meta(&frame);
        let bytes = encode(&frame, &meta).unwrap();

        let (decoded, decoded_meta) = decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded_meta, meta);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode(b"definitely not an arrow file"),
            Err(MissReason::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_schema_version_mismatch() {
        let frame = sample_frame();
        let mut meta = sample_meta(&frame);
        meta.schema_version = SCHEMA_VERSION + 1;
        let bytes = encode(&frame, &meta).unwrap();

        assert!(matches!(
            decode(&bytes),
            Err(MissReason::SchemaVersion { found }) if found == SCHEMA_VERSION + 1
        ));
    }

    #[test]
    fn test_decode_rejects_content_checksum_mismatch() {
        let frame = sample_frame();
        let mut meta = sample_meta(&frame);
        meta.content_sha256 = "0".repeat(64);
        let bytes = encode(&frame, &meta).unwrap();

        assert!(matches!(
            decode(&bytes),
            Err(MissReason::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_content_checksum_is_order_sensitive() {
        let frame = sample_frame();
        let mut reversed = frame.clone();
        reversed.rows.push(reversed.rows[0]);

        assert_ne!(
            content_sha256(&frame.rows),
            content_sha256(&reversed.rows)
        );
    }

    #[test]
    fn test_empty_frame_round_trip() {
        let frame = Frame::empty();
        let meta = sample_meta(&frame);
        assert_eq!(meta.min_open_time_ns, None);

        let bytes = encode(&frame, &meta).unwrap();
        let (decoded, decoded_meta) = decode(&bytes).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded_meta.row_count, 0);
    }
}
