//! Candle data loading and tick aggregation
//!
//! Backtests read OHLCV CSV exports; repeated runs go through a
//! zstd-compressed JSON cache. The live side aggregates ticks into
//! `PartialCandle`s and seals them at bar boundaries — the only place in
//! the codebase where a forming bar exists.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::info;

use crate::types::{Candle, CandleSeries, PartialCandle, Timeframe};

#[derive(Debug, Deserialize)]
struct CsvRow {
    /// Milliseconds since epoch
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Load a candle series from an OHLCV CSV export
/// (`timestamp,open,high,low,close,volume`, timestamp in ms).
pub fn load_csv(path: &Path, timeframe: Timeframe) -> Result<CandleSeries> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut candles = Vec::new();
    for row in reader.deserialize() {
        let row: CsvRow = row.context("malformed CSV row")?;
        let open_time = Utc
            .timestamp_millis_opt(row.timestamp)
            .single()
            .with_context(|| format!("invalid timestamp {}", row.timestamp))?;
        candles.push(Candle {
            open_time,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        });
    }

    info!(candles = candles.len(), path = %path.display(), "loaded CSV history");
    CandleSeries::from_candles(timeframe, candles)
}

/// Write a series to a zstd-compressed JSON cache file.
pub fn save_cache(path: &Path, series: &CandleSeries) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec(series)?;
    let compressed = zstd::encode_all(&json[..], 3)?;
    std::fs::write(path, compressed)
        .with_context(|| format!("failed to write cache {}", path.display()))?;
    Ok(())
}

/// Load a series from a zstd-compressed JSON cache file.
pub fn load_cache(path: &Path) -> Result<Option<CandleSeries>> {
    if !path.exists() {
        return Ok(None);
    }
    let compressed = std::fs::read(path)?;
    let json = zstd::decode_all(&compressed[..])?;
    let series: CandleSeries = serde_json::from_slice(&json)?;
    info!(candles = series.len(), path = %path.display(), "loaded cached history");
    Ok(Some(series))
}

/// Aggregates a tick stream into closed candles on one timeframe.
///
/// A bar seals when a tick from a later bucket arrives. Sealed open_times
/// are tracked so a replayed tick can never emit the same close twice.
#[derive(Debug)]
pub struct CandleAggregator {
    timeframe: Timeframe,
    current: Option<PartialCandle>,
    last_sealed: Option<DateTime<Utc>>,
}

impl CandleAggregator {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            current: None,
            last_sealed: None,
        }
    }

    /// Feed one tick; returns the candle it sealed, if any.
    pub fn on_tick(&mut self, time: DateTime<Utc>, price: f64, volume: f64) -> Option<Candle> {
        let bucket = self.timeframe.bucket_start(time);

        let Some(bar) = self.current.as_mut() else {
            self.current = Some(PartialCandle::new(bucket, price, volume));
            return None;
        };

        if bar.open_time == bucket {
            bar.apply_tick(price, volume);
            return None;
        }
        if bucket < bar.open_time {
            // Tick older than the forming bar: drop it
            return None;
        }

        let sealed =
            std::mem::replace(bar, PartialCandle::new(bucket, price, volume)).into_closed();
        if self.last_sealed.is_some_and(|t| sealed.open_time <= t) {
            // Redelivered history: the close was already emitted
            return None;
        }
        self.last_sealed = Some(sealed.open_time);
        Some(sealed)
    }

    /// The forming bar, if any (never a `Candle`)
    pub fn forming(&self) -> Option<&PartialCandle> {
        self.current.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn aggregator_seals_on_bucket_change() {
        let mut agg = CandleAggregator::new(Timeframe::M15);
        assert!(agg.on_tick(t(0), 100.0, 1.0).is_none());
        assert!(agg.on_tick(t(60), 105.0, 1.0).is_none());
        assert!(agg.on_tick(t(120), 98.0, 1.0).is_none());

        // First tick of the next 15m bucket seals the bar
        let sealed = agg.on_tick(t(900), 99.0, 1.0).expect("sealed candle");
        assert_eq!(sealed.open_time, t(0));
        assert_eq!(sealed.open, 100.0);
        assert_eq!(sealed.high, 105.0);
        assert_eq!(sealed.low, 98.0);
        assert_eq!(sealed.close, 98.0);
        assert_eq!(sealed.volume, 3.0);

        assert!(agg.forming().is_some());
    }

    #[test]
    fn stale_tick_cannot_reopen_sealed_bar() {
        let mut agg = CandleAggregator::new(Timeframe::M15);
        agg.on_tick(t(0), 100.0, 1.0);
        agg.on_tick(t(900), 101.0, 1.0); // seals bucket 0
        // A late tick from bucket 0 is dropped
        assert!(agg.on_tick(t(300), 50.0, 1.0).is_none());
        assert_eq!(agg.forming().unwrap().low, 101.0);
    }

    #[test]
    fn cache_roundtrip() {
        let dir = std::env::temp_dir().join("swingbot_data_tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cache.json.zst");

        let candles: Vec<Candle> = (0..50)
            .map(|i| Candle {
                open_time: t(i * 900),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 2.0,
            })
            .collect();
        let series = CandleSeries::from_candles(Timeframe::M15, candles).unwrap();

        save_cache(&path, &series).unwrap();
        let loaded = load_cache(&path).unwrap().unwrap();
        assert_eq!(loaded.len(), 50);
        assert_eq!(loaded.timeframe, Timeframe::M15);
    }

    #[test]
    fn missing_cache_is_none() {
        let path = std::env::temp_dir().join("swingbot_data_tests/nope.json.zst");
        assert!(load_cache(&path).unwrap().is_none());
    }

    #[test]
    fn csv_loader_parses_rows() {
        let dir = std::env::temp_dir().join("swingbot_data_tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("candles.csv");
        std::fs::write(
            &path,
            "timestamp,open,high,low,close,volume\n\
             0,100.0,101.0,99.0,100.5,10.0\n\
             900000,100.5,102.0,100.0,101.5,12.0\n",
        )
        .unwrap();

        let series = load_csv(&path, Timeframe::M15).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.get(1).unwrap().close, 101.5);
    }
}
