//! Core market data types shared by every component.
//!
//! The central rule encoded here: a `Candle` is *always* a closed candle.
//! An in-progress bar only exists as a `PartialCandle`, which no indicator
//! or detector accepts. Conversion happens exclusively at the bar boundary,
//! so look-ahead on a forming candle is impossible by construction.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Sign of a favorable price move: +1 for longs, -1 for shorts
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "Long"),
            Direction::Short => write!(f, "Short"),
        }
    }
}

/// Supported candle timeframes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M15,
    H1,
    H4,
    D1,
    W1,
}

impl Timeframe {
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::D1 => Duration::days(1),
            Timeframe::W1 => Duration::weeks(1),
        }
    }

    /// Higher timeframe used for trend filtering
    pub fn trend_filter(&self) -> Timeframe {
        match self {
            Timeframe::M15 => Timeframe::H4,
            Timeframe::H1 => Timeframe::D1,
            Timeframe::H4 | Timeframe::D1 | Timeframe::W1 => Timeframe::W1,
        }
    }

    pub fn parse(s: &str) -> Option<Timeframe> {
        match s {
            "15m" => Some(Timeframe::M15),
            "1h" => Some(Timeframe::H1),
            "4h" => Some(Timeframe::H4),
            "1d" => Some(Timeframe::D1),
            "1w" => Some(Timeframe::W1),
            _ => None,
        }
    }

    /// Start of the bucket containing `t` when the series is resampled
    /// into this timeframe. Weeks are anchored on Monday 00:00 UTC.
    pub fn bucket_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.duration().num_seconds();
        let anchor = match self {
            // Unix epoch was a Thursday; shift so weekly buckets open on Monday
            Timeframe::W1 => 4 * 86_400,
            _ => 0,
        };
        let ts = t.timestamp() - anchor;
        Utc.timestamp_opt(ts - ts.rem_euclid(secs) + anchor, 0).unwrap()
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Timeframe::M15 => write!(f, "15m"),
            Timeframe::H1 => write!(f, "1h"),
            Timeframe::H4 => write!(f, "4h"),
            Timeframe::D1 => write!(f, "1d"),
            Timeframe::W1 => write!(f, "1w"),
        }
    }
}

/// A closed OHLCV candle. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A bar still forming from ticks. Deliberately NOT a `Candle`: nothing
/// downstream of the feed layer can observe it.
#[derive(Debug, Clone)]
pub struct PartialCandle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub last: f64,
    pub volume: f64,
}

impl PartialCandle {
    pub fn new(open_time: DateTime<Utc>, price: f64, volume: f64) -> Self {
        Self {
            open_time,
            open: price,
            high: price,
            low: price,
            last: price,
            volume,
        }
    }

    pub fn apply_tick(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.last = price;
        self.volume += volume;
    }

    /// Seal the bar at its boundary. This is the only way a forming bar
    /// becomes a `Candle`.
    pub fn into_closed(self) -> Candle {
        Candle {
            open_time: self.open_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.last,
            volume: self.volume,
        }
    }
}

/// Outcome of appending a candle to a series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Accepted,
    /// Same open_time already present; redelivery is a no-op
    Duplicate,
}

/// Ordered series of closed candles for one symbol/timeframe.
///
/// Invariants: open_time strictly increasing, no duplicates. Out-of-order
/// appends are rejected rather than silently reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleSeries {
    pub timeframe: Timeframe,
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            candles: Vec::new(),
        }
    }

    pub fn from_candles(timeframe: Timeframe, candles: Vec<Candle>) -> anyhow::Result<Self> {
        let mut series = Self::new(timeframe);
        for candle in candles {
            if series.push(candle)? == Appended::Duplicate {
                anyhow::bail!("duplicate open_time in candle history");
            }
        }
        Ok(series)
    }

    /// Append a closed candle. Returns `Duplicate` for an already-seen
    /// open_time, errors on out-of-order data.
    pub fn push(&mut self, candle: Candle) -> anyhow::Result<Appended> {
        if let Some(last) = self.candles.last() {
            if candle.open_time == last.open_time {
                return Ok(Appended::Duplicate);
            }
            if candle.open_time < last.open_time {
                anyhow::bail!(
                    "out-of-order candle: {} after {}",
                    candle.open_time,
                    last.open_time
                );
            }
        }
        self.candles.push(candle);
        Ok(Appended::Accepted)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn get(&self, idx: usize) -> Option<&Candle> {
        self.candles.get(idx)
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// Trailing window of at most `n` candles
    pub fn tail(&self, n: usize) -> &[Candle] {
        let start = self.candles.len().saturating_sub(n);
        &self.candles[start..]
    }

    pub fn closes(&self) -> impl Iterator<Item = f64> + '_ {
        self.candles.iter().map(|c| c.close)
    }
}
