//! Multi-timeframe trend filter
//!
//! Resamples the base series into a higher timeframe using only fully
//! elapsed buckets — a bucket whose closing candle has not arrived yet is
//! dropped, never extrapolated — then classifies trend by the last resampled
//! close against its EMA.

use serde::{Deserialize, Serialize};

use crate::indicators::ema;
use crate::types::{Candle, CandleSeries, Timeframe};

/// Higher-timeframe trend state gating entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Up,
    Down,
    /// Not enough resampled history to classify
    Neutral,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::Up => write!(f, "up"),
            Trend::Down => write!(f, "down"),
            Trend::Neutral => write!(f, "neutral"),
        }
    }
}

/// Resample base candles into `higher` buckets, keeping only buckets whose
/// full span is covered by closed base candles.
pub fn resample(base: &CandleSeries, higher: Timeframe) -> Vec<Candle> {
    let base_dur = base.timeframe.duration();
    let higher_dur = higher.duration();
    let mut out: Vec<Candle> = Vec::new();
    let mut current: Option<Candle> = None;

    for candle in base.candles() {
        let bucket = higher.bucket_start(candle.open_time);

        // A candle from a later bucket proves the previous bucket elapsed
        if current.as_ref().is_some_and(|agg| agg.open_time != bucket) {
            out.push(current.take().expect("checked above"));
        }

        if let Some(agg) = current.as_mut() {
            agg.high = agg.high.max(candle.high);
            agg.low = agg.low.min(candle.low);
            agg.close = candle.close;
            agg.volume += candle.volume;
        } else {
            current = Some(Candle {
                open_time: bucket,
                ..candle.clone()
            });
        }

        // The bucket is also complete when its last base candle has closed
        let elapsed = current
            .as_ref()
            .is_some_and(|agg| candle.open_time + base_dur >= agg.open_time + higher_dur);
        if elapsed {
            out.push(current.take().expect("checked above"));
        }
    }
    out
}

/// EMA-cross trend classifier over the resampled series.
#[derive(Debug, Clone)]
pub struct TrendFilter {
    pub higher: Timeframe,
    pub ema_period: usize,
}

impl TrendFilter {
    pub fn new(higher: Timeframe, ema_period: usize) -> Self {
        Self { higher, ema_period }
    }

    /// Trend at the last fully-confirmed higher-timeframe candle.
    pub fn trend(&self, base: &CandleSeries) -> Trend {
        let resampled = resample(base, self.higher);
        if resampled.len() < self.ema_period {
            return Trend::Neutral;
        }
        let closes: Vec<f64> = resampled.iter().map(|c| c.close).collect();
        let ema = match ema::ema(&closes, self.ema_period) {
            Ok(v) => v,
            Err(_) => return Trend::Neutral,
        };
        let last_close = *closes.last().expect("non-empty");
        let last_ema = *ema.last().expect("non-empty");
        if last_close > last_ema {
            Trend::Up
        } else if last_close < last_ema {
            Trend::Down
        } else {
            Trend::Neutral
        }
    }
}
