//! Indicator engine
//!
//! Every indicator exists in two forms that must agree to floating-point
//! noise: a batch computation over a full series (backtest/optimizer) and an
//! append-one state (live). The `IndicatorEngine` bundles the live states
//! and produces one `IndicatorSnapshot` per closed candle; `batch_snapshots`
//! recomputes the same snapshots from scratch. Parity between the two is the
//! contract that keeps backtest-derived parameters valid in production.

pub mod atr;
pub mod ema;
pub mod macd;
pub mod rsi;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::StrategyParams;
use crate::types::{Candle, CandleSeries};

pub use atr::AtrState;
pub use ema::EmaState;
pub use macd::{MacdPoint, MacdState};
pub use rsi::RsiState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IndicatorError {
    #[error("insufficient history: need {needed} candles, have {got}")]
    InsufficientHistory { needed: usize, got: usize },
}

/// Per-candle derived values. Fields are `None` during indicator warmup —
/// never a silent zero or NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: Option<f64>,
    pub atr: Option<f64>,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
}

impl IndicatorSnapshot {
    /// All decision-relevant values available
    pub fn is_warm(&self) -> bool {
        self.rsi.is_some() && self.atr.is_some()
    }
}

/// Live indicator states for one series, fed one closed candle at a time.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    rsi: RsiState,
    atr: AtrState,
    ema_fast: EmaState,
    ema_slow: EmaState,
    macd: MacdState,
}

impl IndicatorEngine {
    pub fn new(params: &StrategyParams) -> Self {
        Self {
            rsi: RsiState::new(params.rsi_period),
            atr: AtrState::new(params.atr_period),
            ema_fast: EmaState::new(params.macd_fast),
            ema_slow: EmaState::new(params.macd_slow),
            macd: MacdState::new(params.macd_fast, params.macd_slow, params.macd_signal),
        }
    }

    /// Incremental step: one new closed candle in, one snapshot out.
    pub fn update(&mut self, candle: &Candle) -> IndicatorSnapshot {
        let rsi = self.rsi.update(candle.close);
        let atr = self.atr.update(candle);
        let ema_fast = self.ema_fast.update(candle.close);
        let ema_slow = self.ema_slow.update(candle.close);
        let macd = self.macd.update(candle.close);
        IndicatorSnapshot {
            rsi,
            atr,
            ema_fast,
            ema_slow,
            macd_line: macd.macd_line,
            macd_signal: macd.signal,
            macd_histogram: macd.histogram,
        }
    }
}

/// Batch recomputation of every snapshot from the full series.
///
/// Used by the backtester and the parity tests. Requires enough history for
/// the slowest indicator; shorter input is an explicit error.
pub fn batch_snapshots(
    series: &CandleSeries,
    params: &StrategyParams,
) -> Result<Vec<IndicatorSnapshot>, IndicatorError> {
    let candles = series.candles();
    let needed = params.rsi_period.max(params.atr_period) + 1;
    if candles.len() < needed {
        return Err(IndicatorError::InsufficientHistory {
            needed,
            got: candles.len(),
        });
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let rsi = rsi::rsi(&closes, params.rsi_period)?;
    let atr = atr::atr(candles, params.atr_period)?;
    let ema_fast = ema::ema(&closes, params.macd_fast)?;
    let ema_slow = ema::ema(&closes, params.macd_slow)?;
    let macd = macd::macd(&closes, params.macd_fast, params.macd_slow, params.macd_signal)?;

    Ok((0..candles.len())
        .map(|i| IndicatorSnapshot {
            rsi: rsi[i],
            atr: atr[i],
            ema_fast: ema_fast[i],
            ema_slow: ema_slow[i],
            macd_line: macd[i].macd_line,
            macd_signal: macd[i].signal,
            macd_histogram: macd[i].histogram,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use crate::types::Timeframe;

    fn wave_series(n: usize) -> CandleSeries {
        let candles: Vec<Candle> = (0..n)
            .map(|i| {
                let base = 30_000.0 + (i as f64 * 0.37).sin() * 400.0 + i as f64 * 2.0;
                Candle {
                    open_time: Utc.timestamp_opt(i as i64 * 900, 0).unwrap(),
                    open: base - 10.0,
                    high: base + 60.0,
                    low: base - 60.0,
                    close: base,
                    volume: 10.0,
                }
            })
            .collect();
        CandleSeries::from_candles(Timeframe::M15, candles).unwrap()
    }

    #[test]
    fn engine_matches_batch_over_full_series() {
        let params = StrategyParams::default();
        let series = wave_series(400);
        let batch = batch_snapshots(&series, &params).unwrap();

        let mut engine = IndicatorEngine::new(&params);
        for (i, candle) in series.candles().iter().enumerate() {
            let snap = engine.update(candle);
            assert_eq!(snap.rsi.is_some(), batch[i].rsi.is_some(), "rsi warmup at {}", i);
            if let (Some(a), Some(b)) = (snap.rsi, batch[i].rsi) {
                assert!((a - b).abs() < 1e-9);
            }
            if let (Some(a), Some(b)) = (snap.atr, batch[i].atr) {
                assert!((a - b).abs() < 1e-9);
            }
            assert!((snap.macd_histogram - batch[i].macd_histogram).abs() < 1e-9);
        }
    }

    #[test]
    fn batch_refuses_short_history() {
        let params = StrategyParams::default();
        let series = wave_series(10);
        assert!(matches!(
            batch_snapshots(&series, &params),
            Err(IndicatorError::InsufficientHistory { .. })
        ));
    }
}
