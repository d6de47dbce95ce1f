//! Average True Range (Wilder)
//!
//! True range needs the prior close, so the first candle contributes no TR.
//! The seed is a simple mean of the first `period` TRs, then Wilder's
//! smoothing takes over; the incremental state mirrors this exactly.

use crate::types::Candle;

use super::IndicatorError;

fn true_range(candle: &Candle, prev_close: f64) -> f64 {
    let hl = candle.high - candle.low;
    let hc = (candle.high - prev_close).abs();
    let lc = (candle.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Full-series ATR. `out[i]` is `Some` once `i >= period`.
pub fn atr(candles: &[Candle], period: usize) -> Result<Vec<Option<f64>>, IndicatorError> {
    if candles.len() < period + 1 {
        return Err(IndicatorError::InsufficientHistory {
            needed: period + 1,
            got: candles.len(),
        });
    }

    let mut out = vec![None; candles.len()];
    let mut seed = 0.0;
    for i in 1..=period {
        seed += true_range(&candles[i], candles[i - 1].close);
    }
    let mut current = seed / period as f64;
    out[period] = Some(current);

    for i in (period + 1)..candles.len() {
        let tr = true_range(&candles[i], candles[i - 1].close);
        current = (current * (period as f64 - 1.0) + tr) / period as f64;
        out[i] = Some(current);
    }

    Ok(out)
}

/// Append-one ATR state
#[derive(Debug, Clone)]
pub struct AtrState {
    period: usize,
    prev_close: Option<f64>,
    seed_sum: f64,
    trs_seen: usize,
    value: Option<f64>,
}

impl AtrState {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            seed_sum: 0.0,
            trs_seen: 0,
            value: None,
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Feed one closed candle; returns the ATR once warm.
    pub fn update(&mut self, candle: &Candle) -> Option<f64> {
        let prev = match self.prev_close.replace(candle.close) {
            Some(p) => p,
            None => return None,
        };

        let tr = true_range(candle, prev);
        self.trs_seen += 1;

        if self.trs_seen < self.period {
            self.seed_sum += tr;
            return None;
        }
        let next = if self.trs_seen == self.period {
            (self.seed_sum + tr) / self.period as f64
        } else {
            let p = self.period as f64;
            (self.value.unwrap_or(0.0) * (p - 1.0) + tr) / p
        };
        self.value = Some(next);
        Some(next)
    }
}
