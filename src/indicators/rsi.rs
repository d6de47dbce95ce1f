//! Relative Strength Index (Wilder)
//!
//! Average gain/loss seed with a simple mean over the first `period` price
//! changes, then follow Wilder's smoothing. The incremental state replays
//! the exact recurrence, keeping live values equal to a batch recompute.

use super::IndicatorError;

/// Full-series RSI. `out[i]` is `Some` once `i >= period`, i.e. after
/// `period` price changes are available.
pub fn rsi(closes: &[f64], period: usize) -> Result<Vec<Option<f64>>, IndicatorError> {
    if closes.len() < period + 1 {
        return Err(IndicatorError::InsufficientHistory {
            needed: period + 1,
            got: closes.len(),
        });
    }

    let mut out = vec![None; closes.len()];
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss += -delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = Some(rsi_from_averages(avg_gain, avg_loss));

    for i in (period + 1)..closes.len() {
        let delta = closes[i] - closes[i - 1];
        let (gain, loss) = if delta > 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = Some(rsi_from_averages(avg_gain, avg_loss));
    }

    Ok(out)
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Append-one RSI state
#[derive(Debug, Clone)]
pub struct RsiState {
    period: usize,
    prev_close: Option<f64>,
    /// Seed accumulator until `period` changes have been seen
    seed_gains: f64,
    seed_losses: f64,
    changes_seen: usize,
    avg_gain: f64,
    avg_loss: f64,
}

impl RsiState {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            seed_gains: 0.0,
            seed_losses: 0.0,
            changes_seen: 0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        }
    }

    /// Feed one close; returns the RSI once warm.
    pub fn update(&mut self, close: f64) -> Option<f64> {
        let prev = match self.prev_close.replace(close) {
            Some(p) => p,
            None => return None,
        };

        let delta = close - prev;
        let (gain, loss) = if delta > 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        self.changes_seen += 1;

        if self.changes_seen < self.period {
            self.seed_gains += gain;
            self.seed_losses += loss;
            return None;
        }
        if self.changes_seen == self.period {
            self.avg_gain = (self.seed_gains + gain) / self.period as f64;
            self.avg_loss = (self.seed_losses + loss) / self.period as f64;
        } else {
            let p = self.period as f64;
            self.avg_gain = (self.avg_gain * (p - 1.0) + gain) / p;
            self.avg_loss = (self.avg_loss * (p - 1.0) + loss) / p;
        }
        Some(rsi_from_averages(self.avg_gain, self.avg_loss))
    }

    pub fn is_warm(&self) -> bool {
        self.changes_seen >= self.period
    }
}
