//! MACD (EMA spread with signal line)

use super::ema::{ema, EmaState};
use super::IndicatorError;

/// One MACD observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdPoint {
    pub macd_line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Full-series MACD over closes.
pub fn macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Result<Vec<MacdPoint>, IndicatorError> {
    let fast_ema = ema(closes, fast)?;
    let slow_ema = ema(closes, slow)?;
    let line: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| f - s)
        .collect();
    let signal_ema = ema(&line, signal)?;

    Ok(line
        .iter()
        .zip(signal_ema.iter())
        .map(|(&m, &s)| MacdPoint {
            macd_line: m,
            signal: s,
            histogram: m - s,
        })
        .collect())
}

/// Append-one MACD state
#[derive(Debug, Clone)]
pub struct MacdState {
    fast: EmaState,
    slow: EmaState,
    signal: EmaState,
}

impl MacdState {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast: EmaState::new(fast),
            slow: EmaState::new(slow),
            signal: EmaState::new(signal),
        }
    }

    pub fn update(&mut self, close: f64) -> MacdPoint {
        let line = self.fast.update(close) - self.slow.update(close);
        let signal = self.signal.update(line);
        MacdPoint {
            macd_line: line,
            signal,
            histogram: line - signal,
        }
    }
}
