//! Exponential moving average
//!
//! Both paths seed from the first value and apply the same recurrence, so a
//! batch computation and N incremental updates land on identical floats.

use super::IndicatorError;

/// Smoothing factor for a given period
pub fn alpha(period: usize) -> f64 {
    2.0 / (period as f64 + 1.0)
}

/// Full-series EMA. `out[i]` is the EMA after observing `values[0..=i]`.
pub fn ema(values: &[f64], period: usize) -> Result<Vec<f64>, IndicatorError> {
    if values.is_empty() {
        return Err(IndicatorError::InsufficientHistory { needed: 1, got: 0 });
    }
    let a = alpha(period);
    let mut out = Vec::with_capacity(values.len());
    let mut current = values[0];
    out.push(current);
    for &v in &values[1..] {
        current = a * v + (1.0 - a) * current;
        out.push(current);
    }
    Ok(out)
}

/// Append-one EMA state
#[derive(Debug, Clone)]
pub struct EmaState {
    period: usize,
    value: Option<f64>,
}

impl EmaState {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            value: None,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Current EMA, if at least one value has been observed
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn update(&mut self, v: f64) -> f64 {
        let next = match self.value {
            None => v,
            Some(prev) => alpha(self.period) * v + (1.0 - alpha(self.period)) * prev,
        };
        self.value = Some(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_and_incremental_agree() {
        let values: Vec<f64> = (0..200).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        let batch = ema(&values, 20).unwrap();

        let mut state = EmaState::new(20);
        for (i, &v) in values.iter().enumerate() {
            let inc = state.update(v);
            assert!(
                (inc - batch[i]).abs() < 1e-12,
                "divergence at {}: {} vs {}",
                i,
                inc,
                batch[i]
            );
        }
    }

    #[test]
    fn ema_of_constant_is_constant() {
        let values = vec![42.0; 50];
        let out = ema(&values, 10).unwrap();
        assert!(out.iter().all(|&v| (v - 42.0).abs() < 1e-12));
    }

    #[test]
    fn empty_series_is_an_error() {
        assert!(matches!(
            ema(&[], 10),
            Err(IndicatorError::InsufficientHistory { .. })
        ));
    }
}
