//! Monte Carlo trade-sequence analysis
//!
//! Shuffles the order of realized trade returns to estimate how much of a
//! replay's drawdown profile is sequencing luck. Randomness stays strictly
//! in this module — decision code is deterministic.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

/// Distribution statistics over shuffled equity curves
#[derive(Debug, Clone, Serialize)]
pub struct MonteCarloStats {
    pub iterations: usize,
    pub median_final_equity: f64,
    pub worst_final_equity: f64,
    /// Median of per-iteration max drawdown (percent of peak)
    pub median_max_drawdown_pct: f64,
    /// 95th percentile of per-iteration max drawdown
    pub p95_max_drawdown_pct: f64,
}

/// Resample `pnl_percents` (compounded per trade) `iterations` times.
/// Seeded for reproducible reports.
pub fn run(
    pnl_percents: &[f64],
    starting_capital: f64,
    iterations: usize,
    seed: u64,
) -> Option<MonteCarloStats> {
    if pnl_percents.is_empty() || iterations == 0 {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut finals = Vec::with_capacity(iterations);
    let mut drawdowns = Vec::with_capacity(iterations);

    let mut sequence: Vec<f64> = pnl_percents.to_vec();
    for _ in 0..iterations {
        sequence.shuffle(&mut rng);

        let mut equity = starting_capital;
        let mut peak = starting_capital;
        let mut max_dd = 0.0_f64;
        for pct in &sequence {
            equity *= 1.0 + pct / 100.0;
            if equity <= 0.0 {
                equity = 0.0;
                max_dd = 100.0;
                break;
            }
            if equity > peak {
                peak = equity;
            }
            max_dd = max_dd.max((peak - equity) / peak * 100.0);
        }
        finals.push(equity);
        drawdowns.push(max_dd);
    }

    finals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    drawdowns.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    Some(MonteCarloStats {
        iterations,
        median_final_equity: percentile(&finals, 50.0),
        worst_final_equity: finals[0],
        median_max_drawdown_pct: percentile(&drawdowns, 50.0),
        p95_max_drawdown_pct: percentile(&drawdowns, 95.0),
    })
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let idx = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
