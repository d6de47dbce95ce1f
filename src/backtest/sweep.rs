//! Parameter sweep
//!
//! Runs the replay across a parameter grid in parallel with Rayon and ranks
//! the outcomes. Grids are data (preset-style records); the strategy code
//! never changes per combination.

use anyhow::Result;
use rayon::prelude::*;
use tracing::info;

use crate::backtest::{self, BacktestConfig, Summary};
use crate::config::{EngineConfig, StrategyParams};
use crate::types::CandleSeries;

/// One grid point
#[derive(Debug, Clone)]
pub struct SweepParams {
    pub atr_mult: f64,
    pub trail_start_r: f64,
    pub trail_dist_r: f64,
    pub pattern_tolerance: f64,
}

impl SweepParams {
    fn apply(&self, base: &StrategyParams) -> StrategyParams {
        StrategyParams {
            atr_mult: self.atr_mult,
            trail_start_r: self.trail_start_r,
            trail_dist_r: self.trail_dist_r,
            pattern_tolerance: self.pattern_tolerance,
            ..base.clone()
        }
    }
}

/// Replay outcome for one grid point
#[derive(Debug, Clone)]
pub struct SweepResult {
    pub params: SweepParams,
    pub summary: Summary,
}

/// Default grid: the axes that dominate stop placement and trailing.
pub fn default_grid() -> Vec<SweepParams> {
    let mut grid = Vec::new();
    for &atr_mult in &[1.25, 1.5, 1.8, 2.2] {
        for &trail_start_r in &[0.5, 0.8, 1.0] {
            for &trail_dist_r in &[0.5, 0.8, 1.0] {
                for &pattern_tolerance in &[0.02, 0.03, 0.05] {
                    grid.push(SweepParams {
                        atr_mult,
                        trail_start_r,
                        trail_dist_r,
                        pattern_tolerance,
                    });
                }
            }
        }
    }
    grid
}

/// Run every grid point over the same series, ranked by profit factor then
/// net PnL. Combinations that error (e.g. insufficient history) are dropped.
pub fn run_sweep(
    base_params: &StrategyParams,
    engine_cfg: &EngineConfig,
    bt_cfg: &BacktestConfig,
    series: &CandleSeries,
    grid: Vec<SweepParams>,
) -> Result<Vec<SweepResult>> {
    info!(combinations = grid.len(), candles = series.len(), "starting sweep");

    let mut results: Vec<SweepResult> = grid
        .into_par_iter()
        .filter_map(|point| {
            let params = point.apply(base_params);
            backtest::run(&params, engine_cfg, bt_cfg, series)
                .ok()
                .map(|report| SweepResult {
                    params: point,
                    summary: report.summary,
                })
        })
        .collect();

    results.sort_by(|a, b| {
        let pf = b
            .summary
            .profit_factor
            .partial_cmp(&a.summary.profit_factor)
            .unwrap_or(std::cmp::Ordering::Equal);
        pf.then(
            b.summary
                .net_pnl
                .partial_cmp(&a.summary.net_pnl)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });

    info!(results = results.len(), "sweep complete");
    Ok(results)
}
