//! Historical replay
//!
//! Drives the identical `DecisionCore` used live, synchronously over a
//! candle series — no channels, no tasks, no gateway. Fills are modeled at
//! the decision candle's close with per-side slippage. Because the decision
//! code is shared, a backtest over the same candles a live session saw
//! reproduces the live session's decisions exactly.

pub mod monte_carlo;
pub mod sweep;

use anyhow::Result;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::{EngineConfig, StrategyParams};
use crate::engine::capital::CapitalState;
use crate::engine::{DecisionCore, EngineAction, Position, TradeRecord};
use crate::gateway::OrderResult;
use crate::types::CandleSeries;

/// Replay cost model
#[derive(Debug, Clone, Copy)]
pub struct BacktestConfig {
    pub starting_capital: f64,
    /// Slippage fraction applied against the trade on each fill side
    pub slippage_pct: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            starting_capital: 10_000.0,
            slippage_pct: 0.0006, // 0.06% per side
        }
    }
}

/// Aggregate performance of a replay
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub net_pnl: f64,
    pub net_pnl_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
}

/// Full replay result
#[derive(Debug)]
pub struct BacktestReport {
    pub trades: Vec<TradeRecord>,
    pub summary: Summary,
    pub final_equity: f64,
    /// Position still open at the end of data, if any
    pub open_position: Option<Position>,
}

/// Run a full replay of `series` under the given parameters.
pub fn run(
    params: &StrategyParams,
    engine_cfg: &EngineConfig,
    bt_cfg: &BacktestConfig,
    series: &CandleSeries,
) -> Result<BacktestReport> {
    let capital = CapitalState::new(bt_cfg.starting_capital, params.compounding);
    let mut core = DecisionCore::new(params.clone(), engine_cfg.clone(), capital);
    let mut trades = Vec::new();
    let timeframe = engine_cfg.timeframe;

    for candle in series.candles() {
        let close_time = candle.open_time + timeframe.duration();
        let actions = core.on_candle_close(candle)?;

        for action in actions {
            match action {
                EngineAction::OpenPosition {
                    direction,
                    quantity,
                    client_order_id,
                } => {
                    let fill_price =
                        candle.close * (1.0 + direction.sign() * bt_cfg.slippage_pct);
                    core.confirm_entry(
                        &modeled_fill(fill_price, quantity, client_order_id),
                        close_time,
                    );
                }
                EngineAction::AddToPosition {
                    direction,
                    quantity,
                } => {
                    let fill_price =
                        candle.close * (1.0 + direction.sign() * bt_cfg.slippage_pct);
                    core.confirm_add(&modeled_fill(fill_price, quantity, Uuid::new_v4()));
                }
                EngineAction::ClosePosition {
                    reason,
                    model_exit_price,
                } => {
                    let Some(direction) = core.position().map(|p| p.direction) else {
                        continue;
                    };
                    // Exit slippage works against the trade
                    let fill_price =
                        model_exit_price * (1.0 - direction.sign() * bt_cfg.slippage_pct);
                    if let Some(record) = core.confirm_exit(fill_price, reason, close_time) {
                        debug!(
                            pnl = record.pnl_amount,
                            %reason,
                            "replay trade closed"
                        );
                        trades.push(record);
                    }
                }
            }
        }
    }

    let summary = summarize(&trades, bt_cfg.starting_capital);
    let final_equity = bt_cfg.starting_capital + core.capital().cumulative_realized_pnl;
    Ok(BacktestReport {
        open_position: core.position().cloned(),
        trades,
        summary,
        final_equity,
    })
}

fn modeled_fill(price: f64, quantity: f64, client_order_id: Uuid) -> OrderResult {
    OrderResult {
        order_id: format!("replay-{}", client_order_id.simple()),
        client_order_id,
        filled_price: price,
        filled_qty: quantity,
    }
}

/// Compute summary statistics over a closed-trade sequence.
pub fn summarize(trades: &[TradeRecord], starting_capital: f64) -> Summary {
    let total = trades.len() as u32;
    let wins = trades.iter().filter(|t| t.pnl_amount > 0.0).count() as u32;
    let losses = trades.iter().filter(|t| t.pnl_amount < 0.0).count() as u32;

    let gross_profit: f64 = trades
        .iter()
        .filter(|t| t.pnl_amount > 0.0)
        .map(|t| t.pnl_amount)
        .sum();
    let gross_loss: f64 = trades
        .iter()
        .filter(|t| t.pnl_amount < 0.0)
        .map(|t| -t.pnl_amount)
        .sum();

    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let net_pnl = gross_profit - gross_loss;

    // Drawdown over the running equity curve
    let mut equity = starting_capital;
    let mut peak = starting_capital;
    let mut max_dd = 0.0_f64;
    for trade in trades {
        equity += trade.pnl_amount;
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            max_dd = max_dd.max((peak - equity) / peak * 100.0);
        }
    }

    // Per-trade Sharpe, annualized the way futures replay tools do
    let sharpe_ratio = if total > 1 {
        let returns: Vec<f64> = trades.iter().map(|t| t.pnl_percent).collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let std_dev = variance.sqrt();
        if std_dev > 0.0 {
            mean / std_dev * 252.0_f64.sqrt()
        } else {
            0.0
        }
    } else {
        0.0
    };

    Summary {
        total_trades: total,
        wins,
        losses,
        win_rate: if total > 0 {
            wins as f64 / total as f64 * 100.0
        } else {
            0.0
        },
        profit_factor,
        net_pnl,
        net_pnl_pct: net_pnl / starting_capital * 100.0,
        max_drawdown_pct: max_dd,
        sharpe_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lifecycle::{ExitReason, TradeSource};
    use crate::gateway::GatewayKind;
    use crate::types::Direction;
    use chrono::{TimeZone, Utc};

    fn trade(pnl: f64) -> TradeRecord {
        TradeRecord {
            symbol: "BTCUSDT".to_string(),
            exchange: GatewayKind::Paper,
            direction: Direction::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            quantity: 1.0,
            pnl_amount: pnl,
            pnl_percent: pnl,
            entry_time: Utc.timestamp_opt(0, 0).unwrap(),
            exit_time: Utc.timestamp_opt(3600, 0).unwrap(),
            source: TradeSource::Signal,
            exit_reason: ExitReason::TrailingStop,
        }
    }

    #[test]
    fn summary_counts_and_profit_factor() {
        let trades = vec![trade(30.0), trade(-10.0), trade(20.0), trade(-15.0)];
        let s = summarize(&trades, 1_000.0);
        assert_eq!(s.total_trades, 4);
        assert_eq!(s.wins, 2);
        assert_eq!(s.losses, 2);
        assert!((s.win_rate - 50.0).abs() < 1e-12);
        assert!((s.profit_factor - 2.0).abs() < 1e-12);
        assert!((s.net_pnl - 25.0).abs() < 1e-12);
    }

    #[test]
    fn drawdown_tracks_equity_peak() {
        // Equity: 1000 → 1100 → 1000 → 1050; max DD = 100/1100
        let trades = vec![trade(100.0), trade(-100.0), trade(50.0)];
        let s = summarize(&trades, 1_000.0);
        assert!((s.max_drawdown_pct - 100.0 / 1100.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn all_wins_has_infinite_profit_factor() {
        let trades = vec![trade(10.0), trade(5.0)];
        let s = summarize(&trades, 1_000.0);
        assert!(s.profit_factor.is_infinite());
        assert_eq!(s.losses, 0);
    }

    #[test]
    fn empty_trades_summarize_to_zero() {
        let s = summarize(&[], 1_000.0);
        assert_eq!(s.total_trades, 0);
        assert_eq!(s.win_rate, 0.0);
        assert_eq!(s.profit_factor, 0.0);
    }
}
