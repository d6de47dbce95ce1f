//! Capital accounting
//!
//! Cumulative realized PnL is the single sizing input for the next trade.
//! After a restart it is always rebuilt by replaying the trade ledger —
//! incremental mutation alone drifts after a crash mid-write.

use serde::{Deserialize, Serialize};

use crate::config::{CompoundingMode, StrategyParams};
use crate::engine::lifecycle::TradeRecord;

/// Sizing state for the account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalState {
    pub base_capital: f64,
    pub cumulative_realized_pnl: f64,
    pub compounding: CompoundingMode,
}

impl CapitalState {
    pub fn new(base_capital: f64, compounding: CompoundingMode) -> Self {
        Self {
            base_capital,
            cumulative_realized_pnl: 0.0,
            compounding,
        }
    }

    /// Rebuild from the authoritative trade ledger
    pub fn replay(
        base_capital: f64,
        compounding: CompoundingMode,
        trades: &[TradeRecord],
    ) -> Self {
        let mut state = Self::new(base_capital, compounding);
        for trade in trades {
            state.apply_pnl(trade.pnl_amount);
        }
        state
    }

    pub fn apply_pnl(&mut self, pnl: f64) {
        self.cumulative_realized_pnl += pnl;
    }

    /// Capital considered when sizing the next position
    pub fn sizing_equity(&self) -> f64 {
        match self.compounding {
            CompoundingMode::Compound => {
                (self.base_capital + self.cumulative_realized_pnl).max(0.0)
            }
            CompoundingMode::Fixed => self.base_capital,
        }
    }

    /// Position quantity at `price` under the allocation and leverage policy
    pub fn position_quantity(&self, price: f64, params: &StrategyParams) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        self.sizing_equity() * params.allocation * params.leverage / price
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
    fn replay_equals_incremental() {
        let trades = vec![trade(50.0), trade(-20.0), trade(35.0)];

        let mut incremental = CapitalState::new(1_000.0, CompoundingMode::Compound);
        for t in &trades {
            incremental.apply_pnl(t.pnl_amount);
        }
        let replayed = CapitalState::replay(1_000.0, CompoundingMode::Compound, &trades);

        assert_eq!(incremental, replayed);
        assert!((replayed.cumulative_realized_pnl - 65.0).abs() < 1e-12);
    }

    #[test]
    fn compounding_grows_sizing_equity() {
        let mut state = CapitalState::new(1_000.0, CompoundingMode::Compound);
        state.apply_pnl(200.0);
        assert_eq!(state.sizing_equity(), 1_200.0);

        let fixed = CapitalState {
            compounding: CompoundingMode::Fixed,
            ..state
        };
        assert_eq!(fixed.sizing_equity(), 1_000.0);
    }

    #[test]
    fn sizing_equity_never_negative() {
        let mut state = CapitalState::new(1_000.0, CompoundingMode::Compound);
        state.apply_pnl(-1_500.0);
        assert_eq!(state.sizing_equity(), 0.0);
    }

    #[test]
    fn position_quantity_uses_allocation_and_leverage() {
        let state = CapitalState::new(10_000.0, CompoundingMode::Fixed);
        let params = StrategyParams {
            allocation: 0.8,
            leverage: 3.0,
            ..Default::default()
        };
        // 10_000 * 0.8 * 3 / 100 = 240
        assert!((state.position_quantity(100.0, &params) - 240.0).abs() < 1e-9);
        assert_eq!(state.position_quantity(0.0, &params), 0.0);
    }
}
