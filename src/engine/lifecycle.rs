//! Position lifecycle primitives
//!
//! The position book moves through `Flat → PendingEntry → Open → Trailing →
//! Closed`. This module holds the position record, the trade ledger record,
//! and the pure stop-management math applied identically by the live loop
//! and the backtester. The trailing stop only ever ratchets toward the
//! favorable direction; the RSI-adaptive distance multiplier widens the
//! trail when momentum runs with the trade and tightens it when momentum
//! fades.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StrategyParams;
use crate::gateway::GatewayKind;
use crate::types::{Candle, Direction};

/// Lifecycle phase of the position book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Flat,
    /// Entry order submitted, awaiting fill confirmation
    PendingEntry,
    /// Position open, static stop
    Open,
    /// Position open, stop ratcheting behind the extreme
    Trailing,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Flat => write!(f, "FLAT"),
            LifecycleState::PendingEntry => write!(f, "PENDING_ENTRY"),
            LifecycleState::Open => write!(f, "OPEN"),
            LifecycleState::Trailing => write!(f, "TRAILING"),
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Initial stop hit before trailing activated
    StopHit,
    /// Ratcheted trailing stop hit
    TrailingStop,
    /// Operator-requested close
    Manual,
    /// Local state corrected against exchange truth
    Reconciliation,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopHit => write!(f, "STOP"),
            ExitReason::TrailingStop => write!(f, "TRAIL"),
            ExitReason::Manual => write!(f, "MANUAL"),
            ExitReason::Reconciliation => write!(f, "RECONCILE"),
        }
    }
}

/// How a trade came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSource {
    Signal,
    Manual,
    /// Adopted from the exchange without a local entry decision
    External,
}

/// An open position. Created only through the entry transition (or external
/// adoption) and destroyed only by producing a `TradeRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub exchange: GatewayKind,
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: f64,
    pub initial_stop: f64,
    pub current_stop: f64,
    /// Most favorable price seen since entry
    pub extreme_price: f64,
    pub trailing_active: bool,
    pub opened_at: DateTime<Utc>,
    pub client_order_id: Uuid,
    pub source: TradeSource,
    /// Price distance that activates trailing, fixed at entry
    pub trail_start: f64,
    /// Base trailing distance in price units, fixed at entry
    pub trail_dist: f64,
    pub add_count: u8,
}

impl Position {
    /// One risk unit: distance between entry and the initial stop
    pub fn initial_risk(&self) -> f64 {
        (self.entry_price - self.initial_stop).abs()
    }

    /// Fold an add-on fill into the position (weighted average entry).
    /// Stops and trailing anchors stay pinned to the original entry.
    pub fn apply_add(&mut self, fill_price: f64, fill_qty: f64) {
        let total = self.quantity + fill_qty;
        self.entry_price =
            (self.entry_price * self.quantity + fill_price * fill_qty) / total;
        self.quantity = total;
        self.add_count += 1;
    }
}

/// Closed trade, append-only once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub exchange: GatewayKind,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl_amount: f64,
    pub pnl_percent: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub source: TradeSource,
    pub exit_reason: ExitReason,
}

impl TradeRecord {
    pub fn from_close(
        position: &Position,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Self {
        let pnl_amount =
            (exit_price - position.entry_price) * position.direction.sign() * position.quantity;
        let pnl_percent = (exit_price - position.entry_price) * position.direction.sign()
            / position.entry_price
            * 100.0;
        Self {
            symbol: position.symbol.clone(),
            exchange: position.exchange,
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            pnl_amount,
            pnl_percent,
            entry_time: position.opened_at,
            exit_time,
            source: position.source,
            exit_reason: reason,
        }
    }
}

/// Initial stop at a fill price: entry ∓ ATR × multiplier
pub fn initial_stop(entry: f64, atr: f64, atr_mult: f64, direction: Direction) -> f64 {
    entry - direction.sign() * atr * atr_mult
}

/// RSI-adaptive trailing distance multiplier. With momentum running in the
/// trade's favor the trail widens (let it run); with momentum fading it
/// tightens.
pub fn trail_multiplier(direction: Direction, rsi: Option<f64>, params: &StrategyParams) -> f64 {
    let Some(rsi) = rsi else { return 1.0 };
    match direction {
        Direction::Long => {
            if rsi > params.pullback_rsi_short {
                2.0
            } else if rsi < 50.0 {
                0.8
            } else {
                1.0
            }
        }
        Direction::Short => {
            if rsi < params.pullback_rsi_long {
                2.0
            } else if rsi > 50.0 {
                0.8
            } else {
                1.0
            }
        }
    }
}

/// What a price observation did to the position
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionEvent {
    /// Stop breached; exit at the given model price
    StopHit { exit_price: f64, reason: ExitReason },
    /// Trailing stop ratcheted
    StopRaised { new_stop: f64 },
    Unchanged,
}

/// Apply one closed candle to an open position.
///
/// The stop confirmed before this candle is tested against the candle's
/// range first; only a surviving position updates its extreme and ratchets.
/// Exit price is the stop, or the open when the bar gapped through it.
pub fn apply_candle(
    position: &mut Position,
    candle: &Candle,
    rsi: Option<f64>,
    params: &StrategyParams,
) -> PositionEvent {
    let stop = position.current_stop;
    let reason = if position.trailing_active {
        ExitReason::TrailingStop
    } else {
        ExitReason::StopHit
    };

    match position.direction {
        Direction::Long => {
            if candle.low <= stop {
                return PositionEvent::StopHit {
                    exit_price: stop.min(candle.open),
                    reason,
                };
            }
        }
        Direction::Short => {
            if candle.high >= stop {
                return PositionEvent::StopHit {
                    exit_price: stop.max(candle.open),
                    reason,
                };
            }
        }
    }

    let observed_extreme = match position.direction {
        Direction::Long => candle.high,
        Direction::Short => candle.low,
    };
    ratchet(position, observed_extreme, rsi, params)
}

/// Apply one price tick to an open position (per-tick trailing mode).
pub fn apply_tick(
    position: &mut Position,
    price: f64,
    rsi: Option<f64>,
    params: &StrategyParams,
) -> PositionEvent {
    let stop = position.current_stop;
    let reason = if position.trailing_active {
        ExitReason::TrailingStop
    } else {
        ExitReason::StopHit
    };

    let hit = match position.direction {
        Direction::Long => price <= stop,
        Direction::Short => price >= stop,
    };
    if hit {
        return PositionEvent::StopHit {
            exit_price: stop,
            reason,
        };
    }
    ratchet(position, price, rsi, params)
}

fn ratchet(
    position: &mut Position,
    observed_extreme: f64,
    rsi: Option<f64>,
    params: &StrategyParams,
) -> PositionEvent {
    let sign = position.direction.sign();
    let advanced = (observed_extreme - position.extreme_price) * sign > 0.0;
    if advanced {
        position.extreme_price = observed_extreme;
    }

    // Trailing arms once the extreme clears the activation threshold
    let activated = (position.extreme_price - position.trail_start) * sign >= 0.0;
    if !activated {
        return PositionEvent::Unchanged;
    }
    position.trailing_active = true;

    let mult = trail_multiplier(position.direction, rsi, params);
    let candidate = position.extreme_price - sign * position.trail_dist * mult;

    // Ratchet only: the stop never loosens
    if (candidate - position.current_stop) * sign > 0.0 {
        position.current_stop = candidate;
        return PositionEvent::StopRaised {
            new_stop: candidate,
        };
    }
    PositionEvent::Unchanged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn long_position(entry: f64, atr: f64, params: &StrategyParams) -> Position {
        let stop = initial_stop(entry, atr, params.atr_mult, Direction::Long);
        let risk = entry - stop;
        Position {
            symbol: "BTCUSDT".to_string(),
            exchange: GatewayKind::Paper,
            direction: Direction::Long,
            entry_price: entry,
            quantity: 1.0,
            initial_stop: stop,
            current_stop: stop,
            extreme_price: entry,
            trailing_active: false,
            opened_at: Utc.timestamp_opt(0, 0).unwrap(),
            client_order_id: Uuid::new_v4(),
            source: TradeSource::Signal,
            trail_start: entry + risk * params.trail_start_r,
            trail_dist: risk * params.trail_dist_r,
            add_count: 0,
        }
    }

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc.timestamp_opt(0, 0).unwrap(),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    /// Spec scenario: entry 100 / ATR 2 / atr_mult 1.5 / trail_start_r 0.8 /
    /// trail_dist_r 1.0 — stop 97, trailing arms at 102.4, extreme 110
    /// ratchets the stop to 107.
    #[test]
    fn reference_trailing_scenario() {
        let params = StrategyParams {
            atr_mult: 1.5,
            trail_start_r: 0.8,
            trail_dist_r: 1.0,
            ..Default::default()
        };
        let mut pos = long_position(100.0, 2.0, &params);
        assert!((pos.initial_stop - 97.0).abs() < 1e-12);
        assert!((pos.initial_risk() - 3.0).abs() < 1e-12);
        assert!((pos.trail_start - 102.4).abs() < 1e-12);

        // Price reaches 106: trailing active, stop = 106 - 3 = 103
        let ev = apply_tick(&mut pos, 106.0, Some(55.0), &params);
        assert!(pos.trailing_active);
        assert_eq!(ev, PositionEvent::StopRaised { new_stop: 103.0 });

        // Extreme advances to 110: stop ratchets to 107
        let ev = apply_tick(&mut pos, 110.0, Some(55.0), &params);
        assert_eq!(ev, PositionEvent::StopRaised { new_stop: 107.0 });
        assert!((pos.current_stop - 107.0).abs() < 1e-12);
    }

    #[test]
    fn stop_never_loosens() {
        let params = StrategyParams {
            atr_mult: 1.5,
            trail_start_r: 0.8,
            trail_dist_r: 1.0,
            ..Default::default()
        };
        let mut pos = long_position(100.0, 2.0, &params);
        apply_tick(&mut pos, 110.0, Some(55.0), &params);
        let stop_at_peak = pos.current_stop;

        // Pullback (still above the stop) must not move the stop down,
        // even with a widened RSI multiplier
        let ev = apply_tick(&mut pos, 108.0, Some(80.0), &params);
        assert_eq!(ev, PositionEvent::Unchanged);
        assert_eq!(pos.current_stop, stop_at_peak);
    }

    #[test]
    fn gap_through_stop_exits_at_open() {
        let params = StrategyParams::default();
        let mut pos = long_position(100.0, 2.0, &params);
        // Bar opens below the 97 stop: fill models the worse price
        let bar = candle(96.0, 94.0, 95.0);
        let ev = apply_candle(&mut pos, &bar, Some(50.0), &params);
        assert_eq!(
            ev,
            PositionEvent::StopHit {
                exit_price: 95.0,
                reason: ExitReason::StopHit
            }
        );
    }

    #[test]
    fn short_trailing_mirrors_long() {
        let params = StrategyParams {
            atr_mult: 1.5,
            trail_start_r: 0.8,
            trail_dist_r: 1.0,
            ..Default::default()
        };
        let stop = initial_stop(100.0, 2.0, params.atr_mult, Direction::Short);
        assert!((stop - 103.0).abs() < 1e-12);

        let mut pos = long_position(100.0, 2.0, &params);
        pos.direction = Direction::Short;
        pos.initial_stop = stop;
        pos.current_stop = stop;
        pos.trail_start = 100.0 - 3.0 * params.trail_start_r;
        pos.trail_dist = 3.0;

        apply_tick(&mut pos, 90.0, Some(45.0), &params);
        assert!(pos.trailing_active);
        assert!((pos.current_stop - 93.0).abs() < 1e-12);

        // Bounce against the short cannot loosen the stop
        apply_tick(&mut pos, 92.0, Some(45.0), &params);
        assert!((pos.current_stop - 93.0).abs() < 1e-12);
    }

    #[test]
    fn rsi_widens_trail_with_momentum() {
        let params = StrategyParams::default();
        assert_eq!(trail_multiplier(Direction::Long, Some(80.0), &params), 2.0);
        assert_eq!(trail_multiplier(Direction::Long, Some(40.0), &params), 0.8);
        assert_eq!(trail_multiplier(Direction::Long, Some(55.0), &params), 1.0);
        assert_eq!(trail_multiplier(Direction::Short, Some(20.0), &params), 2.0);
        assert_eq!(trail_multiplier(Direction::Short, Some(60.0), &params), 0.8);
        assert_eq!(trail_multiplier(Direction::Long, None, &params), 1.0);
    }

    #[test]
    fn add_on_averages_entry_and_keeps_stop() {
        let params = StrategyParams::default();
        let mut pos = long_position(100.0, 2.0, &params);
        let stop_before = pos.current_stop;
        pos.apply_add(98.0, 1.0);
        assert!((pos.entry_price - 99.0).abs() < 1e-12);
        assert_eq!(pos.quantity, 2.0);
        assert_eq!(pos.add_count, 1);
        assert_eq!(pos.current_stop, stop_before);
    }

    #[test]
    fn trade_record_pnl_sign_matches_direction() {
        let params = StrategyParams::default();
        let pos = long_position(100.0, 2.0, &params);
        let t = Utc.timestamp_opt(3600, 0).unwrap();

        let win = TradeRecord::from_close(&pos, 110.0, t, ExitReason::TrailingStop);
        assert!((win.pnl_amount - 10.0).abs() < 1e-12);
        assert!((win.pnl_percent - 10.0).abs() < 1e-12);

        let loss = TradeRecord::from_close(&pos, 97.0, t, ExitReason::StopHit);
        assert!((loss.pnl_amount + 3.0).abs() < 1e-12);
    }
}
