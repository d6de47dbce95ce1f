//! Replay determinism and no-look-ahead over a full engine run.
//!
//! The series below embeds a clean double bottom inside an established
//! uptrend, followed by a run-up and a reversal that trips the trailing
//! stop. The same data must always produce the same trades, and truncating
//! the series must never change decisions already made inside the prefix.

use chrono::{TimeZone, Utc};
use swingbot::backtest::{self, BacktestConfig};
use swingbot::config::{EngineConfig, StrategyParams};
use swingbot::types::{Candle, CandleSeries, Timeframe};

fn candle(i: usize, close: f64) -> Candle {
    Candle {
        open_time: Utc.timestamp_opt(i as i64 * 3600, 0).unwrap(),
        open: close,
        high: close + 0.3,
        low: close - 0.3,
        close,
        volume: 5.0,
    }
}

/// Uptrend, double bottom, breakout, run-up, reversal.
fn scenario_closes() -> Vec<f64> {
    let mut closes = Vec::new();

    // Established uptrend, steep enough that the H4 trend EMA stays well
    // below price through the pattern's dip, with oscillation so RSI is
    // not pinned at the top
    for i in 0..280 {
        closes.push(100.0 * (1.0 + 0.004 * i as f64) + (i as f64 * 0.9).sin() * 1.2);
    }
    let p = *closes.last().expect("non-empty");

    // W: first trough, bounce to the neckline, second trough, breakout
    for delta in [
        -1.0, -2.0, -3.0, -4.0, -5.0, // decline
        -6.5, // first trough
        -5.0, -4.0, -3.5, // bounce
        -3.0, // neckline peak
        -3.8, -4.5, -5.5, // second decline
        -6.4, // second trough (0.07% from the first)
        -5.0, -4.0, -3.2, // recovery
        -1.0, // breakout close above the neckline
    ] {
        closes.push(p + delta);
    }

    // Run-up that activates trailing
    let entry_zone = *closes.last().expect("non-empty");
    for i in 1..=12 {
        closes.push(entry_zone + i as f64 * 0.8);
    }

    // Reversal through the trailing stop
    let peak = *closes.last().expect("non-empty");
    for i in 1..=8 {
        closes.push(peak - i as f64 * 2.0);
    }

    closes
}

fn scenario_series() -> CandleSeries {
    let candles: Vec<Candle> = scenario_closes()
        .into_iter()
        .enumerate()
        .map(|(i, c)| candle(i, c))
        .collect();
    CandleSeries::from_candles(Timeframe::H1, candles).expect("ordered series")
}

fn setup() -> (StrategyParams, EngineConfig, BacktestConfig) {
    let params = StrategyParams {
        // Looser overextension gate: the scenario's trend keeps RSI high
        pullback_rsi_short: 75.0,
        ..Default::default()
    };
    let engine_cfg = EngineConfig {
        timeframe: Timeframe::H1,
        trend_timeframe: Some(Timeframe::H4),
        ..Default::default()
    };
    let bt_cfg = BacktestConfig {
        starting_capital: 10_000.0,
        slippage_pct: 0.0,
    };
    (params, engine_cfg, bt_cfg)
}

#[test]
fn scenario_produces_a_completed_trade() {
    let (params, engine_cfg, bt_cfg) = setup();
    let series = scenario_series();
    let report = backtest::run(&params, &engine_cfg, &bt_cfg, &series).unwrap();

    assert!(
        report.summary.total_trades >= 1,
        "expected at least one trade, got {}",
        report.summary.total_trades
    );
    // The trend gate only permits longs in this uptrend
    assert!(report
        .trades
        .iter()
        .all(|t| t.direction == swingbot::types::Direction::Long));
    // The double-bottom entry rides the run-up into a profitable trail exit
    assert!(
        report.trades.iter().any(|t| t.pnl_amount > 0.0),
        "expected at least one profitable trailing exit"
    );
}

#[test]
fn identical_input_produces_identical_trades() {
    let (params, engine_cfg, bt_cfg) = setup();
    let series = scenario_series();

    let a = backtest::run(&params, &engine_cfg, &bt_cfg, &series).unwrap();
    let b = backtest::run(&params, &engine_cfg, &bt_cfg, &series).unwrap();

    assert_eq!(a.trades.len(), b.trades.len());
    for (ta, tb) in a.trades.iter().zip(b.trades.iter()) {
        assert_eq!(ta.entry_time, tb.entry_time);
        assert_eq!(ta.exit_time, tb.exit_time);
        assert_eq!(ta.entry_price, tb.entry_price);
        assert_eq!(ta.exit_price, tb.exit_price);
        assert_eq!(ta.pnl_amount, tb.pnl_amount);
    }
    assert_eq!(a.final_equity, b.final_equity);
}

#[test]
fn appending_future_candles_never_changes_past_decisions() {
    let (params, engine_cfg, bt_cfg) = setup();
    let full = scenario_series();
    let full_report = backtest::run(&params, &engine_cfg, &bt_cfg, &full).unwrap();

    // Replay several truncation points; every trade fully closed inside a
    // prefix must be byte-for-byte identical to the full run's trade
    for cut in [full.len() - 3, full.len() - 6, full.len() - 10] {
        let prefix_candles = full.candles()[..cut].to_vec();
        let prefix = CandleSeries::from_candles(Timeframe::H1, prefix_candles).unwrap();
        // Exits are stamped at candle close, one bar after the last open
        let prefix_close = prefix.last().unwrap().open_time + chrono::Duration::hours(1);

        let prefix_report = backtest::run(&params, &engine_cfg, &bt_cfg, &prefix).unwrap();

        let expected: Vec<_> = full_report
            .trades
            .iter()
            .filter(|t| t.exit_time <= prefix_close)
            .collect();

        assert_eq!(
            prefix_report.trades.len(),
            expected.len(),
            "trade count diverged at cut {}",
            cut
        );
        for (got, want) in prefix_report.trades.iter().zip(expected.iter()) {
            assert_eq!(got.entry_time, want.entry_time, "entry drifted at cut {}", cut);
            assert_eq!(got.entry_price, want.entry_price);
            assert_eq!(got.exit_time, want.exit_time);
            assert_eq!(got.exit_price, want.exit_price);
        }
    }
}

#[test]
fn trades_never_overlap() {
    let (params, engine_cfg, bt_cfg) = setup();
    let series = scenario_series();
    let report = backtest::run(&params, &engine_cfg, &bt_cfg, &series).unwrap();

    for pair in report.trades.windows(2) {
        assert!(
            pair[1].entry_time >= pair[0].exit_time,
            "second position opened before the first closed"
        );
    }
}
