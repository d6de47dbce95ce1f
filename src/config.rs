//! Strategy and engine configuration
//!
//! All tuning lives in data: serde structs with defaults, persisted as
//! versioned JSON preset records. Parameter changes are preset edits,
//! never code edits.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::Timeframe;

/// Current preset schema version
pub const PRESET_VERSION: u32 = 1;

/// What drives trailing-stop evaluation while a position is open.
///
/// `PerCandle` matches the backtester's only possible cadence, so it is the
/// default: live and replay stay decision-identical. `PerTick` tightens
/// stops faster at the cost of candle-grain parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrailingTrigger {
    PerCandle,
    PerTick,
}

impl Default for TrailingTrigger {
    fn default() -> Self {
        Self::PerCandle
    }
}

/// Position sizing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompoundingMode {
    /// Size from base capital plus accumulated realized PnL
    Compound,
    /// Size from base capital only
    Fixed,
}

impl Default for CompoundingMode {
    fn default() -> Self {
        Self::Compound
    }
}

/// Strategy parameters: indicators, pattern geometry, stop management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    /// RSI lookback
    pub rsi_period: usize,
    /// ATR lookback
    pub atr_period: usize,
    /// MACD fast EMA
    pub macd_fast: usize,
    /// MACD slow EMA
    pub macd_slow: usize,
    /// MACD signal EMA
    pub macd_signal: usize,
    /// EMA period for the higher-timeframe trend filter
    pub trend_ema_period: usize,

    /// Candles on each side that must be strictly worse for a swing point
    pub swing_window: usize,
    /// Max relative distance between the two troughs/peaks of a W/M
    pub pattern_tolerance: f64,
    /// Minimum candles between the two troughs/peaks
    pub min_separation: usize,
    /// Trailing candles scanned for patterns
    pub pattern_lookback: usize,
    /// Hours a detected signal stays promotable
    pub entry_validity_hours: f64,

    /// Initial stop distance in ATRs
    pub atr_mult: f64,
    /// Favorable excursion (in R) that activates trailing
    pub trail_start_r: f64,
    /// Trailing distance (in R) behind the extreme
    pub trail_dist_r: f64,
    /// RSI below which a long pullback add-on fires
    pub pullback_rsi_long: f64,
    /// RSI above which a short pullback add-on fires
    pub pullback_rsi_short: f64,
    /// Allow pullback add-on entries
    pub enable_pullback: bool,
    /// Max add-on entries per position
    pub max_adds: u8,

    /// Exchange leverage
    pub leverage: f64,
    /// Fraction of equity allocated per position
    pub allocation: f64,
    pub compounding: CompoundingMode,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            atr_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            trend_ema_period: 20,
            swing_window: 3,
            pattern_tolerance: 0.03,   // 3% between the two extremes
            min_separation: 5,
            pattern_lookback: 120,
            entry_validity_hours: 12.0,
            atr_mult: 1.5,
            trail_start_r: 0.8,
            trail_dist_r: 0.5,
            pullback_rsi_long: 35.0,
            pullback_rsi_short: 65.0,
            enable_pullback: false,
            max_adds: 1,
            leverage: 3.0,
            allocation: 0.8,
            compounding: CompoundingMode::Compound,
        }
    }
}

impl StrategyParams {
    /// Longest indicator warmup in candles; decisions before this are refused
    pub fn min_history(&self) -> usize {
        self.rsi_period
            .max(self.atr_period)
            .max(self.macd_slow + self.macd_signal)
            + 1
    }
}

/// Engine wiring: symbol, cadences, bounds, persistence paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Symbol to trade (e.g. "BTCUSDT")
    pub symbol: String,
    /// Base (entry/pattern) timeframe
    pub timeframe: Timeframe,
    /// Trend-filter timeframe; `None` derives it from the base timeframe
    pub trend_timeframe: Option<Timeframe>,

    /// Pending-signal queue capacity
    pub queue_cap: usize,
    pub trailing_trigger: TrailingTrigger,

    /// Gateway retry attempts for transient failures
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt
    pub retry_backoff_ms: u64,
    /// Hard bound on any single gateway call
    pub call_timeout_ms: u64,

    /// Minimum seconds between PnL reconciliation checks
    pub reconcile_interval_secs: u64,
    /// Realized-PnL drift (as a fraction of base capital) that logs a warning
    pub pnl_drift_warn: f64,
    /// Fallback stop distance when adopting an external position without
    /// enough history for an ATR stop
    pub adopt_fallback_stop_pct: f64,

    pub snapshot_path: PathBuf,
    pub ledger_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M15,
            trend_timeframe: None,
            queue_cap: 100,
            trailing_trigger: TrailingTrigger::default(),
            max_retries: 3,
            retry_backoff_ms: 500,
            call_timeout_ms: 10_000,
            reconcile_interval_secs: 900, // 15 minutes
            pnl_drift_warn: 0.01,
            adopt_fallback_stop_pct: 0.01,
            snapshot_path: PathBuf::from("data/state/engine_snapshot.json"),
            ledger_path: PathBuf::from("data/state/trades.jsonl"),
        }
    }
}

impl EngineConfig {
    pub fn trend_timeframe(&self) -> Timeframe {
        self.trend_timeframe
            .unwrap_or_else(|| self.timeframe.trend_filter())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// A named, versioned bundle of parameters stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetRecord {
    pub version: u32,
    pub name: String,
    pub params: StrategyParams,
    pub engine: EngineConfig,
}

impl PresetRecord {
    pub fn new(name: &str, params: StrategyParams, engine: EngineConfig) -> Self {
        Self {
            version: PRESET_VERSION,
            name: name.to_string(),
            params,
            engine,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read preset {}", path.display()))?;
        let preset: PresetRecord =
            serde_json::from_str(&raw).with_context(|| "failed to parse preset JSON")?;
        if preset.version > PRESET_VERSION {
            anyhow::bail!(
                "preset {} has version {} (supported: {})",
                preset.name,
                preset.version,
                PRESET_VERSION
            );
        }
        Ok(preset)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write preset {}", path.display()))?;
        Ok(())
    }
}
