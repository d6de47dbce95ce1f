//! Decision engine
//!
//! `DecisionCore` is the broker-agnostic trading core used by both:
//! - the backtester, which drives it synchronously over historical candles
//! - the live loop, which drives it from streamed candle closes and ticks
//!
//! It owns every decision: pattern detection, signal queueing, entry
//! promotion, stop management, and capital accounting. It performs no I/O
//! and never talks to an exchange — it emits `EngineAction`s that the caller
//! executes and confirms back. Identical candle input therefore yields
//! identical decisions in both execution modes.

pub mod capital;
pub mod lifecycle;
pub mod live;
pub mod reconcile;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, StrategyParams, TrailingTrigger};
use crate::gateway::{ExchangePosition, OrderResult};
use crate::indicators::{IndicatorEngine, IndicatorSnapshot};
use crate::signal::{PatternDetector, PendingSignal, SignalQueue, Trend, TrendFilter};
use crate::types::{Appended, Candle, CandleSeries, Direction};

pub use capital::CapitalState;
pub use lifecycle::{
    ExitReason, LifecycleState, Position, PositionEvent, TradeRecord, TradeSource,
};

/// A decision the caller must execute against the gateway
#[derive(Debug, Clone)]
pub enum EngineAction {
    /// Submit a market entry for a promoted signal
    OpenPosition {
        direction: Direction,
        quantity: f64,
        client_order_id: Uuid,
    },
    /// Submit a pullback add-on to the open position
    AddToPosition {
        direction: Direction,
        quantity: f64,
    },
    /// Close the open position at market
    ClosePosition {
        reason: ExitReason,
        /// Price the decision model assumed; live fills may differ
        model_exit_price: f64,
    },
}

/// Entry decision awaiting fill confirmation
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub signal: PendingSignal,
    pub quantity: f64,
    pub atr: f64,
    pub client_order_id: Uuid,
}

/// The single-writer decision state for one symbol.
pub struct DecisionCore {
    params: StrategyParams,
    cfg: EngineConfig,
    series: CandleSeries,
    indicators: IndicatorEngine,
    last_snapshot: Option<IndicatorSnapshot>,
    detector: PatternDetector,
    trend_filter: TrendFilter,
    queue: SignalQueue,
    position: Option<Position>,
    pending_entry: Option<PendingEntry>,
    capital: CapitalState,
    /// Venue family stamped onto positions and trades; set by the live
    /// loop from its gateway, stays `Paper` in backtests
    exchange_kind: crate::gateway::GatewayKind,
    /// High-water mark from a restored snapshot. Candles at or before this
    /// were already applied to the position pre-restart; replaying them
    /// against the current (later-ratcheted) stop would fake exits.
    processed_until: Option<DateTime<Utc>>,
}

impl DecisionCore {
    pub fn new(params: StrategyParams, cfg: EngineConfig, capital: CapitalState) -> Self {
        let detector = PatternDetector::new(&params);
        let trend_filter = TrendFilter::new(cfg.trend_timeframe(), params.trend_ema_period);
        let queue = SignalQueue::new(cfg.queue_cap);
        let indicators = IndicatorEngine::new(&params);
        let series = CandleSeries::new(cfg.timeframe);
        Self {
            params,
            cfg,
            series,
            indicators,
            last_snapshot: None,
            detector,
            trend_filter,
            queue,
            position: None,
            pending_entry: None,
            capital,
            exchange_kind: crate::gateway::GatewayKind::Paper,
            processed_until: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        if self.pending_entry.is_some() {
            LifecycleState::PendingEntry
        } else {
            match &self.position {
                Some(p) if p.trailing_active => LifecycleState::Trailing,
                Some(_) => LifecycleState::Open,
                None => LifecycleState::Flat,
            }
        }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn capital(&self) -> &CapitalState {
        &self.capital
    }

    /// Replace capital state (used after ledger replay at startup)
    pub fn set_capital(&mut self, capital: CapitalState) {
        self.capital = capital;
    }

    pub fn pending_signals(&self) -> Vec<PendingSignal> {
        self.queue.entries()
    }

    pub fn last_open_time(&self) -> Option<DateTime<Utc>> {
        self.series.last().map(|c| c.open_time)
    }

    pub fn last_close(&self) -> Option<f64> {
        self.series.last().map(|c| c.close)
    }

    /// Restore persisted state after a restart. History must be re-seeded
    /// separately; indicator state rebuilds from the seeded candles while
    /// position management only resumes after `last_open_time`.
    pub fn restore(
        &mut self,
        position: Option<Position>,
        pending: Vec<PendingSignal>,
        last_open_time: Option<DateTime<Utc>>,
    ) {
        self.position = position;
        self.queue = SignalQueue::restore(self.cfg.queue_cap, pending);
        self.processed_until = last_open_time;
    }

    /// Feed historical candles without making new entry decisions. Stop
    /// management still runs: a stop breached while the engine was down must
    /// surface as an exit action.
    pub fn seed_history(&mut self, candles: &[Candle]) -> anyhow::Result<Vec<EngineAction>> {
        let mut actions = Vec::new();
        for candle in candles {
            actions.extend(self.process(candle, false)?);
        }
        Ok(actions)
    }

    /// Process one closed candle. Returns the actions to execute. A
    /// redelivered open_time is a no-op.
    pub fn on_candle_close(&mut self, candle: &Candle) -> anyhow::Result<Vec<EngineAction>> {
        self.process(candle, true)
    }

    fn process(&mut self, candle: &Candle, decide: bool) -> anyhow::Result<Vec<EngineAction>> {
        if self.series.push(candle.clone())? == Appended::Duplicate {
            debug!(
                symbol = %self.cfg.symbol,
                open_time = %candle.open_time,
                "candle close redelivered, ignoring"
            );
            return Ok(Vec::new());
        }

        let snapshot = self.indicators.update(candle);
        self.last_snapshot = Some(snapshot);
        let close_time = candle.open_time + self.cfg.timeframe.duration();
        let mut actions = Vec::new();

        // 1. Manage the open position against this candle's range, unless
        // this candle was already applied before a restart
        let already_applied = self
            .processed_until
            .is_some_and(|t| candle.open_time <= t);
        let mut stop_hit = false;
        if !already_applied {
            if let Some(position) = self.position.as_mut() {
                match lifecycle::apply_candle(position, candle, snapshot.rsi, &self.params) {
                    PositionEvent::StopHit { exit_price, reason } => {
                        info!(
                            symbol = %self.cfg.symbol,
                            %reason,
                            exit_price,
                            "stop breached"
                        );
                        stop_hit = true;
                        actions.push(EngineAction::ClosePosition {
                            reason,
                            model_exit_price: exit_price,
                        });
                    }
                    PositionEvent::StopRaised { new_stop } => {
                        debug!(symbol = %self.cfg.symbol, new_stop, "trailing stop ratcheted");
                    }
                    PositionEvent::Unchanged => {}
                }
            }
        }

        // Pullback add-on: only while the position survives this candle
        if decide && !stop_hit && self.position.is_some() {
            if let Some(action) = self.maybe_add(snapshot, candle) {
                actions.push(action);
            }
        }

        // 2. Pattern detection runs every cycle so queue state is identical
        // across modes regardless of position state
        if let Some(pattern) = self.detector.detect(&self.series) {
            info!(
                symbol = %self.cfg.symbol,
                pattern = %pattern.kind,
                direction = %pattern.direction,
                neckline = pattern.neckline,
                "pattern confirmed"
            );
            self.queue
                .enqueue(PendingSignal::from_match(&pattern, self.params.entry_validity_hours));
        }

        // 3. Expiry sweep, once per candle-close cycle
        self.queue.sweep(close_time);

        // 4. Entry promotion only from a flat book
        if decide && self.position.is_none() && self.pending_entry.is_none() {
            if let Some(action) = self.try_promote() {
                actions.push(action);
            }
        }

        Ok(actions)
    }

    fn maybe_add(&mut self, snapshot: IndicatorSnapshot, candle: &Candle) -> Option<EngineAction> {
        if !self.params.enable_pullback {
            return None;
        }
        let position = self.position.as_ref()?;
        if position.add_count >= self.params.max_adds {
            return None;
        }
        let rsi = snapshot.rsi?;
        let pullback = match position.direction {
            Direction::Long => rsi < self.params.pullback_rsi_long,
            Direction::Short => rsi > self.params.pullback_rsi_short,
        };
        if !pullback {
            return None;
        }
        let quantity = self.capital.position_quantity(candle.close, &self.params)
            / (self.params.max_adds as f64 + 1.0);
        if quantity <= 0.0 {
            return None;
        }
        info!(
            symbol = %self.cfg.symbol,
            rsi,
            direction = %position.direction,
            "pullback add-on"
        );
        Some(EngineAction::AddToPosition {
            direction: position.direction,
            quantity,
        })
    }

    fn try_promote(&mut self) -> Option<EngineAction> {
        let snapshot = self.last_snapshot?;
        // Insufficient history: refuse to decide rather than guess
        if !snapshot.is_warm() {
            return None;
        }
        let atr = snapshot.atr?;
        let rsi = snapshot.rsi?;
        let trend = self.trend_filter.trend(&self.series);

        let params = &self.params;
        let signal = self.queue.promote(|s| match s.direction {
            // Trend alignment plus an overextension guard on RSI
            Direction::Long => trend == Trend::Up && rsi < params.pullback_rsi_short,
            Direction::Short => trend == Trend::Down && rsi > params.pullback_rsi_long,
        })?;

        let price = self.series.last()?.close;
        let quantity = self.capital.position_quantity(price, &self.params);
        if quantity <= 0.0 {
            warn!(symbol = %self.cfg.symbol, "no capital available, dropping signal");
            return None;
        }

        let client_order_id = Uuid::new_v4();
        info!(
            symbol = %self.cfg.symbol,
            fingerprint = %signal.fingerprint,
            direction = %signal.direction,
            %trend,
            rsi,
            price,
            "signal promoted, submitting entry"
        );
        let direction = signal.direction;
        self.pending_entry = Some(PendingEntry {
            signal,
            quantity,
            atr,
            client_order_id,
        });
        Some(EngineAction::OpenPosition {
            direction,
            quantity,
            client_order_id,
        })
    }

    /// Per-tick trailing evaluation. Inactive unless configured; candle
    /// closes remain the only entry trigger either way.
    pub fn on_tick(&mut self, price: f64, _time: DateTime<Utc>) -> Vec<EngineAction> {
        if self.cfg.trailing_trigger != TrailingTrigger::PerTick {
            return Vec::new();
        }
        let Some(position) = &mut self.position else {
            return Vec::new();
        };
        let rsi = self.last_snapshot.and_then(|s| s.rsi);
        match lifecycle::apply_tick(position, price, rsi, &self.params) {
            PositionEvent::StopHit { exit_price, reason } => {
                info!(symbol = %self.cfg.symbol, %reason, exit_price, "stop breached on tick");
                vec![EngineAction::ClosePosition {
                    reason,
                    model_exit_price: exit_price,
                }]
            }
            PositionEvent::StopRaised { new_stop } => {
                debug!(symbol = %self.cfg.symbol, new_stop, "trailing stop ratcheted on tick");
                Vec::new()
            }
            PositionEvent::Unchanged => Vec::new(),
        }
    }

    /// Entry fill confirmed by the gateway: `PendingEntry → Open`.
    pub fn confirm_entry(&mut self, fill: &OrderResult, time: DateTime<Utc>) {
        let Some(ctx) = self.pending_entry.take() else {
            warn!(symbol = %self.cfg.symbol, "entry fill without pending entry, ignoring");
            return;
        };
        let direction = ctx.signal.direction;
        let stop = lifecycle::initial_stop(fill.filled_price, ctx.atr, self.params.atr_mult, direction);
        let risk = (fill.filled_price - stop).abs();

        info!(
            symbol = %self.cfg.symbol,
            %direction,
            entry = fill.filled_price,
            stop,
            qty = fill.filled_qty,
            "position opened"
        );
        self.position = Some(Position {
            symbol: self.cfg.symbol.clone(),
            exchange: self.cfg_exchange(),
            direction,
            entry_price: fill.filled_price,
            quantity: fill.filled_qty,
            initial_stop: stop,
            current_stop: stop,
            extreme_price: fill.filled_price,
            trailing_active: false,
            opened_at: time,
            client_order_id: ctx.client_order_id,
            source: TradeSource::Signal,
            trail_start: fill.filled_price + direction.sign() * risk * self.params.trail_start_r,
            trail_dist: risk * self.params.trail_dist_r,
            add_count: 0,
        });
    }

    /// Entry rejected or timed out: `PendingEntry → Flat`. The signal is
    /// discarded, not re-queued — re-chasing a failed entry duplicates risk.
    pub fn abort_entry(&mut self, reason: &str) {
        if let Some(ctx) = self.pending_entry.take() {
            warn!(
                symbol = %self.cfg.symbol,
                fingerprint = %ctx.signal.fingerprint,
                reason,
                "entry aborted, signal discarded"
            );
        }
    }

    /// Add-on fill confirmed
    pub fn confirm_add(&mut self, fill: &OrderResult) {
        if let Some(position) = &mut self.position {
            position.apply_add(fill.filled_price, fill.filled_qty);
            info!(
                symbol = %self.cfg.symbol,
                avg_entry = position.entry_price,
                qty = position.quantity,
                "add-on filled"
            );
        }
    }

    /// Exit fill confirmed: emit the trade record and return to `Flat`.
    pub fn confirm_exit(
        &mut self,
        exit_price: f64,
        reason: ExitReason,
        time: DateTime<Utc>,
    ) -> Option<TradeRecord> {
        let position = self.position.take()?;
        let record = TradeRecord::from_close(&position, exit_price, time, reason);
        self.capital.apply_pnl(record.pnl_amount);
        info!(
            symbol = %self.cfg.symbol,
            %reason,
            exit_price,
            pnl = record.pnl_amount,
            pnl_pct = record.pnl_percent,
            cumulative = self.capital.cumulative_realized_pnl,
            "position closed"
        );
        Some(record)
    }

    /// Adopt a position the exchange reports but local state does not know:
    /// synchronized into `Open` with a stop recomputed from current data.
    pub fn adopt_external(&mut self, remote: &ExchangePosition, now: DateTime<Utc>) {
        let atr = self.last_snapshot.and_then(|s| s.atr);
        let stop = match atr {
            Some(atr) => lifecycle::initial_stop(
                remote.entry_price,
                atr,
                self.params.atr_mult,
                remote.direction,
            ),
            None => {
                // Not enough history for an ATR stop yet
                remote.entry_price
                    * (1.0 - remote.direction.sign() * self.cfg.adopt_fallback_stop_pct)
            }
        };
        let risk = (remote.entry_price - stop).abs();

        info!(
            symbol = %remote.symbol,
            direction = %remote.direction,
            entry = remote.entry_price,
            qty = remote.quantity,
            stop,
            atr_based = atr.is_some(),
            "external position adopted"
        );
        self.position = Some(Position {
            symbol: remote.symbol.clone(),
            exchange: self.cfg_exchange(),
            direction: remote.direction,
            entry_price: remote.entry_price,
            quantity: remote.quantity,
            initial_stop: stop,
            current_stop: stop,
            extreme_price: remote.entry_price,
            trailing_active: false,
            opened_at: now,
            client_order_id: Uuid::new_v4(),
            source: TradeSource::External,
            trail_start: remote.entry_price
                + remote.direction.sign() * risk * self.params.trail_start_r,
            trail_dist: risk * self.params.trail_dist_r,
            add_count: 0,
        });
    }

    /// Reconciliation-forced closure: the exchange shows no position, so
    /// local `Open` state is wrong. Emits a trade record at the best known
    /// price and corrects to `Flat`.
    pub fn force_flat(&mut self, now: DateTime<Utc>) -> Option<TradeRecord> {
        let position = self.position.take()?;
        let exit_price = self.last_close().unwrap_or(position.entry_price);
        let record =
            TradeRecord::from_close(&position, exit_price, now, ExitReason::Reconciliation);
        self.capital.apply_pnl(record.pnl_amount);
        warn!(
            symbol = %position.symbol,
            exit_price,
            "local position closed by reconciliation"
        );
        Some(record)
    }

    fn cfg_exchange(&self) -> crate::gateway::GatewayKind {
        self.exchange_kind
    }

    pub fn set_exchange_kind(&mut self, kind: crate::gateway::GatewayKind) {
        self.exchange_kind = kind;
    }
}
