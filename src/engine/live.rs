//! Live trading loop
//!
//! One task owns the `DecisionCore` and therefore all Position and capital
//! mutation. Candle closes and price ticks arrive as `EngineEvent`s on a
//! bounded channel — feed tasks and gateway callbacks never touch engine
//! state directly, which keeps every lifecycle transition linearizable.
//!
//! Around every transition the engine snapshot is durably written before
//! the gateway side effect and again after it, so recovery always finds a
//! state no older than the last attempted transition.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{EngineConfig, StrategyParams};
use crate::engine::capital::CapitalState;
use crate::engine::reconcile::{diff_positions, PnlReconciler, ReconcileAction};
use crate::engine::{DecisionCore, EngineAction, ExitReason};
use crate::gateway::{with_retry, ExchangeGateway, GatewayError, RetryPolicy};
use crate::store::{EngineSnapshot, SnapshotStore, TradeLedger};
use crate::types::Candle;

/// Events delivered into the sequencing task
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A candle closed on the base timeframe (exactly-once intent; the
    /// core is idempotent under redelivery)
    CandleClosed(Candle),
    /// A price observation between closes
    PriceTick { price: f64, time: DateTime<Utc> },
    /// Graceful stop: finish the in-flight snapshot, then exit
    Shutdown,
}

/// Bounded event channel wiring feed tasks to the engine
pub fn event_channel(bound: usize) -> (mpsc::Sender<EngineEvent>, mpsc::Receiver<EngineEvent>) {
    mpsc::channel(bound)
}

/// The live engine: decision core + gateway + durable state.
pub struct LiveEngine {
    core: DecisionCore,
    gateway: Arc<dyn ExchangeGateway>,
    snapshots: SnapshotStore,
    ledger: TradeLedger,
    events: mpsc::Receiver<EngineEvent>,
    policy: RetryPolicy,
    pnl_reconciler: PnlReconciler,
    cfg: EngineConfig,
    params: StrategyParams,
    base_capital: f64,
    /// Running sum of ledgered realized PnL (rebuilt at startup)
    realized_sum: f64,
}

impl LiveEngine {
    pub fn new(
        params: StrategyParams,
        cfg: EngineConfig,
        base_capital: f64,
        gateway: Arc<dyn ExchangeGateway>,
        events: mpsc::Receiver<EngineEvent>,
    ) -> Result<Self> {
        let snapshots = SnapshotStore::new(&cfg.snapshot_path)?;
        let ledger = TradeLedger::new(&cfg.ledger_path)?;
        let policy = RetryPolicy {
            max_attempts: cfg.max_retries,
            initial_backoff: cfg.retry_backoff(),
            call_timeout: cfg.call_timeout(),
        };
        let pnl_reconciler = PnlReconciler::new(
            cfg.reconcile_interval_secs,
            cfg.pnl_drift_warn * base_capital,
        );
        let capital = CapitalState::new(base_capital, params.compounding);
        let mut core = DecisionCore::new(params.clone(), cfg.clone(), capital);
        core.set_exchange_kind(gateway.kind());

        Ok(Self {
            core,
            gateway,
            snapshots,
            ledger,
            events,
            policy,
            pnl_reconciler,
            cfg,
            params,
            base_capital,
            realized_sum: 0.0,
        })
    }

    /// Recover durable state, re-seed market history, and reconcile against
    /// the exchange's authoritative view.
    pub async fn startup(&mut self) -> Result<()> {
        let now = Utc::now();

        // Capital truth comes from replaying the ledger, not the snapshot
        let trades = self.ledger.replay()?;
        self.realized_sum = trades.iter().map(|t| t.pnl_amount).sum();
        let capital = CapitalState::replay(self.base_capital, self.params.compounding, &trades);
        info!(
            realized = capital.cumulative_realized_pnl,
            trades = trades.len(),
            "capital rebuilt from ledger"
        );
        self.core.set_capital(capital);

        if let Some(snapshot) = self.snapshots.load()? {
            info!(seq = snapshot.seq, "snapshot loaded");
            self.core
                .restore(snapshot.position, snapshot.pending, snapshot.last_open_time);
        }

        // Leverage is idempotent; AlreadySet is success
        let symbol = self.cfg.symbol.clone();
        let leverage = self.params.leverage;
        let gateway = self.gateway.clone();
        with_retry(&self.policy, "set_leverage", || {
            let gateway = gateway.clone();
            let symbol = symbol.clone();
            async move { gateway.set_leverage(&symbol, leverage).await }
        })
        .await
        .context("failed to set leverage")?;

        // Seed enough closed candles to warm indicators and the detector
        let limit = (self.params.min_history() + self.params.pattern_lookback).max(200);
        let timeframe = self.cfg.timeframe;
        let gateway = self.gateway.clone();
        let symbol = self.cfg.symbol.clone();
        let candles = with_retry(&self.policy, "get_recent_candles", || {
            let gateway = gateway.clone();
            let symbol = symbol.clone();
            async move { gateway.get_recent_candles(&symbol, timeframe, limit).await }
        })
        .await
        .context("failed to fetch candle history")?;

        let seed_actions = self.core.seed_history(&candles)?;
        info!(candles = candles.len(), "history seeded");

        self.reconcile_positions(now).await?;

        // A stop breached while the engine was down exits now
        self.execute_actions(seed_actions, now).await?;

        self.persist()?;
        info!(state = %self.core.state(), "startup complete");
        Ok(())
    }

    /// Correct local position state against the exchange.
    async fn reconcile_positions(&mut self, now: DateTime<Utc>) -> Result<()> {
        let gateway = self.gateway.clone();
        let positions = with_retry(&self.policy, "get_positions", || {
            let gateway = gateway.clone();
            async move { gateway.get_positions().await }
        })
        .await
        .context("failed to fetch exchange positions")?;

        match diff_positions(&self.cfg.symbol, self.core.position(), &positions) {
            ReconcileAction::InSync => {}
            ReconcileAction::ForceFlat => {
                if let Some(record) = self.core.force_flat(now) {
                    self.append_trade(&record)?;
                }
            }
            ReconcileAction::Adopt(remote) => {
                // A mismatched local position is ledgered out first
                if self.core.position().is_some() {
                    if let Some(record) = self.core.force_flat(now) {
                        self.append_trade(&record)?;
                    }
                }
                self.core.adopt_external(&remote, now);
            }
        }
        Ok(())
    }

    /// Run until the channel closes or a shutdown event arrives.
    pub async fn run(&mut self) -> Result<()> {
        info!(symbol = %self.cfg.symbol, timeframe = %self.cfg.timeframe, "engine running");
        while let Some(event) = self.events.recv().await {
            match event {
                EngineEvent::CandleClosed(candle) => {
                    let now = candle.open_time + self.cfg.timeframe.duration();
                    match self.core.on_candle_close(&candle) {
                        Ok(actions) => self.execute_actions(actions, now).await?,
                        Err(e) => {
                            // Malformed ordering is a data error: reject the
                            // candle, never guess
                            error!(error = %e, "rejected candle close");
                        }
                    }
                    self.maybe_reconcile_pnl(now).await;
                }
                EngineEvent::PriceTick { price, time } => {
                    let actions = self.core.on_tick(price, time);
                    self.execute_actions(actions, time).await?;
                }
                EngineEvent::Shutdown => {
                    info!("shutdown requested, completing final snapshot");
                    self.persist()?;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Execute decisions against the gateway, snapshotting around each
    /// transition.
    async fn execute_actions(
        &mut self,
        actions: Vec<EngineAction>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for action in actions {
            self.persist()?;
            match action {
                EngineAction::OpenPosition {
                    direction,
                    quantity,
                    client_order_id,
                } => {
                    let gateway = self.gateway.clone();
                    let symbol = self.cfg.symbol.clone();
                    let result = with_retry(&self.policy, "place_market_order", || {
                        let gateway = gateway.clone();
                        let symbol = symbol.clone();
                        async move {
                            gateway
                                .place_market_order(&symbol, direction, quantity, client_order_id)
                                .await
                        }
                    })
                    .await;

                    match result {
                        Ok(fill) => self.core.confirm_entry(&fill, now),
                        Err(e) => {
                            if e.is_transient() {
                                error!(error = %e, "entry failed after retries");
                            }
                            self.core.abort_entry(&e.to_string());
                        }
                    }
                }
                EngineAction::AddToPosition {
                    direction,
                    quantity,
                } => {
                    let gateway = self.gateway.clone();
                    let symbol = self.cfg.symbol.clone();
                    let client_order_id = uuid::Uuid::new_v4();
                    let result = with_retry(&self.policy, "place_market_order(add)", || {
                        let gateway = gateway.clone();
                        let symbol = symbol.clone();
                        async move {
                            gateway
                                .place_market_order(&symbol, direction, quantity, client_order_id)
                                .await
                        }
                    })
                    .await;

                    match result {
                        Ok(fill) => self.core.confirm_add(&fill),
                        // Add-ons are opportunistic; a failure never
                        // endangers the base position
                        Err(e) => warn!(error = %e, "add-on entry failed, continuing"),
                    }
                }
                EngineAction::ClosePosition { reason, .. } => {
                    let gateway = self.gateway.clone();
                    let symbol = self.cfg.symbol.clone();
                    let result = with_retry(&self.policy, "close_position", || {
                        let gateway = gateway.clone();
                        let symbol = symbol.clone();
                        async move { gateway.close_position(&symbol).await }
                    })
                    .await;

                    match result {
                        Ok(fill) => {
                            if let Some(record) =
                                self.core.confirm_exit(fill.filled_price, reason, now)
                            {
                                self.append_trade(&record)?;
                            }
                        }
                        Err(GatewayError::NoPosition(_)) => {
                            // The exchange already considers us flat; align
                            // local state and ledger the discrepancy
                            warn!("close found no exchange position, reconciling to flat");
                            if let Some(record) = self.core.force_flat(now) {
                                self.append_trade(&record)?;
                            }
                        }
                        Err(e) => {
                            error!(
                                error = %e,
                                state = %self.core.state(),
                                "FAILED TO CLOSE POSITION - manual attention required"
                            );
                        }
                    }
                }
            }
            self.persist()?;
        }
        Ok(())
    }

    async fn maybe_reconcile_pnl(&mut self, now: DateTime<Utc>) {
        if !self.pnl_reconciler.due(now) {
            return;
        }
        let gateway = self.gateway.clone();
        let symbol = self.cfg.symbol.clone();
        let result = with_retry(&self.policy, "get_realized_pnl", || {
            let gateway = gateway.clone();
            let symbol = symbol.clone();
            async move { gateway.get_realized_pnl(&symbol).await }
        })
        .await;

        match result {
            Ok(exchange_pnl) => {
                self.pnl_reconciler.check(self.realized_sum, exchange_pnl, now);
            }
            // Drift checking is advisory; a failed fetch only warns
            Err(e) => warn!(error = %e, "PnL reconciliation fetch failed"),
        }
    }

    fn append_trade(&mut self, record: &crate::engine::TradeRecord) -> Result<()> {
        self.ledger.append(record)?;
        self.realized_sum += record.pnl_amount;
        Ok(())
    }

    fn persist(&mut self) -> Result<()> {
        self.snapshots.save(EngineSnapshot {
            seq: 0, // assigned by the store
            position: self.core.position().cloned(),
            pending: self.core.pending_signals(),
            capital: self.core.capital().clone(),
            last_open_time: self.core.last_open_time(),
        })?;
        Ok(())
    }

    pub fn core(&self) -> &DecisionCore {
        &self.core
    }

    /// Operator-requested flatten (CLI interrupt path)
    pub async fn flatten(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.core.position().is_none() {
            return Ok(());
        }
        let price = self.core.last_close().unwrap_or(0.0);
        self.execute_actions(
            vec![EngineAction::ClosePosition {
                reason: ExitReason::Manual,
                model_exit_price: price,
            }],
            now,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TradeSource;
    use crate::gateway::PaperGateway;
    use crate::types::{Direction, Timeframe};
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn tmp_cfg(name: &str) -> EngineConfig {
        let dir = std::env::temp_dir().join("swingbot_live_tests").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        EngineConfig {
            timeframe: Timeframe::H1,
            snapshot_path: dir.join("snapshot.json"),
            ledger_path: dir.join("trades.jsonl"),
            retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    fn history(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.3).sin() * 2.0;
                Candle {
                    open_time: Utc.timestamp_opt(i as i64 * 3600, 0).unwrap(),
                    open: close,
                    high: close + 0.5,
                    low: close - 0.5,
                    close,
                    volume: 1.0,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn startup_adopts_external_position() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        gateway.set_mark_price(100.0);
        gateway.set_candle_history(history(60));
        gateway.seed_external_position("BTCUSDT", Direction::Long, 100.0, 2.0);

        let (_tx, rx) = event_channel(16);
        let mut engine = LiveEngine::new(
            StrategyParams::default(),
            tmp_cfg("adopt"),
            10_000.0,
            gateway,
            rx,
        )
        .unwrap();
        engine.startup().await.unwrap();

        let position = engine.core().position().expect("adopted position");
        assert_eq!(position.source, TradeSource::External);
        assert_eq!(position.quantity, 2.0);
        // Stop came from ATR over the seeded history
        assert!(position.initial_stop < 100.0);
    }

    #[tokio::test]
    async fn shutdown_persists_final_snapshot() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        gateway.set_mark_price(100.0);
        gateway.set_candle_history(history(60));

        let cfg = tmp_cfg("shutdown");
        let snapshot_path = cfg.snapshot_path.clone();
        let (tx, rx) = event_channel(16);
        let mut engine =
            LiveEngine::new(StrategyParams::default(), cfg, 10_000.0, gateway, rx).unwrap();
        engine.startup().await.unwrap();

        tx.send(EngineEvent::Shutdown).await.unwrap();
        engine.run().await.unwrap();

        assert!(PathBuf::from(snapshot_path).exists());
    }

    #[tokio::test]
    async fn stale_local_position_forced_flat_on_startup() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        gateway.set_mark_price(100.0);
        gateway.set_candle_history(history(60));

        let cfg = tmp_cfg("force_flat");
        // First session: persist a snapshot claiming an open position
        {
            let mut store = SnapshotStore::new(&cfg.snapshot_path).unwrap();
            let position = crate::engine::Position {
                symbol: "BTCUSDT".to_string(),
                exchange: crate::gateway::GatewayKind::Paper,
                direction: Direction::Long,
                entry_price: 100.0,
                quantity: 1.0,
                initial_stop: 97.0,
                current_stop: 97.0,
                extreme_price: 100.0,
                trailing_active: false,
                opened_at: Utc.timestamp_opt(0, 0).unwrap(),
                client_order_id: uuid::Uuid::new_v4(),
                source: TradeSource::Signal,
                trail_start: 102.4,
                trail_dist: 3.0,
                add_count: 0,
            };
            store
                .save(EngineSnapshot {
                    seq: 0,
                    position: Some(position),
                    pending: Vec::new(),
                    capital: CapitalState::new(10_000.0, Default::default()),
                    last_open_time: None,
                })
                .unwrap();
        }

        // Second session: the exchange shows no position
        let (_tx, rx) = event_channel(16);
        let mut engine =
            LiveEngine::new(StrategyParams::default(), cfg, 10_000.0, gateway, rx).unwrap();
        engine.startup().await.unwrap();

        assert!(engine.core().position().is_none());
        // The forced closure was ledgered
        let trades = engine.ledger.replay().unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::Reconciliation);
    }
}
