//! Local/exchange reconciliation
//!
//! Two concerns live here: correcting local position state against the
//! exchange's authoritative view (startup and reconnect), and the
//! rate-limited realized-PnL drift check. Position mismatches are always
//! corrected AND logged; PnL drift only warns — it usually means fees or
//! funding, not logic.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::engine::lifecycle::Position;
use crate::gateway::ExchangePosition;

/// What startup reconciliation decided
#[derive(Debug, Clone)]
pub enum ReconcileAction {
    /// Local and exchange agree
    InSync,
    /// Local says open, exchange shows nothing: correct local to flat
    ForceFlat,
    /// Exchange shows a position local state does not know: adopt it
    Adopt(ExchangePosition),
}

/// Compare the local position against exchange-reported positions for one
/// symbol. Pure so both startup and reconnect paths (and tests) share it.
pub fn diff_positions(
    symbol: &str,
    local: Option<&Position>,
    remote: &[ExchangePosition],
) -> ReconcileAction {
    let remote_match = remote.iter().find(|p| p.symbol == symbol);

    match (local, remote_match) {
        (None, None) => ReconcileAction::InSync,
        (Some(local), Some(remote)) => {
            if local.direction != remote.direction
                || (local.quantity - remote.quantity).abs() / remote.quantity.max(1e-12) > 0.01
            {
                warn!(
                    symbol,
                    local_dir = %local.direction,
                    remote_dir = %remote.direction,
                    local_qty = local.quantity,
                    remote_qty = remote.quantity,
                    "position mismatch with exchange, adopting exchange view"
                );
                return ReconcileAction::Adopt(remote.clone());
            }
            ReconcileAction::InSync
        }
        (Some(local), None) => {
            warn!(
                symbol,
                direction = %local.direction,
                entry = local.entry_price,
                "local position not present on exchange"
            );
            ReconcileAction::ForceFlat
        }
        (None, Some(remote)) => {
            info!(
                symbol,
                direction = %remote.direction,
                entry = remote.entry_price,
                qty = remote.quantity,
                "exchange reports unknown position"
            );
            ReconcileAction::Adopt(remote.clone())
        }
    }
}

/// Detected realized-PnL drift
#[derive(Debug, Clone, Copy)]
pub struct PnlDrift {
    pub local: f64,
    pub exchange: f64,
    pub diff: f64,
}

/// Rate-limited PnL drift checker.
#[derive(Debug, Clone)]
pub struct PnlReconciler {
    interval: Duration,
    /// Absolute drift that triggers a warning
    threshold: f64,
    last_check: Option<DateTime<Utc>>,
}

impl PnlReconciler {
    pub fn new(interval_secs: u64, threshold: f64) -> Self {
        Self {
            interval: Duration::seconds(interval_secs as i64),
            threshold,
            last_check: None,
        }
    }

    /// Whether a check is due now
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        match self.last_check {
            None => true,
            Some(last) => now - last >= self.interval,
        }
    }

    /// Record a comparison; returns the drift when it exceeds the
    /// threshold. Never fatal.
    pub fn check(&mut self, local: f64, exchange: f64, now: DateTime<Utc>) -> Option<PnlDrift> {
        self.last_check = Some(now);
        let diff = (local - exchange).abs();
        if diff > self.threshold {
            warn!(
                local,
                exchange,
                diff,
                threshold = self.threshold,
                "realized PnL drift beyond threshold (fees/funding mismatch likely)"
            );
            Some(PnlDrift {
                local,
                exchange,
                diff,
            })
        } else {
            None
        }
    }
}
