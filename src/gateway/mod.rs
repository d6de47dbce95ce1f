//! Exchange gateway boundary
//!
//! The engine consumes this capability set and never talks to an exchange
//! directly. Every response is decoded into a typed struct at this boundary;
//! a missing or oddly-shaped field becomes a `GatewayError::UnexpectedShape`
//! here, so the core never probes raw payloads. Errors carry an explicit
//! transient/permanent split that drives the retry policy: transient faults
//! are retried with bounded exponential backoff, permanent rejections abort
//! immediately.

pub mod paper;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::types::{Candle, Direction, Timeframe};

pub use paper::PaperGateway;

/// Which venue family an adapter implements. Selected at construction,
/// never by string comparison in the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayKind {
    BybitLike,
    BinanceLike,
    SpotOnly,
    Paper,
}

impl std::fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayKind::BybitLike => write!(f, "bybit"),
            GatewayKind::BinanceLike => write!(f, "binance"),
            GatewayKind::SpotOnly => write!(f, "spot"),
            GatewayKind::Paper => write!(f, "paper"),
        }
    }
}

/// Result of a filled market order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub client_order_id: Uuid,
    pub filled_price: f64,
    pub filled_qty: f64,
}

/// A position as the exchange reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

/// Account balance
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Balance {
    pub total: f64,
    pub available: f64,
}

/// Acknowledgement for a leverage change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeverageAck {
    Applied,
    AlreadySet,
}

/// Gateway failure taxonomy. `is_transient` decides retry eligibility.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),
    #[error("no open position for {0}")]
    NoPosition(String),

    #[error("missing field `{field}` in {endpoint} response")]
    MissingField {
        endpoint: &'static str,
        field: &'static str,
    },
    #[error("unexpected response shape from {endpoint}: {detail}")]
    UnexpectedShape {
        endpoint: &'static str,
        detail: String,
    },
}

impl GatewayError {
    /// Transient failures are worth retrying; everything else is a
    /// permanent rejection or a decode fault that a retry cannot fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_)
                | GatewayError::RateLimited(_)
                | GatewayError::Disconnected(_)
        )
    }
}

/// Capability set consumed by the engine. Implementations are per-venue;
/// the core is generic over this trait.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    async fn get_recent_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError>;

    async fn get_current_price(&self, symbol: &str) -> Result<f64, GatewayError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        client_order_id: Uuid,
    ) -> Result<OrderResult, GatewayError>;

    async fn close_position(&self, symbol: &str) -> Result<OrderResult, GatewayError>;

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<LeverageAck, GatewayError>;

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError>;

    async fn get_balance(&self) -> Result<Balance, GatewayError>;

    /// Exchange-reported realized PnL over recent history, for drift checks
    async fn get_realized_pnl(&self, symbol: &str) -> Result<f64, GatewayError>;
}

/// Bounded retry policy for transient gateway failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Run `op` under the policy: each attempt is time-bounded, transient
/// failures back off exponentially, permanent failures return immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GatewayError>>,
{
    let mut backoff = policy.initial_backoff;
    let mut last_err = None;

    for attempt in 1..=policy.max_attempts {
        let result = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(r) => r,
            Err(_) => Err(GatewayError::Timeout(policy.call_timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                warn!(
                    op = op_name,
                    attempt,
                    max = policy.max_attempts,
                    error = %e,
                    "transient gateway failure"
                );
                last_err = Some(e);
                if attempt < policy.max_attempts {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
            Err(e) => {
                warn!(op = op_name, error = %e, "permanent gateway failure, not retrying");
                return Err(e);
            }
        }
    }

    Err(last_err.expect("at least one attempt"))
}
