//! Paper trading venue
//!
//! A deterministic in-process exchange used by paper-live mode and the test
//! suite. Fills are immediate at the current mark price plus a fixed
//! slippage, balances settle on close, and failure injection lets tests
//! exercise the retry and reconciliation paths.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::types::{Candle, Direction, Timeframe};

use super::{
    Balance, ExchangeGateway, ExchangePosition, GatewayError, GatewayKind, LeverageAck,
    OrderResult,
};

#[derive(Debug, Clone)]
struct PaperPosition {
    symbol: String,
    direction: Direction,
    entry_price: f64,
    quantity: f64,
}

#[derive(Debug)]
struct PaperBook {
    mark_price: f64,
    balance: f64,
    leverage: f64,
    position: Option<PaperPosition>,
    realized_pnl: f64,
    candle_history: Vec<Candle>,
    /// Errors to return before the next successful call, FIFO
    injected_failures: VecDeque<GatewayError>,
    order_seq: u64,
}

/// Simulated venue with an adjustable mark price.
pub struct PaperGateway {
    book: Mutex<PaperBook>,
    /// Fraction applied against the trade on every fill
    slippage_pct: f64,
}

impl PaperGateway {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                mark_price: 0.0,
                balance: starting_balance,
                leverage: 1.0,
                position: None,
                realized_pnl: 0.0,
                candle_history: Vec::new(),
                injected_failures: VecDeque::new(),
                order_seq: 0,
            }),
            slippage_pct: 0.0,
        }
    }

    pub fn with_slippage(mut self, slippage_pct: f64) -> Self {
        self.slippage_pct = slippage_pct;
        self
    }

    /// Move the simulated mark price (driven by the replay feed)
    pub fn set_mark_price(&self, price: f64) {
        self.book.lock().expect("paper book lock").mark_price = price;
    }

    /// Provide candle history served by `get_recent_candles`
    pub fn set_candle_history(&self, candles: Vec<Candle>) {
        self.book.lock().expect("paper book lock").candle_history = candles;
    }

    /// Queue an error to be returned by the next gateway call
    pub fn inject_failure(&self, err: GatewayError) {
        self.book
            .lock()
            .expect("paper book lock")
            .injected_failures
            .push_back(err);
    }

    /// Seed a position the engine does not know about (recovery tests)
    pub fn seed_external_position(&self, symbol: &str, direction: Direction, entry: f64, qty: f64) {
        let mut book = self.book.lock().expect("paper book lock");
        book.position = Some(PaperPosition {
            symbol: symbol.to_string(),
            direction,
            entry_price: entry,
            quantity: qty,
        });
    }

    fn take_injected(&self) -> Option<GatewayError> {
        self.book
            .lock()
            .expect("paper book lock")
            .injected_failures
            .pop_front()
    }

    fn fill_price(&self, mark: f64, direction: Direction) -> f64 {
        // Slippage always works against the trade
        mark * (1.0 + direction.sign() * self.slippage_pct)
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Paper
    }

    async fn get_recent_candles(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let book = self.book.lock().expect("paper book lock");
        let start = book.candle_history.len().saturating_sub(limit);
        Ok(book.candle_history[start..].to_vec())
    }

    async fn get_current_price(&self, _symbol: &str) -> Result<f64, GatewayError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let book = self.book.lock().expect("paper book lock");
        if book.mark_price <= 0.0 {
            return Err(GatewayError::UnexpectedShape {
                endpoint: "ticker",
                detail: "no mark price yet".to_string(),
            });
        }
        Ok(book.mark_price)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        client_order_id: Uuid,
    ) -> Result<OrderResult, GatewayError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        if quantity <= 0.0 {
            return Err(GatewayError::InvalidRequest(format!(
                "non-positive quantity {}",
                quantity
            )));
        }

        let mut book = self.book.lock().expect("paper book lock");
        if book.position.is_some() {
            return Err(GatewayError::Rejected(
                "position already open on paper venue".to_string(),
            ));
        }
        let mark = book.mark_price;
        if mark <= 0.0 {
            return Err(GatewayError::UnexpectedShape {
                endpoint: "order",
                detail: "no mark price yet".to_string(),
            });
        }

        let fill = self.fill_price(mark, direction);
        let notional = fill * quantity / book.leverage;
        if notional > book.balance {
            return Err(GatewayError::InsufficientMargin(format!(
                "need {:.2}, have {:.2}",
                notional, book.balance
            )));
        }

        book.position = Some(PaperPosition {
            symbol: symbol.to_string(),
            direction,
            entry_price: fill,
            quantity,
        });
        book.order_seq += 1;
        let order_id = format!("paper-{}", book.order_seq);
        info!(symbol, %direction, fill, quantity, "paper fill");

        Ok(OrderResult {
            order_id,
            client_order_id,
            filled_price: fill,
            filled_qty: quantity,
        })
    }

    async fn close_position(&self, symbol: &str) -> Result<OrderResult, GatewayError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let mut book = self.book.lock().expect("paper book lock");
        let position = book
            .position
            .take()
            .ok_or_else(|| GatewayError::NoPosition(symbol.to_string()))?;

        let exit = self.fill_price(book.mark_price, position.direction.opposite());
        let pnl = (exit - position.entry_price) * position.direction.sign() * position.quantity;
        book.balance += pnl;
        book.realized_pnl += pnl;
        book.order_seq += 1;
        let order_id = format!("paper-{}", book.order_seq);
        info!(symbol, exit, pnl, "paper close");

        Ok(OrderResult {
            order_id,
            client_order_id: Uuid::new_v4(),
            filled_price: exit,
            filled_qty: position.quantity,
        })
    }

    async fn set_leverage(&self, _symbol: &str, leverage: f64) -> Result<LeverageAck, GatewayError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        if leverage < 1.0 || leverage > 100.0 {
            return Err(GatewayError::InvalidRequest(format!(
                "leverage {} out of range",
                leverage
            )));
        }
        let mut book = self.book.lock().expect("paper book lock");
        if (book.leverage - leverage).abs() < f64::EPSILON {
            return Ok(LeverageAck::AlreadySet);
        }
        book.leverage = leverage;
        Ok(LeverageAck::Applied)
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let book = self.book.lock().expect("paper book lock");
        Ok(book
            .position
            .iter()
            .map(|p| ExchangePosition {
                symbol: p.symbol.clone(),
                direction: p.direction,
                entry_price: p.entry_price,
                quantity: p.quantity,
                leverage: Some(book.leverage),
                unrealized_pnl: Some(
                    (book.mark_price - p.entry_price) * p.direction.sign() * p.quantity,
                ),
            })
            .collect())
    }

    async fn get_balance(&self) -> Result<Balance, GatewayError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let book = self.book.lock().expect("paper book lock");
        Ok(Balance {
            total: book.balance,
            available: book.balance,
        })
    }

    async fn get_realized_pnl(&self, _symbol: &str) -> Result<f64, GatewayError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        Ok(self.book.lock().expect("paper book lock").realized_pnl)
    }
}
