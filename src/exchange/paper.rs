//! # exchange::paper — simulated account over a real market feed
//!
//! Test-mode execution target: candles / orderbook / instrument specs come
//! from the wrapped feed (usually an unauthenticated [`OkxClient`]), while
//! balance, positions and fills are simulated locally in net-position mode.
//!
//! Fills happen at the book mid with a flat taker fee. No slippage model.
//!
//! [`OkxClient`]: crate::exchange::okx::OkxClient

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::ExchangeError;
use crate::exchange::{Balance, Exchange, InstrumentSpec, OrderAck, OrderRequest, OrderSide};
use crate::models::{Candle, MarginMode, OrderBook, Position, Side};

/// OKX swap taker fee tier 1
pub const DEFAULT_FEE_RATE: f64 = 0.0005;
const DEFAULT_LEVERAGE: u32 = 10;

#[derive(Debug)]
struct PaperAccount {
    cash:      f64,
    positions: HashMap<String, Position>,
    leverage:  HashMap<String, u32>,
    marks:     HashMap<String, f64>,
    /// ctVal per symbol seen so far, for cross-symbol margin sums
    ct_values: HashMap<String, f64>,
    order_seq: u64,
}

impl PaperAccount {
    fn used_margin(&self) -> f64 {
        self.positions
            .values()
            .map(|p| margin_of(p, self.ct_values.get(&p.symbol).copied().unwrap_or(1.0)))
            .sum()
    }
}

pub struct PaperExchange {
    feed:     Arc<dyn Exchange>,
    account:  Mutex<PaperAccount>,
    fee_rate: f64,
}

impl PaperExchange {
    pub fn new(feed: Arc<dyn Exchange>, starting_balance: f64) -> Self {
        Self {
            feed,
            account: Mutex::new(PaperAccount {
                cash:      starting_balance,
                positions: HashMap::new(),
                leverage:  HashMap::new(),
                marks:     HashMap::new(),
                ct_values: HashMap::new(),
                order_seq: 0,
            }),
            fee_rate: DEFAULT_FEE_RATE,
        }
    }

    async fn mark(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let book = self.feed.get_orderbook(symbol, 1).await?;
        let mid  = book
            .mid()
            .ok_or_else(|| ExchangeError::Rejected { code: "paper".into(), msg: format!("no market for {symbol}") })?;
        self.account.lock().await.marks.insert(symbol.to_string(), mid);
        Ok(mid)
    }
}

fn signed(side: Side, contracts: f64) -> f64 {
    match side {
        Side::Long  => contracts,
        Side::Short => -contracts,
    }
}

fn upl(pos: &Position, mark: f64, contract_value: f64) -> f64 {
    signed(pos.side, pos.contracts) * (mark - pos.entry_price) * contract_value
}

fn margin_of(pos: &Position, contract_value: f64) -> f64 {
    pos.contracts * pos.entry_price * contract_value / pos.leverage.max(1) as f64
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        let symbols: Vec<String> = self.account.lock().await.positions.keys().cloned().collect();
        let mut unrealized = 0.0;
        let mut used       = 0.0;
        for symbol in symbols {
            let spec = self.feed.get_instrument(&symbol).await?;
            let mark = self.mark(&symbol).await?;
            let acct = self.account.lock().await;
            if let Some(pos) = acct.positions.get(&symbol) {
                unrealized += upl(pos, mark, spec.contract_value);
                used       += margin_of(pos, spec.contract_value);
            }
        }

        let cash   = self.account.lock().await.cash;
        let equity = cash + unrealized;
        Ok(Balance {
            total_equity:   equity,
            available:      (equity - used).max(0.0),
            unrealized_pnl: unrealized,
        })
    }

    async fn get_open_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        let spec = self.feed.get_instrument(symbol).await?;
        let acct = self.account.lock().await;
        Ok(acct.positions.get(symbol).map(|p| {
            let mut p = p.clone();
            if let Some(&mark) = acct.marks.get(symbol) {
                p.mark_price     = Some(mark);
                p.unrealized_pnl = Some(upl(&p, mark, spec.contract_value));
            }
            p
        }))
    }

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook, ExchangeError> {
        let book = self.feed.get_orderbook(symbol, depth).await?;
        if let Some(mid) = book.mid() {
            self.account.lock().await.marks.insert(symbol.to_string(), mid);
        }
        Ok(book)
    }

    async fn get_candles(&self, symbol: &str, timeframe: &str, count: usize) -> Result<Vec<Candle>, ExchangeError> {
        self.feed.get_candles(symbol, timeframe, count).await
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        if !(order.contracts > 0.0) {
            return Err(ExchangeError::Rejected { code: "paper".into(), msg: "size must be > 0".into() });
        }
        let spec = self.feed.get_instrument(&order.symbol).await?;
        let mark = self.mark(&order.symbol).await?;

        let mut acct = self.account.lock().await;
        acct.ct_values.insert(order.symbol.clone(), spec.contract_value);
        let leverage = acct.leverage.get(&order.symbol).copied().unwrap_or(DEFAULT_LEVERAGE);
        let order_dir = match order.side {
            OrderSide::Buy  => 1.0,
            OrderSide::Sell => -1.0,
        };

        let current = acct.positions.get(&order.symbol).cloned();
        let current_signed = current.as_ref().map(|p| signed(p.side, p.contracts)).unwrap_or(0.0);

        // reduce-only may only shrink toward zero
        let mut fill = order.contracts;
        if order.reduce_only {
            if current_signed == 0.0 || current_signed.signum() == order_dir {
                return Err(ExchangeError::Rejected {
                    code: "51169".into(),
                    msg:  "reduce-only order has no position to reduce".into(),
                });
            }
            fill = fill.min(current_signed.abs());
        }

        let closing = if current_signed.signum() == -order_dir { fill.min(current_signed.abs()) } else { 0.0 };
        let opening = fill - closing;

        // margin check only for the growing part
        if opening > 0.0 {
            let used = acct.used_margin();
            let need = opening * mark * spec.contract_value / leverage as f64;
            if acct.cash - used < need {
                return Err(ExchangeError::InsufficientFunds(format!(
                    "paper: need {need:.2} USDT margin, {:.2} free", acct.cash - used
                )));
            }
        }

        let fee = fill * mark * spec.contract_value * self.fee_rate;
        acct.cash -= fee;

        if let Some(pos) = current.as_ref().filter(|_| closing > 0.0) {
            let realized = signed(pos.side, closing) * (mark - pos.entry_price) * spec.contract_value;
            acct.cash += realized;
        }

        let new_signed = current_signed + order_dir * fill;
        if new_signed.abs() < 1e-12 {
            acct.positions.remove(&order.symbol);
        } else {
            let side = if new_signed > 0.0 { Side::Long } else { Side::Short };
            let entry_price = match &current {
                // grew on the same side: volume-weighted entry
                Some(p) if p.side == side && opening > 0.0 => {
                    (p.entry_price * p.contracts + mark * opening) / (p.contracts + opening)
                }
                Some(p) if p.side == side => p.entry_price,
                _ => mark,
            };
            let opened_at = match &current {
                Some(p) if p.side == side => p.opened_at,
                _ => Utc::now(),
            };
            acct.positions.insert(order.symbol.clone(), Position {
                symbol:         order.symbol.clone(),
                side,
                contracts:      new_signed.abs(),
                entry_price,
                leverage,
                margin_mode:    order.margin_mode,
                opened_at,
                mark_price:     Some(mark),
                unrealized_pnl: None,
            });
        }

        acct.order_seq += 1;
        let order_id = format!("paper-{}", acct.order_seq);
        info!(
            symbol      = %order.symbol,
            side        = order.side.as_str(),
            contracts   = fill,
            price       = mark,
            reduce_only = order.reduce_only,
            cash        = acct.cash,
            "📝 Paper fill"
        );

        Ok(OrderAck { order_id, client_order_id: order.client_order_id.clone() })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32, _margin_mode: MarginMode) -> Result<(), ExchangeError> {
        let mut acct = self.account.lock().await;
        acct.leverage.insert(symbol.to_string(), leverage);
        if let Some(pos) = acct.positions.get_mut(symbol) {
            pos.leverage = leverage;
        }
        Ok(())
    }

    async fn get_instrument(&self, symbol: &str) -> Result<InstrumentSpec, ExchangeError> {
        self.feed.get_instrument(symbol).await
    }
}
