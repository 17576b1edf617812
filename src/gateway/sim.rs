//! Simulated gateway
//!
//! In-memory stand-in for the brokerage bridge: scripted bars, manual
//! fill/cancel/reject injection, and the same order-event broadcast the
//! real adapter provides. Paper smoke runs and the scenario tests drive
//! the engine through this.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{EngineError, EngineResult};
use crate::gateway::{AccountSummary, GatewayClient, OrderEvent, OrderStatusReport, Position};
use crate::marketdata::{Bar, BarRequest, BarSize};
use crate::models::{OrderPayload, OrderStatus};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct SimOrder {
    ib_order_id: String,
    trade_id: String,
    payload: OrderPayload,
    status: OrderStatus,
    filled_qty: f64,
    avg_fill_price: Option<f64>,
}

#[derive(Default)]
struct SimState {
    bars: HashMap<(String, &'static str), Vec<Bar>>,
    orders: Vec<SimOrder>,
    by_trade_id: HashMap<String, usize>,
    next_order_seq: u64,
    submit_failures_remaining: u32,
    positions: Vec<Position>,
    cash_balance: f64,
}

pub struct SimGateway {
    state: Mutex<SimState>,
    events: broadcast::Sender<OrderEvent>,
}

impl Default for SimGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl SimGateway {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(SimState {
                cash_balance: 1_000_000.0,
                ..Default::default()
            }),
            events,
        }
    }

    /// Script bars for a contract. Extends any previously pushed series.
    pub fn push_bars(&self, contract: &str, size: BarSize, bars: Vec<Bar>) {
        let mut state = self.state.lock();
        let series = state
            .bars
            .entry((contract.to_string(), size.as_str()))
            .or_default();
        series.extend(bars);
        series.sort_by_key(|b| b.ts);
        series.dedup_by_key(|b| b.ts);
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        self.state.lock().positions = positions;
    }

    /// Next `n` submissions fail with a transient error, for retry tests.
    pub fn fail_submissions(&self, n: u32) {
        self.state.lock().submit_failures_remaining = n;
    }

    pub fn submitted_order_count(&self) -> usize {
        self.state.lock().orders.len()
    }

    pub fn order_payloads(&self) -> Vec<OrderPayload> {
        self.state
            .lock()
            .orders
            .iter()
            .map(|o| o.payload.clone())
            .collect()
    }

    /// Report a full fill for the given gateway order.
    pub fn fill_order(&self, ib_order_id: &str, price: f64, now: DateTime<Utc>) -> bool {
        self.finish_order(ib_order_id, OrderStatus::Filled, Some(price), None, now)
    }

    /// Report a cancel ack. No-op when the order already terminated.
    pub fn ack_cancel(&self, ib_order_id: &str, now: DateTime<Utc>) -> bool {
        self.finish_order(ib_order_id, OrderStatus::Cancelled, None, None, now)
    }

    /// Report an explicit reject.
    pub fn reject_order(&self, ib_order_id: &str, reason: &str, now: DateTime<Utc>) -> bool {
        self.finish_order(
            ib_order_id,
            OrderStatus::Rejected,
            None,
            Some(reason.to_string()),
            now,
        )
    }

    /// Fill the most recently submitted order, if any.
    pub fn fill_latest(&self, price: f64, now: DateTime<Utc>) -> Option<String> {
        let ib = {
            let state = self.state.lock();
            state
                .orders
                .iter()
                .rev()
                .find(|o| !o.status.is_terminal())
                .map(|o| o.ib_order_id.clone())
        }?;
        self.fill_order(&ib, price, now).then_some(ib)
    }

    fn finish_order(
        &self,
        ib_order_id: &str,
        status: OrderStatus,
        price: Option<f64>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let event = {
            let mut state = self.state.lock();
            let Some(order) = state
                .orders
                .iter_mut()
                .find(|o| o.ib_order_id == ib_order_id)
            else {
                return false;
            };
            if order.status.is_terminal() {
                return false;
            }
            order.status = status;
            if status == OrderStatus::Filled {
                order.filled_qty = order.payload.quantity;
                order.avg_fill_price = price;
            }
            OrderEvent {
                ib_order_id: order.ib_order_id.clone(),
                trade_id: order.trade_id.clone(),
                status,
                filled_qty: order.filled_qty,
                avg_fill_price: order.avg_fill_price,
                reason,
                ts: now,
            }
        };
        let _ = self.events.send(event);
        true
    }
}

#[async_trait]
impl GatewayClient for SimGateway {
    async fn health_check(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn fetch_bars(&self, req: &BarRequest) -> EngineResult<Vec<Bar>> {
        let state = self.state.lock();
        let series = state
            .bars
            .get(&(req.contract.clone(), req.bar_size.as_str()))
            .cloned()
            .unwrap_or_default();
        Ok(series
            .into_iter()
            .filter(|b| b.ts >= req.start && b.ts < req.end)
            .collect())
    }

    async fn submit_order(&self, payload: &OrderPayload) -> EngineResult<String> {
        let mut state = self.state.lock();
        if state.submit_failures_remaining > 0 {
            state.submit_failures_remaining -= 1;
            return Err(EngineError::GatewayUnavailable(
                "simulated transient fault".to_string(),
            ));
        }
        // Idempotent under trade_id (per roll leg): resubmission returns
        // the original id.
        let key = match &payload.leg {
            Some(leg) => format!("{}#{}", payload.trade_id, leg.as_str()),
            None => payload.trade_id.clone(),
        };
        if let Some(idx) = state.by_trade_id.get(&key) {
            return Ok(state.orders[*idx].ib_order_id.clone());
        }
        state.next_order_seq += 1;
        let ib_order_id = format!("sim-{}", state.next_order_seq);
        let order = SimOrder {
            ib_order_id: ib_order_id.clone(),
            trade_id: payload.trade_id.clone(),
            payload: payload.clone(),
            status: OrderStatus::Submitted,
            filled_qty: 0.0,
            avg_fill_price: None,
        };
        state.orders.push(order);
        let idx = state.orders.len() - 1;
        state.by_trade_id.insert(key, idx);
        Ok(ib_order_id)
    }

    async fn cancel_order(&self, ib_order_id: &str) -> EngineResult<()> {
        let exists = self
            .state
            .lock()
            .orders
            .iter()
            .any(|o| o.ib_order_id == ib_order_id);
        if !exists {
            return Err(EngineError::GatewayRejected(format!(
                "unknown order {ib_order_id}"
            )));
        }
        // The ack arrives through the event feed (tests inject it).
        Ok(())
    }

    async fn order_status(&self, ib_order_id: &str) -> EngineResult<OrderStatusReport> {
        let state = self.state.lock();
        let order = state
            .orders
            .iter()
            .find(|o| o.ib_order_id == ib_order_id)
            .ok_or_else(|| EngineError::GatewayRejected(format!("unknown order {ib_order_id}")))?;
        Ok(OrderStatusReport {
            ib_order_id: order.ib_order_id.clone(),
            status: order.status,
            filled_qty: order.filled_qty,
            avg_fill_price: order.avg_fill_price,
        })
    }

    async fn account_summary(&self) -> EngineResult<AccountSummary> {
        let state = self.state.lock();
        Ok(AccountSummary {
            account_id: "SIM000001".to_string(),
            net_liquidation: state.cash_balance,
            cash_balance: state.cash_balance,
            currency: "USD".to_string(),
            as_of: Utc::now(),
        })
    }

    async fn positions(&self) -> EngineResult<Vec<Position>> {
        Ok(self.state.lock().positions.clone())
    }

    fn subscribe_order_events(&self) -> broadcast::Receiver<OrderEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;
    use crate::models::OrderType;

    fn payload(trade_id: &str) -> OrderPayload {
        OrderPayload {
            trade_id: trade_id.to_string(),
            symbol: "SLV".to_string(),
            sec_type: "STK".to_string(),
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            side: OrderSide::Buy,
            quantity: 100.0,
            order_type: OrderType::Mkt,
            limit_price: None,
            tif: "DAY".to_string(),
            allow_overnight: false,
            leg: None,
        }
    }

    #[tokio::test]
    async fn submit_is_idempotent_under_trade_id() {
        let gw = SimGateway::new();
        let a = gw.submit_order(&payload("t-1")).await.unwrap();
        let b = gw.submit_order(&payload("t-1")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(gw.submitted_order_count(), 1);
    }

    #[tokio::test]
    async fn fill_emits_event_once() {
        let gw = SimGateway::new();
        let mut rx = gw.subscribe_order_events();
        let ib = gw.submit_order(&payload("t-1")).await.unwrap();
        let now = Utc::now();
        assert!(gw.fill_order(&ib, 59.5, now));
        // Terminal orders ignore further reports.
        assert!(!gw.ack_cancel(&ib, now));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.status, OrderStatus::Filled);
        assert_eq!(event.filled_qty, 100.0);
        assert!(rx.try_recv().is_err());
    }
}
