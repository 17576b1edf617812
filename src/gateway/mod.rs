//! Brokerage gateway adapter
//!
//! The engine sees an opaque client: bars in, orders out, status events
//! back. Host/port/mode come from config; `paper` is the default and
//! `live` requires an explicit enable flag.

pub mod http;
pub mod sim;

pub use http::HttpGateway;
pub use sim::SimGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::EngineResult;
use crate::marketdata::{Bar, BarRequest};
use crate::models::{OrderPayload, OrderStatus};

/// Order/fill event pushed by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub ib_order_id: String,
    pub trade_id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_fill_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Snapshot answer to an explicit order-state query (used by recovery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub ib_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_fill_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub account_id: String,
    pub net_liquidation: f64,
    pub cash_balance: f64,
    pub currency: String,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub sec_type: String,
    pub quantity: f64,
    pub avg_cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_value: Option<f64>,
}

/// The outbound brokerage interface. All calls are bounded by the
/// configured timeout; network I/O here is the engine's only blocking
/// point.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn health_check(&self) -> EngineResult<()>;

    /// Historical bars for `[req.start, req.end)`, oldest first.
    async fn fetch_bars(&self, req: &BarRequest) -> EngineResult<Vec<Bar>>;

    /// Submit an order. Idempotent under the payload's `trade_id`: a
    /// resubmission returns the original gateway order id.
    async fn submit_order(&self, payload: &OrderPayload) -> EngineResult<String>;

    async fn cancel_order(&self, ib_order_id: &str) -> EngineResult<()>;

    async fn order_status(&self, ib_order_id: &str) -> EngineResult<OrderStatusReport>;

    async fn account_summary(&self) -> EngineResult<AccountSummary>;

    async fn positions(&self) -> EngineResult<Vec<Position>>;

    /// Subscribe to order/fill events.
    fn subscribe_order_events(&self) -> broadcast::Receiver<OrderEvent>;
}
