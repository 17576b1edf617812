//! Order lifecycle records and the external trade-instruction projection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::action::{OrderSide, OrderType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    PendingSubmit,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingSubmit => "PENDING_SUBMIT",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_SUBMIT" => Some(OrderStatus::PendingSubmit),
            "SUBMITTED" => Some(OrderStatus::Submitted),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "REJECTED" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// Which leg of a futures roll a gateway order belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollLeg {
    Close,
    Open,
}

impl RollLeg {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollLeg::Close => "close",
            RollLeg::Open => "open",
        }
    }
}

/// The payload handed to the gateway. `trade_id` makes submission
/// idempotent on the gateway side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub trade_id: String,
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    /// Always DAY; the engine does not place GTC orders.
    pub tif: String,
    /// Opaque to the engine, forwarded to the gateway as-is.
    #[serde(default)]
    pub allow_overnight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leg: Option<RollLeg>,
}

/// One per submitted trade action. `UNIQUE(strategy_id)` in the store
/// enforces at most one over a strategy's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub trade_id: String,
    pub strategy_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ib_order_id: Option<String>,
    pub status: OrderStatus,
    pub qty: f64,
    pub filled_qty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_fill_price: Option<f64>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// External-facing projection of an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeInstruction {
    pub trade_id: String,
    pub strategy_id: String,
    pub instruction_summary: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
