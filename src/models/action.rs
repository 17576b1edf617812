//! Trade actions
//!
//! `trade_action_json` is one of these tagged variants, validated on write.
//! A strategy without an action is a pure chain gate.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Mkt,
    Lmt,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Mkt => "MKT",
            OrderType::Lmt => "LMT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MKT" => Some(OrderType::Mkt),
            "LMT" => Some(OrderType::Lmt),
            _ => None,
        }
    }
}

/// What a triggered strategy executes. STK strategies carry `StockTrade`;
/// FUT strategies carry `FutPosition` or `FutRoll`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
    StockTrade {
        symbol: String,
        side: OrderSide,
        quantity: f64,
        order_type: OrderType,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit_price: Option<f64>,
        #[serde(default)]
        allow_overnight: bool,
        #[serde(default)]
        cancel_on_expiry: bool,
    },
    FutPosition {
        symbol: String,
        side: OrderSide,
        quantity: f64,
        order_type: OrderType,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit_price: Option<f64>,
        #[serde(default)]
        allow_overnight: bool,
        #[serde(default)]
        cancel_on_expiry: bool,
    },
    /// Close the near contract, then open the far contract for the same
    /// total quantity. One-shot per strategy.
    FutRoll {
        near_symbol: String,
        far_symbol: String,
        quantity: f64,
        order_type: OrderType,
        #[serde(skip_serializing_if = "Option::is_none")]
        close_limit_price: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        open_limit_price: Option<f64>,
        #[serde(default)]
        cancel_on_expiry: bool,
    },
}

impl TradeAction {
    pub fn action_type(&self) -> &'static str {
        match self {
            TradeAction::StockTrade { .. } => "STOCK_TRADE",
            TradeAction::FutPosition { .. } => "FUT_POSITION",
            TradeAction::FutRoll { .. } => "FUT_ROLL",
        }
    }

    pub fn quantity(&self) -> f64 {
        match self {
            TradeAction::StockTrade { quantity, .. }
            | TradeAction::FutPosition { quantity, .. }
            | TradeAction::FutRoll { quantity, .. } => *quantity,
        }
    }

    pub fn order_type(&self) -> OrderType {
        match self {
            TradeAction::StockTrade { order_type, .. }
            | TradeAction::FutPosition { order_type, .. }
            | TradeAction::FutRoll { order_type, .. } => *order_type,
        }
    }

    pub fn cancel_on_expiry(&self) -> bool {
        match self {
            TradeAction::StockTrade {
                cancel_on_expiry, ..
            }
            | TradeAction::FutPosition {
                cancel_on_expiry, ..
            }
            | TradeAction::FutRoll {
                cancel_on_expiry, ..
            } => *cancel_on_expiry,
        }
    }

    /// Symbols this action touches, in execution order.
    pub fn symbols(&self) -> Vec<&str> {
        match self {
            TradeAction::StockTrade { symbol, .. } | TradeAction::FutPosition { symbol, .. } => {
                vec![symbol.as_str()]
            }
            TradeAction::FutRoll {
                near_symbol,
                far_symbol,
                ..
            } => vec![near_symbol.as_str(), far_symbol.as_str()],
        }
    }

    /// Limit prices per priced leg; an LMT action must carry a positive
    /// price on every one of these.
    pub fn limit_prices(&self) -> Vec<Option<f64>> {
        match self {
            TradeAction::StockTrade { limit_price, .. }
            | TradeAction::FutPosition { limit_price, .. } => vec![*limit_price],
            TradeAction::FutRoll {
                close_limit_price,
                open_limit_price,
                ..
            } => vec![*close_limit_price, *open_limit_price],
        }
    }

    /// Human-facing one-liner for the trade instruction projection.
    pub fn summary(&self) -> String {
        match self {
            TradeAction::StockTrade {
                symbol,
                side,
                quantity,
                order_type,
                limit_price,
                ..
            }
            | TradeAction::FutPosition {
                symbol,
                side,
                quantity,
                order_type,
                limit_price,
                ..
            } => match limit_price {
                Some(px) => format!(
                    "{} {} {} {} @ {:.2}",
                    side.as_str(),
                    quantity,
                    symbol,
                    order_type.as_str(),
                    px
                ),
                None => format!(
                    "{} {} {} {}",
                    side.as_str(),
                    quantity,
                    symbol,
                    order_type.as_str()
                ),
            },
            TradeAction::FutRoll {
                near_symbol,
                far_symbol,
                quantity,
                ..
            } => format!("ROLL {} {} -> {}", quantity, near_symbol, far_symbol),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_json_is_tagged() {
        let a = TradeAction::StockTrade {
            symbol: "SLV".into(),
            side: OrderSide::Buy,
            quantity: 100.0,
            order_type: OrderType::Mkt,
            limit_price: None,
            allow_overnight: false,
            cancel_on_expiry: true,
        };
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["action_type"], "STOCK_TRADE");
        assert_eq!(json["side"], "BUY");
        let back: TradeAction = serde_json::from_value(json).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn roll_symbols_in_execution_order() {
        let a = TradeAction::FutRoll {
            near_symbol: "ESU5".into(),
            far_symbol: "ESZ5".into(),
            quantity: 2.0,
            order_type: OrderType::Mkt,
            close_limit_price: None,
            open_limit_price: None,
            cancel_on_expiry: false,
        };
        assert_eq!(a.symbols(), vec!["ESU5", "ESZ5"]);
        assert_eq!(a.limit_prices().len(), 2);
    }
}
