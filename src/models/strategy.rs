//! Strategy entity and lifecycle vocabulary
//!
//! The status enum and its admissible-transition table are the single
//! authority on lifecycle moves; the store rejects anything not listed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::action::TradeAction;
use crate::models::condition::Condition;

/// Supported markets. Each maps deterministically onto gateway contract
/// routing; only USD venues are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    UsStock,
    UsFutures,
}

impl Market {
    pub fn sec_type(&self) -> SecType {
        match self {
            Market::UsStock => SecType::Stk,
            Market::UsFutures => SecType::Fut,
        }
    }

    pub fn exchange(&self) -> &'static str {
        match self {
            Market::UsStock => "SMART",
            Market::UsFutures => "CME",
        }
    }

    pub fn currency(&self) -> &'static str {
        "USD"
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Market::UsStock => "us_stock",
            Market::UsFutures => "us_futures",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "us_stock" => Some(Market::UsStock),
            "us_futures" => Some(Market::UsFutures),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecType {
    Stk,
    Fut,
}

impl SecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecType::Stk => "STK",
            SecType::Fut => "FUT",
        }
    }
}

/// Strategy-level intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeType {
    Buy,
    Sell,
    Switch,
    Open,
    Close,
    Spread,
}

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeType::Buy => "buy",
            TradeType::Sell => "sell",
            TradeType::Switch => "switch",
            TradeType::Open => "open",
            TradeType::Close => "close",
            TradeType::Spread => "spread",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(TradeType::Buy),
            "sell" => Some(TradeType::Sell),
            "switch" => Some(TradeType::Switch),
            "open" => Some(TradeType::Open),
            "close" => Some(TradeType::Close),
            "spread" => Some(TradeType::Spread),
            _ => None,
        }
    }

    /// Pairing constraint between a strategy's intent and its child
    /// symbols: `{buy,sell,switch}` pairs with `{buy,sell,ref}`,
    /// `{open,close,spread}` pairs with `{open,close,ref}`.
    pub fn accepts_child(&self, child: SymbolTradeType) -> bool {
        match self {
            TradeType::Buy | TradeType::Sell | TradeType::Switch => matches!(
                child,
                SymbolTradeType::Buy | SymbolTradeType::Sell | SymbolTradeType::Ref
            ),
            TradeType::Open | TradeType::Close | TradeType::Spread => matches!(
                child,
                SymbolTradeType::Open | SymbolTradeType::Close | SymbolTradeType::Ref
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolTradeType {
    Buy,
    Sell,
    Open,
    Close,
    Ref,
}

impl SymbolTradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolTradeType::Buy => "buy",
            SymbolTradeType::Sell => "sell",
            SymbolTradeType::Open => "open",
            SymbolTradeType::Close => "close",
            SymbolTradeType::Ref => "ref",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(SymbolTradeType::Buy),
            "sell" => Some(SymbolTradeType::Sell),
            "open" => Some(SymbolTradeType::Open),
            "close" => Some(SymbolTradeType::Close),
            "ref" => Some(SymbolTradeType::Ref),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionLogic {
    And,
    Or,
}

impl ConditionLogic {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionLogic::And => "AND",
            ConditionLogic::Or => "OR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AND" => Some(ConditionLogic::And),
            "OR" => Some(ConditionLogic::Or),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpireMode {
    Relative,
    Absolute,
}

impl ExpireMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpireMode::Relative => "relative",
            ExpireMode::Absolute => "absolute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "relative" => Some(ExpireMode::Relative),
            "absolute" => Some(ExpireMode::Absolute),
            _ => None,
        }
    }
}

/// Lifecycle status. Terminal states never leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyStatus {
    PendingActivation,
    Verifying,
    VerifyFailed,
    Active,
    Paused,
    Triggered,
    OrderSubmitted,
    Filled,
    Expired,
    Cancelled,
    Failed,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::PendingActivation => "PENDING_ACTIVATION",
            StrategyStatus::Verifying => "VERIFYING",
            StrategyStatus::VerifyFailed => "VERIFY_FAILED",
            StrategyStatus::Active => "ACTIVE",
            StrategyStatus::Paused => "PAUSED",
            StrategyStatus::Triggered => "TRIGGERED",
            StrategyStatus::OrderSubmitted => "ORDER_SUBMITTED",
            StrategyStatus::Filled => "FILLED",
            StrategyStatus::Expired => "EXPIRED",
            StrategyStatus::Cancelled => "CANCELLED",
            StrategyStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_ACTIVATION" => Some(StrategyStatus::PendingActivation),
            "VERIFYING" => Some(StrategyStatus::Verifying),
            "VERIFY_FAILED" => Some(StrategyStatus::VerifyFailed),
            "ACTIVE" => Some(StrategyStatus::Active),
            "PAUSED" => Some(StrategyStatus::Paused),
            "TRIGGERED" => Some(StrategyStatus::Triggered),
            "ORDER_SUBMITTED" => Some(StrategyStatus::OrderSubmitted),
            "FILLED" => Some(StrategyStatus::Filled),
            "EXPIRED" => Some(StrategyStatus::Expired),
            "CANCELLED" => Some(StrategyStatus::Cancelled),
            "FAILED" => Some(StrategyStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StrategyStatus::Filled
                | StrategyStatus::Expired
                | StrategyStatus::Cancelled
                | StrategyStatus::Failed
        )
    }

    /// Statuses whose strategies may still be edited.
    pub fn is_editable(&self) -> bool {
        matches!(
            self,
            StrategyStatus::PendingActivation
                | StrategyStatus::Paused
                | StrategyStatus::VerifyFailed
        )
    }

    /// The admissible-transition table. Anything not listed here is
    /// rejected by the store with `INVALID_TRANSITION`.
    pub fn admissible(from: StrategyStatus, to: StrategyStatus) -> bool {
        use StrategyStatus::*;
        match (from, to) {
            (PendingActivation, Verifying) => true,
            (Verifying, Active) => true,
            (Verifying, VerifyFailed) => true,
            // Any config edit re-arms the strategy.
            (VerifyFailed, PendingActivation) => true,
            (PendingActivation, PendingActivation) => true,
            (Paused, PendingActivation) => true,
            (Active, Paused) => true,
            (Paused, Active) => true,
            (Active, Triggered) => true,
            (Triggered, OrderSubmitted) => true,
            // Chain-only strategies (no trade action) close out directly.
            (Triggered, Filled) => true,
            (OrderSubmitted, Filled) => true,
            (OrderSubmitted, Cancelled) => true,
            (OrderSubmitted, Failed) => true,
            (
                PendingActivation | VerifyFailed | Active | Paused | Triggered,
                Expired,
            ) => true,
            // `cancel()` is allowed from any non-terminal state except
            // ORDER_SUBMITTED (where only the gateway's ack cancels).
            (
                PendingActivation | Verifying | VerifyFailed | Active | Paused | Triggered,
                Cancelled,
            ) => true,
            // Unrecoverable execution error from any live state.
            (from, Failed) if !from.is_terminal() => true,
            _ => false,
        }
    }
}

/// One leg of a strategy's symbol universe. Ordered by `position`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySymbol {
    pub position: u32,
    pub symbol: String,
    pub trade_type: SymbolTradeType,
}

/// The persistent strategy record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub market: Market,
    pub trade_type: TradeType,
    pub condition_logic: ConditionLogic,
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_action: Option<TradeAction>,
    pub symbols: Vec<StrategySymbol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_strategy_id: Option<String>,
    #[serde(default)]
    pub upstream_only_activation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_strategy_id: Option<String>,
    pub expire_mode: ExpireMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_in_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_activated_at: Option<DateTime<Utc>>,
    pub status: StrategyStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Strategy {
    /// Manual activation eligibility: not upstream-gated, has at least one
    /// condition, and has something to do when it fires.
    pub fn eligible_for_manual_activation(&self) -> bool {
        !self.upstream_only_activation
            && !self.conditions.is_empty()
            && (self.trade_action.is_some() || self.next_strategy_id.is_some())
    }

    pub fn symbol_set(&self) -> Vec<&str> {
        self.symbols.iter().map(|s| s.symbol.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_accepts_documented_paths() {
        use StrategyStatus::*;
        let valid = [
            (PendingActivation, Verifying),
            (Verifying, Active),
            (Verifying, VerifyFailed),
            (VerifyFailed, PendingActivation),
            (Active, Paused),
            (Paused, Active),
            (Active, Triggered),
            (Triggered, OrderSubmitted),
            (Triggered, Filled),
            (OrderSubmitted, Filled),
            (OrderSubmitted, Cancelled),
            (OrderSubmitted, Failed),
            (Triggered, Expired),
            (Paused, Expired),
            (Active, Cancelled),
            (Verifying, Cancelled),
            (VerifyFailed, Cancelled),
            (Triggered, Cancelled),
            (Triggered, Failed),
        ];
        for (from, to) in valid {
            assert!(
                StrategyStatus::admissible(from, to),
                "{from:?} -> {to:?} should be admissible"
            );
        }
    }

    #[test]
    fn transition_table_rejects_undocumented_paths() {
        use StrategyStatus::*;
        let invalid = [
            (PendingActivation, Active),
            (Active, Filled),
            (Filled, Active),
            (Expired, PendingActivation),
            (Cancelled, Failed),
            (Failed, Failed),
            (OrderSubmitted, Expired),
            (OrderSubmitted, Paused),
            (Paused, Triggered),
            (Verifying, Triggered),
        ];
        for (from, to) in invalid {
            assert!(
                !StrategyStatus::admissible(from, to),
                "{from:?} -> {to:?} should be rejected"
            );
        }
    }

    #[test]
    fn trade_type_pairing() {
        assert!(TradeType::Buy.accepts_child(SymbolTradeType::Sell));
        assert!(TradeType::Switch.accepts_child(SymbolTradeType::Ref));
        assert!(!TradeType::Buy.accepts_child(SymbolTradeType::Open));
        assert!(TradeType::Spread.accepts_child(SymbolTradeType::Open));
        assert!(!TradeType::Close.accepts_child(SymbolTradeType::Sell));
    }

    #[test]
    fn market_mapping_is_deterministic() {
        assert_eq!(Market::UsStock.sec_type(), SecType::Stk);
        assert_eq!(Market::UsStock.exchange(), "SMART");
        assert_eq!(Market::UsFutures.sec_type(), SecType::Fut);
        assert_eq!(Market::UsFutures.currency(), "USD");
    }
}
