//! Write-path validation
//!
//! Requests are validated and normalized here before the store sees them;
//! everything downstream consumes typed, already-checked records.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::{ConditionRules, LimitsConfig, MAX_EXPIRE_IN_SECONDS};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Condition, ConditionLogic, ExpireMode, Market, OrderType, SecType, Strategy, StrategyStatus,
    StrategySymbol, TradeAction, TradeType,
};

/// Create-request body, as accepted from the transport layer.
#[derive(Debug, Clone, Deserialize)]
pub struct NewStrategyInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub market: Market,
    pub trade_type: TradeType,
    #[serde(default)]
    pub condition_logic: Option<ConditionLogic>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub trade_action: Option<TradeAction>,
    pub symbols: Vec<StrategySymbol>,
    #[serde(default)]
    pub next_strategy_id: Option<String>,
    #[serde(default)]
    pub upstream_only_activation: bool,
    pub expire_mode: ExpireMode,
    #[serde(default)]
    pub expire_in_seconds: Option<i64>,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
}

/// Validate and normalize a create request into a persistable Strategy.
pub fn build_strategy(
    input: NewStrategyInput,
    limits: &LimitsConfig,
    rules: &ConditionRules,
    now: DateTime<Utc>,
) -> EngineResult<Strategy> {
    let id = match input.id {
        Some(id) => {
            let id = id.trim().to_string();
            if id.is_empty() || id.chars().any(char::is_whitespace) {
                return Err(EngineError::Validation(
                    "strategy id must be non-empty and contain no whitespace".to_string(),
                ));
            }
            id
        }
        None => Uuid::new_v4().to_string(),
    };

    validate_symbols(&input.symbols, input.trade_type)?;
    validate_conditions(&input.conditions, &input.symbols, limits, rules)?;
    if let Some(action) = &input.trade_action {
        validate_action(action, input.market, &input.symbols)?;
    }
    validate_expiry(input.expire_mode, input.expire_in_seconds, input.expire_at)?;

    if let Some(next) = &input.next_strategy_id {
        if next.eq_ignore_ascii_case(&id) {
            return Err(EngineError::CycleDetected(format!(
                "strategy {id} cannot chain to itself"
            )));
        }
    }

    Ok(Strategy {
        id,
        idempotency_key: input.idempotency_key,
        market: input.market,
        trade_type: input.trade_type,
        condition_logic: input.condition_logic.unwrap_or(ConditionLogic::And),
        conditions: input.conditions,
        trade_action: input.trade_action,
        symbols: input.symbols,
        next_strategy_id: input.next_strategy_id,
        upstream_only_activation: input.upstream_only_activation,
        upstream_strategy_id: None,
        expire_mode: input.expire_mode,
        expire_in_seconds: input.expire_in_seconds,
        expire_at: input.expire_at,
        activated_at: None,
        logical_activated_at: None,
        status: StrategyStatus::PendingActivation,
        version: 1,
        created_at: now,
        updated_at: now,
    })
}

pub fn validate_symbols(symbols: &[StrategySymbol], trade_type: TradeType) -> EngineResult<()> {
    if symbols.is_empty() {
        return Err(EngineError::Validation(
            "strategy needs at least one symbol".to_string(),
        ));
    }
    let mut positions: Vec<u32> = symbols.iter().map(|s| s.position).collect();
    positions.sort_unstable();
    positions.dedup();
    if positions.len() != symbols.len() {
        return Err(EngineError::Validation(
            "symbol positions must be unique".to_string(),
        ));
    }
    for sym in symbols {
        if sym.symbol.trim().is_empty() {
            return Err(EngineError::Validation("empty symbol".to_string()));
        }
        if !trade_type.accepts_child(sym.trade_type) {
            return Err(EngineError::Validation(format!(
                "trade_type {} does not pair with child {} on {}",
                trade_type.as_str(),
                sym.trade_type.as_str(),
                sym.symbol
            )));
        }
    }
    Ok(())
}

pub fn validate_conditions(
    conditions: &[Condition],
    symbols: &[StrategySymbol],
    limits: &LimitsConfig,
    rules: &ConditionRules,
) -> EngineResult<()> {
    if conditions.len() > limits.max_conditions_per_strategy {
        return Err(EngineError::Validation(format!(
            "at most {} conditions per strategy, got {}",
            limits.max_conditions_per_strategy,
            conditions.len()
        )));
    }
    let mut ids: Vec<&str> = conditions.iter().map(|c| c.condition_id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() != conditions.len() {
        return Err(EngineError::Validation(
            "condition ids must be unique".to_string(),
        ));
    }

    let known: Vec<String> = symbols.iter().map(|s| s.symbol.to_uppercase()).collect();
    for c in conditions {
        if c.metric.requires_pair() != c.product_b.is_some() {
            return Err(EngineError::Validation(format!(
                "{} takes {} products",
                c.metric.as_str(),
                if c.metric.requires_pair() { "two" } else { "one" }
            )));
        }
        for product in c.products() {
            if !known.contains(&product.to_uppercase()) {
                return Err(EngineError::Validation(format!(
                    "condition product {product} is not among the strategy symbols"
                )));
            }
        }
        if c.metric.is_usd_valued() {
            if c.metric == crate::models::Metric::Price && c.value <= 0.0 {
                return Err(EngineError::Validation(
                    "PRICE threshold must be positive USD".to_string(),
                ));
            }
        } else if !(0.0..1.0).contains(&c.value) {
            return Err(EngineError::Validation(format!(
                "{} threshold must be a ratio in [0, 1)",
                c.metric.as_str()
            )));
        }
        if !rules.permits(c.metric, c.evaluation_window, c.trigger_mode, c.operator) {
            return Err(EngineError::Validation(format!(
                "{} does not permit {} {} over {}",
                c.metric.as_str(),
                c.trigger_mode.as_str(),
                c.operator.as_str(),
                c.evaluation_window.as_str()
            )));
        }
    }
    Ok(())
}

pub fn validate_action(
    action: &TradeAction,
    market: Market,
    symbols: &[StrategySymbol],
) -> EngineResult<()> {
    match (market.sec_type(), action) {
        (SecType::Stk, TradeAction::StockTrade { .. }) => {}
        (SecType::Fut, TradeAction::FutPosition { .. })
        | (SecType::Fut, TradeAction::FutRoll { .. }) => {}
        (sec, action) => {
            return Err(EngineError::Validation(format!(
                "{} strategies cannot carry a {} action",
                sec.as_str(),
                action.action_type()
            )));
        }
    }
    if action.quantity() <= 0.0 {
        return Err(EngineError::Validation(
            "action quantity must be positive".to_string(),
        ));
    }
    if action.order_type() == OrderType::Lmt {
        for price in action.limit_prices() {
            match price {
                Some(p) if p > 0.0 => {}
                _ => {
                    return Err(EngineError::Validation(
                        "LMT actions need a positive limit price on each priced leg".to_string(),
                    ));
                }
            }
        }
    }
    let known: Vec<String> = symbols.iter().map(|s| s.symbol.to_uppercase()).collect();
    for sym in action.symbols() {
        if !known.contains(&sym.to_uppercase()) {
            return Err(EngineError::Validation(format!(
                "action symbol {sym} is not among the strategy symbols"
            )));
        }
    }
    Ok(())
}

pub fn validate_expiry(
    mode: ExpireMode,
    expire_in_seconds: Option<i64>,
    expire_at: Option<DateTime<Utc>>,
) -> EngineResult<()> {
    match mode {
        ExpireMode::Relative => {
            let secs = expire_in_seconds.ok_or_else(|| {
                EngineError::Validation("relative expiry needs expire_in_seconds".to_string())
            })?;
            if expire_at.is_some() {
                return Err(EngineError::Validation(
                    "relative expiry must not carry expire_at".to_string(),
                ));
            }
            if !(1..=MAX_EXPIRE_IN_SECONDS).contains(&secs) {
                return Err(EngineError::Validation(format!(
                    "expire_in_seconds must be within [1, {MAX_EXPIRE_IN_SECONDS}]"
                )));
            }
        }
        ExpireMode::Absolute => {
            if expire_at.is_none() {
                return Err(EngineError::Validation(
                    "absolute expiry needs expire_at".to_string(),
                ));
            }
            if expire_in_seconds.is_some() {
                return Err(EngineError::Validation(
                    "absolute expiry must not carry expire_in_seconds".to_string(),
                ));
            }
        }
    }
    Ok(())
}
