//! Pre-trade verification
//!
//! An ordered, versioned rule set gates every triggered action. The
//! `trade_id` that threads submission, fills, and logs is minted here.
//! Every rule evaluation is recorded as a VerificationEvent; a single
//! failure moves the strategy to FAILED and nothing is submitted. Rules
//! come from the config snapshot pinned when the run started.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::VerificationConfig;
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::models::events::event_type;
use crate::models::{PriceBasis, Strategy, StrategyStatus, TradeAction};
use crate::store::StatusPatch;

#[derive(Debug, Clone)]
pub enum RuleKind {
    NotionalCap { max_notional_usd: f64 },
    OrderTypeAllowlist { allowed: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct VerificationRule {
    pub id: &'static str,
    pub version: i64,
    pub kind: RuleKind,
}

#[derive(Debug, Clone)]
pub struct RuleCheck {
    pub passed: bool,
    pub reason: String,
    pub snapshot: Value,
}

/// Materialize the ordered rule set from a config snapshot.
pub fn build_rules(cfg: &VerificationConfig) -> Vec<VerificationRule> {
    vec![
        VerificationRule {
            id: "notional_cap",
            version: 1,
            kind: RuleKind::NotionalCap {
                max_notional_usd: cfg.max_notional_usd,
            },
        },
        VerificationRule {
            id: "order_type_allowlist",
            version: 1,
            kind: RuleKind::OrderTypeAllowlist {
                allowed: cfg.allowed_order_types.clone(),
            },
        },
    ]
}

pub fn check_rule(rule: &VerificationRule, action: &TradeAction, price_proxy: f64) -> RuleCheck {
    match &rule.kind {
        RuleKind::NotionalCap { max_notional_usd } => {
            let notional = action.quantity() * price_proxy;
            let passed = notional <= *max_notional_usd;
            RuleCheck {
                passed,
                reason: format!(
                    "notional {:.2} {} cap {:.2}",
                    notional,
                    if passed { "within" } else { "exceeds" },
                    max_notional_usd
                ),
                snapshot: json!({
                    "quantity": action.quantity(),
                    "price_proxy": price_proxy,
                    "notional_usd": notional,
                    "max_notional_usd": max_notional_usd,
                }),
            }
        }
        RuleKind::OrderTypeAllowlist { allowed } => {
            let order_type = action.order_type().as_str();
            let passed = allowed.iter().any(|a| a == order_type);
            RuleCheck {
                passed,
                reason: format!(
                    "order type {order_type} {}",
                    if passed { "allowed" } else { "not in allowlist" }
                ),
                snapshot: json!({
                    "order_type": order_type,
                    "allowed_order_types": allowed,
                }),
            }
        }
    }
}

impl Engine {
    /// Run the rule set for a trigger. Returns the minted `trade_id` when
    /// every rule passes; on any failure the strategy moves
    /// TRIGGERED -> FAILED and `None` comes back.
    pub(crate) async fn verify_trigger(
        &self,
        s: &Strategy,
        action: &TradeAction,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<String>> {
        let trade_id = Uuid::new_v4().to_string();
        let rules = build_rules(&self.config.verification);
        let price_proxy = self.price_proxy(s, action, now).await;

        for rule in &rules {
            let check = check_rule(rule, action, price_proxy);
            self.store.record_verification(
                &trade_id,
                &s.id,
                rule.id,
                rule.version,
                check.passed,
                &check.reason,
                &check.snapshot,
                now,
            )?;
            if !check.passed {
                warn!(
                    strategy_id = %s.id,
                    trade_id = %trade_id,
                    rule_id = rule.id,
                    reason = %check.reason,
                    "pre-trade verification rejected"
                );
                self.store.transition(
                    &s.id,
                    StrategyStatus::Triggered,
                    StrategyStatus::Failed,
                    StatusPatch {
                        event_type: Some(event_type::VERIFICATION_FAILED),
                        event_detail: Some(json!({
                            "trade_id": trade_id,
                            "rule_id": rule.id,
                            "reason": check.reason,
                        })),
                        ..Default::default()
                    },
                    None,
                    now,
                )?;
                return Ok(None);
            }
        }

        info!(strategy_id = %s.id, trade_id = %trade_id, "pre-trade verification passed");
        self.store.append_event(
            &s.id,
            event_type::VERIFICATION_PASSED,
            json!({ "trade_id": trade_id }),
            now,
        )?;
        Ok(Some(trade_id))
    }

    /// Price stand-in for the notional check: the limit price when the
    /// action carries one, otherwise the freshest close for the executed
    /// symbol. A missing proxy fails closed.
    async fn price_proxy(&self, s: &Strategy, action: &TradeAction, now: DateTime<Utc>) -> f64 {
        if let Some(Some(px)) = action.limit_prices().first() {
            return *px;
        }
        let symbol = action
            .symbols()
            .first()
            .map(|s| s.to_string())
            .or_else(|| self.primary_product(s));
        if let Some(symbol) = symbol {
            if let Ok(Some(px)) = self
                .cache
                .latest_basis(self.gateway.as_ref(), &symbol, PriceBasis::Close, now)
                .await
            {
                return px;
            }
        }
        warn!(strategy_id = %s.id, "no price proxy available, failing closed");
        f64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderSide, OrderType};

    fn stock_action(quantity: f64, order_type: OrderType) -> TradeAction {
        TradeAction::StockTrade {
            symbol: "SLV".into(),
            side: OrderSide::Buy,
            quantity,
            order_type,
            limit_price: None,
            allow_overnight: false,
            cancel_on_expiry: false,
        }
    }

    #[test]
    fn notional_cap_rejects_oversized_orders() {
        let cfg = VerificationConfig {
            max_notional_usd: 5_000.0,
            allowed_order_types: vec!["MKT".into()],
        };
        let rules = build_rules(&cfg);
        // 100 x $60 = $6000 > $5000.
        let check = check_rule(&rules[0], &stock_action(100.0, OrderType::Mkt), 60.0);
        assert!(!check.passed);
        assert_eq!(check.snapshot["notional_usd"], 6_000.0);

        let check = check_rule(&rules[0], &stock_action(80.0, OrderType::Mkt), 60.0);
        assert!(check.passed);
    }

    #[test]
    fn allowlist_rejects_unlisted_types() {
        let cfg = VerificationConfig {
            max_notional_usd: 1e9,
            allowed_order_types: vec!["MKT".into()],
        };
        let rules = build_rules(&cfg);
        let check = check_rule(&rules[1], &stock_action(1.0, OrderType::Lmt), 1.0);
        assert!(!check.passed);
        let check = check_rule(&rules[1], &stock_action(1.0, OrderType::Mkt), 1.0);
        assert!(check.passed);
    }

    #[test]
    fn rule_set_is_ordered_and_versioned() {
        let rules = build_rules(&VerificationConfig::default());
        assert_eq!(rules[0].id, "notional_cap");
        assert_eq!(rules[1].id, "order_type_allowlist");
        assert!(rules.iter().all(|r| r.version >= 1));
    }
}
