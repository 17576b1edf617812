//! Order submission and fill tracking
//!
//! The transition to ORDER_SUBMITTED happens in the same transaction as
//! the Order and TradeInstruction inserts; the unique order slot per
//! strategy makes resubmission impossible. Futures rolls submit the close
//! leg first and the open leg only on its fill; if the open leg fails the
//! engine raises a naked-risk alert and does not reverse.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::engine::{runtime_key, Engine};
use crate::error::{EngineError, EngineResult};
use crate::gateway::OrderEvent;
use crate::models::events::event_type;
use crate::models::{
    Order, OrderPayload, OrderSide, OrderStatus, RollLeg, Strategy, StrategyStatus, TradeAction,
};
use crate::store::StatusPatch;

const SUBMIT_MAX_RETRIES: u32 = 3;
const SUBMIT_BACKOFF_MS: u64 = 250;

impl Engine {
    /// C8 entry: persist the submission atomically, then hand the payload
    /// to the gateway with bounded retries.
    pub(crate) async fn submit_trade(
        &self,
        s: &Strategy,
        action: &TradeAction,
        trade_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let is_roll = matches!(action, TradeAction::FutRoll { .. });
        if is_roll
            && self
                .store
                .get_runtime(&s.id, runtime_key::ROLLED_AT)?
                .is_some()
        {
            // One-shot guarantee: a second roll never reaches the gateway.
            self.store.transition(
                &s.id,
                StrategyStatus::Triggered,
                StrategyStatus::Failed,
                StatusPatch {
                    event_detail: Some(json!({"reason": "roll already executed"})),
                    ..Default::default()
                },
                None,
                now,
            )?;
            return Ok(());
        }

        let leg = is_roll.then_some(RollLeg::Close);
        let payload = build_payload(s, action, trade_id, leg);
        let payload_json = serde_json::to_value(&payload)?;
        self.store.mark_order_submitted(
            &s.id,
            trade_id,
            action.quantity(),
            &payload_json,
            &action.summary(),
            s.expire_at,
            now,
        )?;
        if is_roll {
            self.store
                .set_runtime(&s.id, runtime_key::ROLLED_AT, &json!(now.timestamp()), now)?;
        }

        match self.submit_with_retry(&payload).await {
            Ok(ib_order_id) => {
                self.store.update_order(
                    trade_id,
                    Some(&ib_order_id),
                    OrderStatus::Submitted,
                    0.0,
                    None,
                    now,
                )?;
                if is_roll {
                    self.store.set_runtime(
                        &s.id,
                        runtime_key::ROLL_CLOSE_IB_ID,
                        &json!(ib_order_id.clone()),
                        now,
                    )?;
                }
                self.store.append_trade_log(
                    trade_id,
                    &s.id,
                    "submission",
                    &format!("accepted by gateway as {ib_order_id}"),
                    now,
                )?;
                info!(strategy_id = %s.id, trade_id, ib_order_id = %ib_order_id, "order submitted");
                Ok(())
            }
            Err(e) => {
                // Retries exhausted or an explicit reject: terminal.
                self.store
                    .update_order(trade_id, None, OrderStatus::Rejected, 0.0, None, now)?;
                self.store.append_trade_log(
                    trade_id,
                    &s.id,
                    "submission",
                    &format!("gateway refused: {e}"),
                    now,
                )?;
                self.store.transition(
                    &s.id,
                    StrategyStatus::OrderSubmitted,
                    StrategyStatus::Failed,
                    StatusPatch {
                        event_detail: Some(json!({"trade_id": trade_id, "error": e.to_string()})),
                        ..Default::default()
                    },
                    None,
                    now,
                )?;
                error!(strategy_id = %s.id, trade_id, error = %e, "order submission failed");
                Ok(())
            }
        }
    }

    async fn submit_with_retry(&self, payload: &OrderPayload) -> EngineResult<String> {
        let mut backoff = SUBMIT_BACKOFF_MS;
        let mut last = EngineError::GatewayUnavailable("no attempt".to_string());
        for attempt in 0..=SUBMIT_MAX_RETRIES {
            if attempt > 0 {
                sleep(Duration::from_millis(backoff)).await;
                backoff *= 2;
            }
            match self.gateway.submit_order(payload).await {
                Ok(ib_order_id) => return Ok(ib_order_id),
                Err(e) if e.is_retriable() => {
                    warn!(trade_id = %payload.trade_id, attempt, error = %e, "submit retry");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Long-lived task that applies gateway order events to the store and
    /// closes strategy lifecycles on terminal reports.
    pub fn spawn_order_tracker(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let mut rx = self.gateway.subscribe_order_events();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = engine.apply_order_event(&event, Utc::now()).await {
                            error!(trade_id = %event.trade_id, error = %e, "order event apply failed");
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "order event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Apply one gateway order event. Also used by recovery with
    /// synthesized events from explicit status queries.
    pub async fn apply_order_event(
        &self,
        event: &OrderEvent,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let Some(order) = self.store.get_order(&event.trade_id)? else {
            return Ok(());
        };
        let s = self.store.get(&order.strategy_id)?;
        self.store.append_event(
            &s.id,
            event_type::ORDER_UPDATE,
            json!({
                "trade_id": event.trade_id,
                "ib_order_id": event.ib_order_id,
                "status": event.status.as_str(),
                "filled_qty": event.filled_qty,
            }),
            now,
        )?;

        let is_roll = matches!(s.trade_action, Some(TradeAction::FutRoll { .. }));
        if is_roll {
            self.apply_roll_event(&s, &order, event, now).await
        } else {
            self.apply_single_event(&s, &order, event, now)
        }
    }

    fn apply_single_event(
        &self,
        s: &Strategy,
        order: &Order,
        event: &OrderEvent,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.store.update_order(
            &order.trade_id,
            Some(&event.ib_order_id),
            event.status,
            event.filled_qty,
            event.avg_fill_price,
            now,
        )?;
        let target = match event.status {
            OrderStatus::Filled => StrategyStatus::Filled,
            OrderStatus::Cancelled => StrategyStatus::Cancelled,
            OrderStatus::Rejected => StrategyStatus::Failed,
            OrderStatus::PendingSubmit | OrderStatus::Submitted | OrderStatus::PartiallyFilled => {
                return Ok(());
            }
        };
        self.close_lifecycle(s, &order.trade_id, target, event, now)
    }

    async fn apply_roll_event(
        &self,
        s: &Strategy,
        order: &Order,
        event: &OrderEvent,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let close_ib = self
            .store
            .get_runtime(&s.id, runtime_key::ROLL_CLOSE_IB_ID)?
            .and_then(|v| v.as_str().map(String::from));
        let is_close_leg = close_ib.as_deref() == Some(event.ib_order_id.as_str());

        if is_close_leg {
            match event.status {
                OrderStatus::Filled => {
                    self.store.append_event(
                        &s.id,
                        event_type::ROLL_CLOSE_FILLED,
                        json!({"ib_order_id": event.ib_order_id, "filled_qty": event.filled_qty}),
                        now,
                    )?;
                    self.store.update_order(
                        &order.trade_id,
                        None,
                        OrderStatus::PartiallyFilled,
                        event.filled_qty,
                        event.avg_fill_price,
                        now,
                    )?;
                    self.submit_roll_open_leg(s, order, now).await
                }
                OrderStatus::Cancelled => {
                    self.store.update_order(
                        &order.trade_id,
                        None,
                        OrderStatus::Cancelled,
                        event.filled_qty,
                        event.avg_fill_price,
                        now,
                    )?;
                    self.close_lifecycle(s, &order.trade_id, StrategyStatus::Cancelled, event, now)
                }
                OrderStatus::Rejected => {
                    self.store.update_order(
                        &order.trade_id,
                        None,
                        OrderStatus::Rejected,
                        event.filled_qty,
                        event.avg_fill_price,
                        now,
                    )?;
                    self.close_lifecycle(s, &order.trade_id, StrategyStatus::Failed, event, now)
                }
                _ => Ok(()),
            }
        } else {
            // Open leg: position risk is live until this fills.
            match event.status {
                OrderStatus::Filled => {
                    self.store.update_order(
                        &order.trade_id,
                        None,
                        OrderStatus::Filled,
                        order.qty,
                        event.avg_fill_price,
                        now,
                    )?;
                    self.close_lifecycle(s, &order.trade_id, StrategyStatus::Filled, event, now)
                }
                OrderStatus::Cancelled | OrderStatus::Rejected => {
                    error!(
                        strategy_id = %s.id,
                        trade_id = %order.trade_id,
                        "roll open leg did not fill, position is naked"
                    );
                    self.store.append_event(
                        &s.id,
                        event_type::NAKED_RISK_ALERT,
                        json!({
                            "trade_id": order.trade_id,
                            "ib_order_id": event.ib_order_id,
                            "status": event.status.as_str(),
                        }),
                        now,
                    )?;
                    let target = if event.status == OrderStatus::Cancelled {
                        StrategyStatus::Cancelled
                    } else {
                        StrategyStatus::Failed
                    };
                    self.store.update_order(
                        &order.trade_id,
                        None,
                        event.status,
                        order.filled_qty,
                        event.avg_fill_price,
                        now,
                    )?;
                    self.close_lifecycle(s, &order.trade_id, target, event, now)
                }
                _ => Ok(()),
            }
        }
    }

    async fn submit_roll_open_leg(
        &self,
        s: &Strategy,
        order: &Order,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let Some(action @ TradeAction::FutRoll { .. }) = s.trade_action.clone() else {
            return Ok(());
        };
        // One open leg, ever.
        if self
            .store
            .get_runtime(&s.id, runtime_key::ROLL_OPEN_IB_ID)?
            .is_some()
        {
            return Ok(());
        }
        let payload = build_payload(s, &action, &order.trade_id, Some(RollLeg::Open));
        match self.submit_with_retry(&payload).await {
            Ok(ib_order_id) => {
                self.store.set_runtime(
                    &s.id,
                    runtime_key::ROLL_OPEN_IB_ID,
                    &json!(ib_order_id.clone()),
                    now,
                )?;
                self.store.append_event(
                    &s.id,
                    event_type::ROLL_OPEN_SUBMITTED,
                    json!({"ib_order_id": ib_order_id}),
                    now,
                )?;
                self.store.append_trade_log(
                    &order.trade_id,
                    &s.id,
                    "submission",
                    &format!("roll open leg accepted as {ib_order_id}"),
                    now,
                )?;
                Ok(())
            }
            Err(e) => {
                error!(
                    strategy_id = %s.id,
                    trade_id = %order.trade_id,
                    error = %e,
                    "roll open leg submission failed, position is naked"
                );
                self.store.append_event(
                    &s.id,
                    event_type::NAKED_RISK_ALERT,
                    json!({"trade_id": order.trade_id, "error": e.to_string()}),
                    now,
                )?;
                self.store.update_order(
                    &order.trade_id,
                    None,
                    OrderStatus::Rejected,
                    order.filled_qty,
                    None,
                    now,
                )?;
                self.store.transition(
                    &s.id,
                    StrategyStatus::OrderSubmitted,
                    StrategyStatus::Failed,
                    StatusPatch {
                        event_detail: Some(json!({"trade_id": order.trade_id})),
                        ..Default::default()
                    },
                    None,
                    now,
                )?;
                Ok(())
            }
        }
    }

    fn close_lifecycle(
        &self,
        s: &Strategy,
        trade_id: &str,
        target: StrategyStatus,
        event: &OrderEvent,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        // Duplicate terminal reports (event feed plus recovery query) are
        // no-ops once the strategy left ORDER_SUBMITTED.
        let current = self.store.get(&s.id)?;
        if current.status != StrategyStatus::OrderSubmitted {
            return Ok(());
        }
        self.store.transition(
            &s.id,
            StrategyStatus::OrderSubmitted,
            target,
            StatusPatch {
                event_detail: Some(json!({
                    "trade_id": trade_id,
                    "gateway_status": event.status.as_str(),
                })),
                ..Default::default()
            },
            None,
            now,
        )?;
        self.store.append_trade_log(
            trade_id,
            &s.id,
            "execution",
            &format!("gateway reported {}", event.status.as_str()),
            now,
        )?;
        info!(strategy_id = %s.id, trade_id, status = target.as_str(), "lifecycle closed");
        Ok(())
    }
}

/// Build the gateway payload for an action, or for one leg of a roll.
pub(crate) fn build_payload(
    s: &Strategy,
    action: &TradeAction,
    trade_id: &str,
    leg: Option<RollLeg>,
) -> OrderPayload {
    let sec_type = s.market.sec_type().as_str().to_string();
    let exchange = s.market.exchange().to_string();
    let currency = s.market.currency().to_string();
    match action {
        TradeAction::StockTrade {
            symbol,
            side,
            quantity,
            order_type,
            limit_price,
            allow_overnight,
            ..
        }
        | TradeAction::FutPosition {
            symbol,
            side,
            quantity,
            order_type,
            limit_price,
            allow_overnight,
            ..
        } => OrderPayload {
            trade_id: trade_id.to_string(),
            symbol: symbol.clone(),
            sec_type,
            exchange,
            currency,
            side: *side,
            quantity: *quantity,
            order_type: *order_type,
            limit_price: *limit_price,
            tif: "DAY".to_string(),
            allow_overnight: *allow_overnight,
            leg: None,
        },
        TradeAction::FutRoll {
            near_symbol,
            far_symbol,
            quantity,
            order_type,
            close_limit_price,
            open_limit_price,
            ..
        } => {
            let leg = leg.unwrap_or(RollLeg::Close);
            let (symbol, side, limit_price) = match leg {
                RollLeg::Close => (near_symbol.clone(), OrderSide::Sell, *close_limit_price),
                RollLeg::Open => (far_symbol.clone(), OrderSide::Buy, *open_limit_price),
            };
            OrderPayload {
                trade_id: trade_id.to_string(),
                symbol,
                sec_type,
                exchange,
                currency,
                side,
                quantity: *quantity,
                order_type: *order_type,
                limit_price,
                tif: "DAY".to_string(),
                allow_overnight: false,
                leg: Some(leg),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Market, OrderType};

    fn fut_strategy() -> Strategy {
        let now = Utc::now();
        Strategy {
            id: "roll-1".into(),
            idempotency_key: None,
            market: Market::UsFutures,
            trade_type: crate::models::TradeType::Close,
            condition_logic: crate::models::ConditionLogic::And,
            conditions: vec![],
            trade_action: None,
            symbols: vec![],
            next_strategy_id: None,
            upstream_only_activation: false,
            upstream_strategy_id: None,
            expire_mode: crate::models::ExpireMode::Relative,
            expire_in_seconds: Some(3600),
            expire_at: None,
            activated_at: None,
            logical_activated_at: None,
            status: StrategyStatus::PendingActivation,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn roll_legs_build_close_then_open() {
        let s = fut_strategy();
        let action = TradeAction::FutRoll {
            near_symbol: "ESU5".into(),
            far_symbol: "ESZ5".into(),
            quantity: 2.0,
            order_type: OrderType::Mkt,
            close_limit_price: None,
            open_limit_price: None,
            cancel_on_expiry: false,
        };
        let close = build_payload(&s, &action, "t-1", Some(RollLeg::Close));
        assert_eq!(close.symbol, "ESU5");
        assert_eq!(close.side, OrderSide::Sell);
        assert_eq!(close.leg, Some(RollLeg::Close));
        assert_eq!(close.tif, "DAY");

        let open = build_payload(&s, &action, "t-1", Some(RollLeg::Open));
        assert_eq!(open.symbol, "ESZ5");
        assert_eq!(open.side, OrderSide::Buy);
        // Quantity is preserved across the roll.
        assert_eq!(open.quantity, close.quantity);
    }

    #[test]
    fn stock_payload_carries_opaque_overnight_flag() {
        let mut s = fut_strategy();
        s.market = Market::UsStock;
        let action = TradeAction::StockTrade {
            symbol: "SLV".into(),
            side: OrderSide::Buy,
            quantity: 100.0,
            order_type: OrderType::Mkt,
            limit_price: None,
            allow_overnight: true,
            cancel_on_expiry: false,
        };
        let payload = build_payload(&s, &action, "t-1", None);
        assert!(payload.allow_overnight);
        assert_eq!(payload.sec_type, "STK");
        assert_eq!(payload.exchange, "SMART");
        assert_eq!(payload.currency, "USD");
    }
}
