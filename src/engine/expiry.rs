//! Expiry sweep
//!
//! Periodically disposes of strategies whose `expire_at` has passed.
//! Pre-order states move to EXPIRED; a live order is cancelled only when
//! the action opted in via `cancel_on_expiry`, and the lifecycle then
//! follows the gateway's ack (a fill that races the cancel wins). PAUSED
//! strategies keep accumulating elapsed time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::interval;
use tracing::{info, warn};

use crate::engine::{runtime_key, Engine};
use crate::error::EngineResult;
use crate::models::events::event_type;
use crate::models::{StrategyStatus, TradeAction};
use crate::store::StatusPatch;

const EXPIRY_SWEEP_INTERVAL_SECS: u64 = 15;

impl Engine {
    pub fn spawn_expiry_loop(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(EXPIRY_SWEEP_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if let Err(e) = engine.run_expiry_sweep(Utc::now()).await {
                    warn!(error = %e, "expiry sweep failed");
                }
            }
        })
    }

    /// One sweep over everything past its expiry instant.
    pub async fn run_expiry_sweep(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let due = self.store.list_expired(now)?;
        let mut disposed = 0;
        for s in due {
            match s.status {
                StrategyStatus::PendingActivation
                | StrategyStatus::VerifyFailed
                | StrategyStatus::Active
                | StrategyStatus::Paused
                | StrategyStatus::Triggered => {
                    self.store.transition(
                        &s.id,
                        s.status,
                        StrategyStatus::Expired,
                        StatusPatch {
                            event_type: Some(event_type::EXPIRED),
                            event_detail: Some(json!({
                                "expire_at": s.expire_at.map(|t| t.timestamp()),
                            })),
                            ..Default::default()
                        },
                        None,
                        now,
                    )?;
                    info!(strategy_id = %s.id, "strategy expired");
                    disposed += 1;
                }
                StrategyStatus::OrderSubmitted => {
                    if self.expire_live_order(&s.id, s.trade_action.as_ref(), now).await? {
                        disposed += 1;
                    }
                }
                // VERIFYING settles within the activation call; the next
                // sweep catches whichever state it lands in.
                StrategyStatus::Verifying => {}
                _ => {}
            }
        }
        Ok(disposed)
    }

    /// Ask the gateway to cancel a live order, once. The terminal state
    /// arrives through the order event feed: CANCELLED on the ack, or
    /// FILLED if the fill beats the cancel.
    async fn expire_live_order(
        &self,
        strategy_id: &str,
        action: Option<&TradeAction>,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let cancel_on_expiry = action.map(|a| a.cancel_on_expiry()).unwrap_or(false);
        if !cancel_on_expiry {
            // Keep tracking; the order outlives the rule by choice.
            return Ok(false);
        }
        if self
            .store
            .get_runtime(strategy_id, runtime_key::EXPIRY_CANCEL_REQUESTED)?
            .is_some()
        {
            return Ok(false);
        }
        let Some(order) = self.store.order_for_strategy(strategy_id)? else {
            return Ok(false);
        };
        // A roll's live leg is the open leg once it exists.
        let ib_order_id = self
            .store
            .get_runtime(strategy_id, runtime_key::ROLL_OPEN_IB_ID)?
            .and_then(|v| v.as_str().map(String::from))
            .or(order.ib_order_id);
        let Some(ib_order_id) = ib_order_id else {
            return Ok(false);
        };

        if let Err(e) = self.gateway.cancel_order(&ib_order_id).await {
            warn!(strategy_id, ib_order_id = %ib_order_id, error = %e, "expiry cancel failed");
            return Ok(false);
        }
        self.store.set_runtime(
            strategy_id,
            runtime_key::EXPIRY_CANCEL_REQUESTED,
            &json!(now.timestamp()),
            now,
        )?;
        self.store.append_event(
            strategy_id,
            event_type::EXPIRY_CANCEL_REQUESTED,
            json!({"ib_order_id": ib_order_id, "trade_id": order.trade_id}),
            now,
        )?;
        info!(strategy_id, ib_order_id = %ib_order_id, "expiry cancel requested");
        Ok(true)
    }
}
