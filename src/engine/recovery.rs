//! Boot recovery
//!
//! Reconstructs in-flight state after a restart: stale leases are
//! cleared, ACTIVE strategies resume scanning on their own, PAUSED stay
//! paused, and every ORDER_SUBMITTED strategy is reconciled against the
//! gateway's view of its order. Nothing is dropped; every prior event
//! remains auditable.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::engine::{runtime_key, Engine};
use crate::error::EngineResult;
use crate::gateway::OrderEvent;
use crate::models::events::event_type;
use crate::models::{OrderPayload, OrderStatus, StrategyStatus};

#[derive(Debug, Default)]
pub struct RecoverySummary {
    pub stale_leases_cleared: usize,
    pub orders_reconciled: usize,
    pub orders_resubmitted: usize,
}

impl Engine {
    pub async fn recover(&self, now: DateTime<Utc>) -> EngineResult<RecoverySummary> {
        let mut summary = RecoverySummary {
            stale_leases_cleared: self.store.clear_stale_leases(now)?,
            ..Default::default()
        };

        for s in self.store.list(Some(StrategyStatus::OrderSubmitted))? {
            let Some(order) = self.store.order_for_strategy(&s.id)? else {
                continue;
            };
            // For rolls, the open leg is the live order once submitted.
            let live_ib = self
                .store
                .get_runtime(&s.id, runtime_key::ROLL_OPEN_IB_ID)?
                .and_then(|v| v.as_str().map(String::from))
                .or_else(|| order.ib_order_id.clone());

            match live_ib {
                Some(ib_order_id) => match self.gateway.order_status(&ib_order_id).await {
                    Ok(report) => {
                        let event = OrderEvent {
                            ib_order_id: report.ib_order_id,
                            trade_id: order.trade_id.clone(),
                            status: report.status,
                            filled_qty: report.filled_qty,
                            avg_fill_price: report.avg_fill_price,
                            reason: None,
                            ts: now,
                        };
                        self.apply_order_event(&event, now).await?;
                        self.store.append_event(
                            &s.id,
                            event_type::RECOVERED,
                            json!({
                                "trade_id": order.trade_id,
                                "gateway_status": report.status.as_str(),
                            }),
                            now,
                        )?;
                        summary.orders_reconciled += 1;
                    }
                    Err(e) => {
                        // Keep tracking; the event feed may still deliver.
                        warn!(strategy_id = %s.id, error = %e, "order reconcile failed");
                    }
                },
                None => {
                    // Crashed between the submission transaction and the
                    // gateway ack. Submission is idempotent under trade_id,
                    // so resubmitting is safe.
                    let payload: OrderPayload = match serde_json::from_value(order.payload.clone())
                    {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(strategy_id = %s.id, error = %e, "order payload undecodable");
                            continue;
                        }
                    };
                    match self.gateway.submit_order(&payload).await {
                        Ok(ib_order_id) => {
                            self.store.update_order(
                                &order.trade_id,
                                Some(&ib_order_id),
                                OrderStatus::Submitted,
                                order.filled_qty,
                                order.avg_fill_price,
                                now,
                            )?;
                            self.store.append_event(
                                &s.id,
                                event_type::RECOVERED,
                                json!({
                                    "trade_id": order.trade_id,
                                    "resubmitted_as": ib_order_id,
                                }),
                                now,
                            )?;
                            summary.orders_resubmitted += 1;
                        }
                        Err(e) => {
                            warn!(strategy_id = %s.id, error = %e, "order resubmission failed");
                        }
                    }
                }
            }
        }

        info!(
            stale_leases = summary.stale_leases_cleared,
            reconciled = summary.orders_reconciled,
            resubmitted = summary.orders_resubmitted,
            "recovery complete"
        );
        Ok(summary)
    }
}
