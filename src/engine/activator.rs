//! Chain activation
//!
//! An upstream trigger activates its downstream at most once per
//! `(trigger_event_id, downstream)`: the activation row insert is the
//! guard, and a unique-constraint hit is a silent no-op. The downstream's
//! logical activation time is the upstream trigger instant; its
//! wall-clock activation is now, and any gap between the two is
//! back-filled into the extrema by the shared activation bookkeeping.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::engine::{runtime_key, Engine};
use crate::error::EngineResult;
use crate::models::events::event_type;
use crate::models::{Strategy, StrategyStatus};
use crate::store::StatusPatch;

impl Engine {
    pub(crate) async fn activate_downstream(
        &self,
        upstream: &Strategy,
        trigger_event_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let Some(down_id) = upstream.next_strategy_id.clone() else {
            return Ok(());
        };
        let down = self.store.get(&down_id)?;

        // Anchor snapshot from the latest basis at the trigger moment.
        let product = self.primary_product(&down);
        let mut snapshot = json!({});
        let mut anchor_price = None;
        if let Some(product) = &product {
            match self.cache.latest_bar(self.gateway.as_ref(), product, now).await {
                Ok(Some(bar)) => {
                    anchor_price = Some(bar.close);
                    snapshot = json!({
                        "contract": product,
                        "ts": bar.ts.timestamp(),
                        "close": bar.close,
                        "mid": bar.mid(),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(strategy_id = %down.id, error = %e, "no market snapshot at trigger")
                }
            }
        }

        let inserted = self.store.try_record_activation(
            &upstream.id,
            &down.id,
            trigger_event_id,
            now,
            &snapshot,
            &json!({
                "upstream_strategy_id": upstream.id,
                "trigger_event_id": trigger_event_id,
            }),
            now,
        )?;
        if !inserted {
            // Someone already activated this downstream for this trigger.
            return Ok(());
        }

        if down.status != StrategyStatus::PendingActivation {
            warn!(
                strategy_id = %down.id,
                status = down.status.as_str(),
                "downstream not pending, chain activation skipped"
            );
            self.store.append_event(
                &upstream.id,
                event_type::RUNTIME_ERROR,
                json!({
                    "stage": "chain_activation",
                    "downstream": down.id,
                    "downstream_status": down.status.as_str(),
                }),
                now,
            )?;
            return Ok(());
        }

        self.store.transition(
            &down.id,
            StrategyStatus::PendingActivation,
            StrategyStatus::Verifying,
            StatusPatch {
                upstream_strategy_id: Some(upstream.id.clone()),
                event_type: Some(event_type::CHAIN_ACTIVATED),
                event_detail: Some(json!({
                    "upstream_strategy_id": upstream.id,
                    "trigger_event_id": trigger_event_id,
                })),
                ..Default::default()
            },
            None,
            now,
        )?;

        if let Err(e) = self.preflight(&down).await {
            self.store.transition(
                &down.id,
                StrategyStatus::Verifying,
                StrategyStatus::VerifyFailed,
                StatusPatch {
                    event_detail: Some(json!({"reason": e.to_string()})),
                    ..Default::default()
                },
                None,
                now,
            )?;
            return Err(e);
        }

        if let Some(price) = anchor_price {
            self.store
                .set_runtime_f64(&down.id, runtime_key::ANCHOR_PRICE, price, now)?;
        }

        // Logical activation is the upstream trigger instant.
        self.complete_activation(&down.id, now, now).await?;
        info!(
            upstream = %upstream.id,
            downstream = %down.id,
            trigger_event_id = %trigger_event_id,
            "chain activated"
        );
        Ok(())
    }
}
