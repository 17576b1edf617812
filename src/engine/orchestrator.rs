//! Trigger orchestrator
//!
//! One strategy run: refresh since-activation extrema, evaluate every
//! condition through the evaluator, combine with AND/OR, and on a
//! combined TRUE mint a trigger event and drive the trigger path
//! (chain activation, verification, submission). WAITING is neither true
//! nor false and never drives a transition.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::evaluator::{self, ConditionInputs, ConditionOutcome, PreparedCondition};
use crate::engine::{runtime_key, Engine};
use crate::error::{EngineError, EngineResult};
use crate::marketdata::{Bar, BarRequest, BarSize};
use crate::models::events::event_type;
use crate::models::{ConditionLogic, ConditionState, Metric, Strategy, StrategyStatus};
use crate::store::StatusPatch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The strategy was no longer ACTIVE when the worker got to it.
    Skipped,
    Evaluated {
        combined: ConditionState,
        triggered: bool,
    },
}

/// Combine per-condition states. `AND` short-circuits on FALSE, `OR` on
/// TRUE; WAITING propagates unless the short-circuit value was seen.
pub fn combine(logic: ConditionLogic, states: &[ConditionState]) -> ConditionState {
    match logic {
        ConditionLogic::And => {
            if states.iter().any(|s| *s == ConditionState::False) {
                ConditionState::False
            } else if states.iter().any(|s| {
                matches!(s, ConditionState::Waiting | ConditionState::NotEvaluated)
            }) {
                ConditionState::Waiting
            } else {
                ConditionState::True
            }
        }
        ConditionLogic::Or => {
            if states.iter().any(|s| *s == ConditionState::True) {
                ConditionState::True
            } else if states.iter().any(|s| {
                matches!(s, ConditionState::Waiting | ConditionState::NotEvaluated)
            }) {
                ConditionState::Waiting
            } else {
                ConditionState::False
            }
        }
    }
}

impl Engine {
    /// Worker entry: take the exclusive lease, run once, release.
    pub async fn process_strategy(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<RunOutcome> {
        let interval = self.config.worker.monitor_interval_seconds as i64;
        let ttl = ChronoDuration::seconds((interval * 2).max(60));
        self.store.acquire_lease(id, owner, ttl, now)?;
        let result = self.run_strategy(id, now).await;
        if let Err(e) = self.store.release_lease(id, owner) {
            warn!(strategy_id = %id, error = %e, "lease release failed");
        }
        result
    }

    /// One evaluation pass under the lease.
    pub async fn run_strategy(&self, id: &str, now: DateTime<Utc>) -> EngineResult<RunOutcome> {
        let s = self.store.get(id)?;
        // A re-triggered evaluator must observe the strategy already out
        // of ACTIVE and stop: this is the at-most-once trigger guard.
        if s.status != StrategyStatus::Active {
            debug!(strategy_id = %id, status = s.status.as_str(), "run skipped");
            return Ok(RunOutcome::Skipped);
        }

        if let Err(e) = self.refresh_extrema(&s, now).await {
            warn!(strategy_id = %id, error = %e, "extrema refresh failed");
        }

        let mut states = Vec::with_capacity(s.conditions.len());
        let mut reasons = Vec::with_capacity(s.conditions.len());
        let mut data_ends = Map::new();

        for condition in &s.conditions {
            let prepared = match evaluator::prepare(condition, &self.rules, now) {
                Ok(p) => p,
                Err(e) => {
                    self.record_runtime_error(&s.id, &condition.condition_id, &e, now)?;
                    return Ok(RunOutcome::Evaluated {
                        combined: ConditionState::Waiting,
                        triggered: false,
                    });
                }
            };
            let outcome = match self.evaluate_condition(&s, &prepared, now).await {
                Ok(o) => o,
                Err(e) => {
                    // Reject-policy data gaps and gateway faults are logged
                    // as runtime errors; the strategy does not transition.
                    self.record_runtime_error(&s.id, &condition.condition_id, &e, now)?;
                    self.store.upsert_run(
                        &s.id,
                        now,
                        now + ChronoDuration::seconds(
                            self.config.worker.monitor_interval_seconds as i64,
                        ),
                        false,
                        &format!("condition {} errored: {e}", condition.condition_id),
                        &Value::Object(data_ends),
                    )?;
                    return Ok(RunOutcome::Evaluated {
                        combined: ConditionState::Waiting,
                        triggered: false,
                    });
                }
            };

            self.store.upsert_condition_state(
                &s.id,
                &condition.condition_id,
                outcome.state,
                outcome.observed_value,
                now,
            )?;
            if let Some(end) = outcome.data_end {
                data_ends.insert(condition.condition_id.clone(), json!(end.timestamp()));
            }
            reasons.push(format!("{}: {}", condition.condition_id, outcome.reason));
            states.push(outcome.state);

            // Short-circuit: AND stops on FALSE, OR stops on TRUE.
            match (s.condition_logic, outcome.state) {
                (ConditionLogic::And, ConditionState::False)
                | (ConditionLogic::Or, ConditionState::True) => break,
                _ => {}
            }
        }

        let combined = combine(s.condition_logic, &states);
        let decision_reason = reasons.join("; ");
        self.store.upsert_run(
            &s.id,
            now,
            now + ChronoDuration::seconds(self.config.worker.monitor_interval_seconds as i64),
            combined == ConditionState::True,
            &decision_reason,
            &Value::Object(data_ends),
        )?;

        if combined != ConditionState::True {
            return Ok(RunOutcome::Evaluated {
                combined,
                triggered: false,
            });
        }

        self.fire_trigger(&s, &decision_reason, now).await?;
        Ok(RunOutcome::Evaluated {
            combined,
            triggered: true,
        })
    }

    /// Combined TRUE: mint the trigger event, move to TRIGGERED, then run
    /// chain activation, verification, and submission.
    async fn fire_trigger(
        &self,
        s: &Strategy,
        decision_reason: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let trigger_event_id = Uuid::new_v4().to_string();
        let patch = StatusPatch {
            event_type: Some(event_type::TRIGGERED),
            event_detail: Some(json!({
                "trigger_event_id": trigger_event_id,
                "reason": decision_reason,
            })),
            ..Default::default()
        };
        // Rejects if someone else moved the strategy since this run read it.
        let s = self.store.transition(
            &s.id,
            StrategyStatus::Active,
            StrategyStatus::Triggered,
            patch,
            Some(s.version),
            now,
        )?;
        info!(strategy_id = %s.id, trigger_event_id = %trigger_event_id, "strategy triggered");

        if s.next_strategy_id.is_some() {
            // A failed downstream activation never unwinds the trigger.
            if let Err(e) = self.activate_downstream(&s, &trigger_event_id, now).await {
                warn!(strategy_id = %s.id, error = %e, "chain activation failed");
                self.store.append_event(
                    &s.id,
                    event_type::RUNTIME_ERROR,
                    json!({"stage": "chain_activation", "error": e.to_string()}),
                    now,
                )?;
            }
        }

        match s.trade_action.clone() {
            None => {
                // Pure chain gate: nothing to execute.
                self.store.transition(
                    &s.id,
                    StrategyStatus::Triggered,
                    StrategyStatus::Filled,
                    StatusPatch {
                        event_detail: Some(json!({"chain_only": true})),
                        ..Default::default()
                    },
                    None,
                    now,
                )?;
                Ok(())
            }
            Some(action) => {
                let trade_id = self.verify_trigger(&s, &action, now).await?;
                match trade_id {
                    Some(trade_id) => self.submit_trade(&s, &action, &trade_id, now).await,
                    None => Ok(()), // verification rejected; strategy already FAILED
                }
            }
        }
    }

    async fn evaluate_condition(
        &self,
        s: &Strategy,
        prepared: &PreparedCondition,
        _now: DateTime<Utc>,
    ) -> EngineResult<ConditionOutcome> {
        let mut series: Vec<Vec<Bar>> = Vec::with_capacity(prepared.requests.len());
        for req in &prepared.requests {
            let (bars, meta) = self
                .cache
                .get_historical_bars(self.gateway.as_ref(), req, None, None)
                .await?;
            debug!(
                strategy_id = %s.id,
                contract = %req.contract,
                bars = bars.len(),
                hit_ratio = meta.cache_hit_ratio,
                "condition data ready"
            );
            series.push(bars);
        }

        let needs_extrema = matches!(
            prepared.condition.metric,
            Metric::DrawdownPct | Metric::RallyPct
        );
        let (high, low) = if needs_extrema {
            (
                self.store
                    .get_runtime_f64(&s.id, runtime_key::SINCE_ACTIVATION_HIGH)?,
                self.store
                    .get_runtime_f64(&s.id, runtime_key::SINCE_ACTIVATION_LOW)?,
            )
        } else {
            (None, None)
        };

        let inputs = ConditionInputs {
            bars_a: &series[0],
            bars_b: series.get(1).map(|b| b.as_slice()),
            since_activation_high: high,
            since_activation_low: low,
        };
        evaluator::evaluate(prepared, &inputs)
    }

    /// Roll since-activation extrema forward over bars seen since the
    /// last scan. Window starts are always computed from logical
    /// activation time.
    async fn refresh_extrema(&self, s: &Strategy, now: DateTime<Utc>) -> EngineResult<()> {
        let Some(product) = self.primary_product(s) else {
            return Ok(());
        };
        let scanned_to = self
            .store
            .get_runtime(&s.id, runtime_key::EXTREMA_SCANNED_TO)?
            .and_then(|v| v.as_i64())
            .map(|t| DateTime::from_timestamp(t, 0).unwrap_or(now))
            .or(s.logical_activated_at);
        let Some(start) = scanned_to else {
            return Ok(());
        };
        if start >= now {
            return Ok(());
        }

        let req = BarRequest {
            contract: product,
            bar_size: BarSize::Min1,
            start,
            end: now,
            what_to_show: Default::default(),
            use_rth: false,
            include_partial_bar: true,
        };
        let (bars, _) = self
            .cache
            .get_historical_bars(self.gateway.as_ref(), &req, None, None)
            .await?;
        if bars.is_empty() {
            return Ok(());
        }

        let high = self
            .store
            .get_runtime_f64(&s.id, runtime_key::SINCE_ACTIVATION_HIGH)?;
        let low = self
            .store
            .get_runtime_f64(&s.id, runtime_key::SINCE_ACTIVATION_LOW)?;
        let (high, low) = evaluator::roll_extrema(&bars, high, low);
        if let Some(h) = high {
            self.store
                .set_runtime_f64(&s.id, runtime_key::SINCE_ACTIVATION_HIGH, h, now)?;
        }
        if let Some(l) = low {
            self.store
                .set_runtime_f64(&s.id, runtime_key::SINCE_ACTIVATION_LOW, l, now)?;
        }
        self.store.set_runtime(
            &s.id,
            runtime_key::EXTREMA_SCANNED_TO,
            &json!(now.timestamp()),
            now,
        )?;
        Ok(())
    }

    fn record_runtime_error(
        &self,
        strategy_id: &str,
        condition_id: &str,
        e: &EngineError,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        warn!(strategy_id, condition_id, error = %e, "condition evaluation error");
        self.store.append_event(
            strategy_id,
            event_type::RUNTIME_ERROR,
            json!({
                "condition_id": condition_id,
                "code": e.code(),
                "error": e.to_string(),
            }),
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConditionState::*;

    #[test]
    fn and_combination() {
        assert_eq!(combine(ConditionLogic::And, &[True, True]), True);
        assert_eq!(combine(ConditionLogic::And, &[True, False]), False);
        // WAITING blocks a TRUE but never wins over FALSE.
        assert_eq!(combine(ConditionLogic::And, &[True, Waiting]), Waiting);
        assert_eq!(combine(ConditionLogic::And, &[Waiting, False]), False);
    }

    #[test]
    fn or_combination() {
        assert_eq!(combine(ConditionLogic::Or, &[False, True]), True);
        assert_eq!(combine(ConditionLogic::Or, &[False, False]), False);
        assert_eq!(combine(ConditionLogic::Or, &[False, Waiting]), Waiting);
        assert_eq!(combine(ConditionLogic::Or, &[Waiting, True]), True);
    }
}
