//! The execution engine
//!
//! `Engine` wires the store, the bar cache, and the gateway behind the
//! operations the transport layer exposes: create/edit strategies,
//! activate/pause/resume/cancel, and the monitoring pipeline that runs in
//! the background. Each submodule covers one stage of the pipeline.

pub mod activator;
pub mod chain;
pub mod evaluator;
pub mod expiry;
pub mod orchestrator;
pub mod recovery;
pub mod scheduler;
pub mod submitter;
pub mod verifier;

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::{AppConfig, ConditionRules};
use crate::error::{EngineError, EngineResult};
use crate::gateway::GatewayClient;
use crate::marketdata::{BarRequest, BarSize, BarWindowCache};
use crate::models::events::event_type;
use crate::models::{
    Condition, ConditionLogic, ExpireMode, Strategy, StrategyStatus, StrategySymbol, TradeAction,
    TradeType,
};
use crate::store::{BasicPatch, StatusPatch, StrategyStore};
use crate::validate;

/// Keys in the per-strategy runtime scratch table.
pub mod runtime_key {
    pub const SINCE_ACTIVATION_HIGH: &str = "since_activation_high";
    pub const SINCE_ACTIVATION_LOW: &str = "since_activation_low";
    pub const ANCHOR_PRICE: &str = "anchor_price";
    pub const EXTREMA_SCANNED_TO: &str = "extrema_scanned_to";
    pub const ROLLED_AT: &str = "rolled_at";
    pub const ROLL_CLOSE_IB_ID: &str = "roll_close_ib_id";
    pub const ROLL_OPEN_IB_ID: &str = "roll_open_ib_id";
    pub const EXPIRY_CANCEL_REQUESTED: &str = "expiry_cancel_requested";
}

#[derive(Clone)]
pub struct Engine {
    pub store: StrategyStore,
    pub cache: BarWindowCache,
    pub gateway: Arc<dyn GatewayClient>,
    pub config: Arc<AppConfig>,
    pub rules: Arc<ConditionRules>,
}

/// Partial update accepted by `PATCH .../basic`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BasicPatchInput {
    #[serde(default)]
    pub trade_type: Option<TradeType>,
    #[serde(default)]
    pub condition_logic: Option<ConditionLogic>,
    #[serde(default)]
    pub next_strategy_id: Option<String>,
    #[serde(default)]
    pub clear_next_strategy_id: bool,
    #[serde(default)]
    pub upstream_only_activation: Option<bool>,
    #[serde(default)]
    pub expire_mode: Option<ExpireMode>,
    #[serde(default)]
    pub expire_in_seconds: Option<i64>,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub symbols: Option<Vec<StrategySymbol>>,
}

impl Engine {
    pub fn new(
        store: StrategyStore,
        cache: BarWindowCache,
        gateway: Arc<dyn GatewayClient>,
        config: Arc<AppConfig>,
        rules: Arc<ConditionRules>,
    ) -> Self {
        Self {
            store,
            cache,
            gateway,
            config,
            rules,
        }
    }

    // ---- CRUD ------------------------------------------------------------

    pub fn create_strategy(
        &self,
        input: validate::NewStrategyInput,
        now: DateTime<Utc>,
    ) -> EngineResult<Strategy> {
        let strategy =
            validate::build_strategy(input, &self.config.limits, &self.rules, now)?;
        if let Some(next) = &strategy.next_strategy_id {
            // Downstream must exist before it can be chained to.
            self.store.get(next)?;
            let edges = self.store.chain_edges()?;
            chain::validate_chain_edit(&edges, &strategy.id, Some(next))?;
        }
        self.store.create(&strategy, now)
    }

    pub fn patch_basic(
        &self,
        id: &str,
        input: BasicPatchInput,
        now: DateTime<Utc>,
    ) -> EngineResult<Strategy> {
        self.store.assert_unleased(id, now)?;
        let current = self.store.get(id)?;

        let next: Option<Option<String>> = if input.clear_next_strategy_id {
            Some(None)
        } else {
            input.next_strategy_id.clone().map(Some)
        };

        // Validate the post-edit shape before touching the row.
        let trade_type = input.trade_type.unwrap_or(current.trade_type);
        let symbols = input.symbols.clone().unwrap_or_else(|| current.symbols.clone());
        validate::validate_symbols(&symbols, trade_type)?;
        validate::validate_conditions(
            &current.conditions,
            &symbols,
            &self.config.limits,
            &self.rules,
        )?;
        if let Some(action) = &current.trade_action {
            validate::validate_action(action, current.market, &symbols)?;
        }
        let expire_mode = input.expire_mode.unwrap_or(current.expire_mode);
        let expire_in_seconds = match expire_mode {
            ExpireMode::Relative => input.expire_in_seconds.or(current.expire_in_seconds),
            ExpireMode::Absolute => None,
        };
        let expire_at = match expire_mode {
            ExpireMode::Relative => None,
            ExpireMode::Absolute => input.expire_at.or(current.expire_at),
        };
        validate::validate_expiry(expire_mode, expire_in_seconds, expire_at)?;

        if let Some(Some(new_next)) = &next {
            if new_next.eq_ignore_ascii_case(id) {
                return Err(EngineError::CycleDetected(format!(
                    "strategy {id} cannot chain to itself"
                )));
            }
            self.store.get(new_next)?;
            let edges = self.store.chain_edges()?;
            chain::validate_chain_edit(&edges, id, Some(new_next))?;
        }

        let patch = BasicPatch {
            trade_type: input.trade_type,
            condition_logic: input.condition_logic,
            next_strategy_id: next,
            upstream_only_activation: input.upstream_only_activation,
            expire_mode: input.expire_mode,
            expire_in_seconds: Some(expire_in_seconds),
            expire_at: Some(expire_at),
            symbols: input.symbols,
        };
        self.store.patch_basic(id, patch, now)
    }

    pub fn put_conditions(
        &self,
        id: &str,
        conditions: Vec<Condition>,
        now: DateTime<Utc>,
    ) -> EngineResult<Strategy> {
        self.store.assert_unleased(id, now)?;
        let current = self.store.get(id)?;
        validate::validate_conditions(
            &conditions,
            &current.symbols,
            &self.config.limits,
            &self.rules,
        )?;
        self.store.put_conditions(id, &conditions, now)
    }

    pub fn put_actions(
        &self,
        id: &str,
        action: Option<TradeAction>,
        now: DateTime<Utc>,
    ) -> EngineResult<Strategy> {
        self.store.assert_unleased(id, now)?;
        let current = self.store.get(id)?;
        if let Some(action) = &action {
            validate::validate_action(action, current.market, &current.symbols)?;
        }
        self.store.put_actions(id, action.as_ref(), now)
    }

    pub fn delete_strategy(&self, id: &str, now: DateTime<Utc>) -> EngineResult<()> {
        self.store.assert_unleased(id, now)?;
        self.store.soft_delete(id, now)
    }

    // ---- control ---------------------------------------------------------

    /// Manual activation: eligibility gate, preflight, then the shared
    /// activation bookkeeping with logical time equal to wall time.
    pub async fn activate(&self, id: &str, now: DateTime<Utc>) -> EngineResult<Strategy> {
        self.store.assert_unleased(id, now)?;
        let s = self.store.get(id)?;
        if s.upstream_only_activation {
            return Err(EngineError::UpstreamOnlyActivation(id.to_string()));
        }
        if s.conditions.is_empty() {
            return Err(EngineError::Validation(
                "cannot activate a strategy without conditions".to_string(),
            ));
        }
        if s.trade_action.is_none() && s.next_strategy_id.is_none() {
            return Err(EngineError::Validation(
                "cannot activate a strategy with neither an action nor a chain target".to_string(),
            ));
        }

        self.store.transition(
            id,
            StrategyStatus::PendingActivation,
            StrategyStatus::Verifying,
            StatusPatch::default(),
            None,
            now,
        )?;

        if let Err(e) = self.preflight(&s).await {
            self.store.transition(
                id,
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

        self.complete_activation(id, now, now).await
    }

    /// Preflight for VERIFYING: the gateway answers and every condition
    /// resolves against the rules config.
    async fn preflight(&self, s: &Strategy) -> EngineResult<()> {
        self.gateway.health_check().await?;
        for c in &s.conditions {
            evaluator::prepare(c, &self.rules, Utc::now())?;
        }
        Ok(())
    }

    /// Shared VERIFYING -> ACTIVE bookkeeping for manual and chain
    /// activation: resolve relative expiry against wall-clock activation,
    /// seed since-activation extrema from the prevailing mid, and back-fill
    /// the gap when logical activation predates wall activation.
    pub(crate) async fn complete_activation(
        &self,
        id: &str,
        logical_activated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EngineResult<Strategy> {
        let s = self.store.get(id)?;
        let expire_at = match s.expire_mode {
            ExpireMode::Relative => s
                .expire_in_seconds
                .map(|secs| now + ChronoDuration::seconds(secs)),
            ExpireMode::Absolute => s.expire_at,
        };

        let patch = StatusPatch {
            activated_at: Some(now),
            logical_activated_at: Some(logical_activated_at),
            expire_at,
            event_type: Some(event_type::ACTIVATED),
            event_detail: Some(json!({
                "logical_activated_at": logical_activated_at.to_rfc3339(),
            })),
            ..Default::default()
        };
        let s = self.store.transition(
            id,
            StrategyStatus::Verifying,
            StrategyStatus::Active,
            patch,
            None,
            now,
        )?;

        self.store.init_condition_states(&s)?;
        self.seed_extrema(&s, logical_activated_at, now).await?;
        info!(strategy_id = %id, "strategy active");
        Ok(self.store.get(id)?)
    }

    /// Initialize extrema to the prevailing mid, then replay the gap
    /// between logical and wall activation so chain-delayed strategies do
    /// not miss extrema. The replay reads from logical activation time,
    /// never from wall activation, even when the two coincide.
    async fn seed_extrema(
        &self,
        s: &Strategy,
        logical_activated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let Some(product) = self.primary_product(s) else {
            return Ok(());
        };

        let mut high = None;
        let mut low = None;
        match self.cache.latest_bar(self.gateway.as_ref(), &product, now).await {
            Ok(Some(bar)) => {
                let mid = bar.mid();
                high = Some(mid);
                low = Some(mid);
            }
            Ok(None) => {}
            Err(e) => warn!(strategy_id = %s.id, error = %e, "no prevailing price at activation"),
        }

        if logical_activated_at < now {
            let req = BarRequest {
                contract: product.clone(),
                bar_size: BarSize::Min1,
                start: logical_activated_at,
                end: now,
                what_to_show: Default::default(),
                use_rth: false,
                include_partial_bar: true,
            };
            match self
                .cache
                .get_historical_bars(self.gateway.as_ref(), &req, None, None)
                .await
            {
                Ok((bars, _)) => {
                    let (h, l) = evaluator::roll_extrema(&bars, high, low);
                    high = h;
                    low = l;
                }
                Err(e) => {
                    warn!(strategy_id = %s.id, error = %e, "extrema back-fill failed");
                }
            }
        }

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

    /// The contract whose prices drive extrema bookkeeping: the first
    /// condition's primary product, falling back to the first symbol.
    pub(crate) fn primary_product(&self, s: &Strategy) -> Option<String> {
        s.conditions
            .first()
            .map(|c| c.product.clone())
            .or_else(|| s.symbols.first().map(|sym| sym.symbol.clone()))
    }

    pub fn pause(&self, id: &str, now: DateTime<Utc>) -> EngineResult<Strategy> {
        self.store.assert_unleased(id, now)?;
        self.store.transition(
            id,
            StrategyStatus::Active,
            StrategyStatus::Paused,
            StatusPatch::default(),
            None,
            now,
        )
    }

    pub fn resume(&self, id: &str, now: DateTime<Utc>) -> EngineResult<Strategy> {
        self.store.assert_unleased(id, now)?;
        self.store.transition(
            id,
            StrategyStatus::Paused,
            StrategyStatus::Active,
            StatusPatch::default(),
            None,
            now,
        )
    }

    /// Cancel is a no-op on terminal strategies and refused while an
    /// order is live; otherwise the strategy moves to CANCELLED.
    pub fn cancel(&self, id: &str, now: DateTime<Utc>) -> EngineResult<Strategy> {
        let s = self.store.get(id)?;
        if s.status.is_terminal() {
            return Ok(s);
        }
        if s.status == StrategyStatus::OrderSubmitted {
            return Err(EngineError::InvalidTransition {
                from: s.status,
                to: StrategyStatus::Cancelled,
            });
        }
        self.store.assert_unleased(id, now)?;
        self.store.transition(
            id,
            s.status,
            StrategyStatus::Cancelled,
            StatusPatch::default(),
            None,
            now,
        )
    }
}
