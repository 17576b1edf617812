//! Audit records: strategy events, verification events, activations,
//! trade logs, and per-strategy run bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type names used across the engine. Plain strings in the store;
/// centralized here so call sites stay consistent.
pub mod event_type {
    pub const CREATED: &str = "created";
    pub const UPDATED: &str = "updated";
    pub const STATUS_CHANGED: &str = "status_changed";
    pub const ACTIVATED: &str = "activated";
    pub const CHAIN_ACTIVATED: &str = "chain_activated";
    pub const TRIGGERED: &str = "triggered";
    pub const VERIFICATION_PASSED: &str = "verification_passed";
    pub const VERIFICATION_FAILED: &str = "verification_failed";
    pub const ORDER_SUBMITTED: &str = "order_submitted";
    pub const ORDER_UPDATE: &str = "order_update";
    pub const EXPIRED: &str = "expired";
    pub const EXPIRY_CANCEL_REQUESTED: &str = "expiry_cancel_requested";
    pub const ROLL_CLOSE_FILLED: &str = "roll_close_filled";
    pub const ROLL_OPEN_SUBMITTED: &str = "roll_open_submitted";
    pub const NAKED_RISK_ALERT: &str = "naked_risk_alert";
    pub const RUNTIME_ERROR: &str = "runtime_error";
    pub const RECOVERED: &str = "recovered";
    pub const DELETED: &str = "deleted";
}

/// Append-only audit entry. Insertion order is preserved per strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyEvent {
    pub id: i64,
    pub strategy_id: String,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub detail: Value,
}

/// Audit of one pre-trade rule evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationEvent {
    pub id: i64,
    pub trade_id: String,
    pub strategy_id: String,
    pub rule_id: String,
    pub rule_version: i64,
    pub passed: bool,
    pub reason: String,
    pub snapshot: Value,
    pub ts: DateTime<Utc>,
}

/// One chain activation. `(trigger_event_id, to_strategy_id)` is unique,
/// which is what makes chain activation at-most-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub id: i64,
    pub from_strategy_id: String,
    pub to_strategy_id: String,
    pub trigger_event_id: String,
    pub effective_activated_at: DateTime<Utc>,
    pub market_snapshot: Value,
    pub context: Value,
    pub created_at: DateTime<Utc>,
}

/// Merged chronological record of verification and execution stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLogEntry {
    pub id: i64,
    pub trade_id: String,
    pub strategy_id: String,
    pub ts: DateTime<Utc>,
    pub stage: String,
    pub message: String,
}

/// Per-strategy monitoring bookkeeping, upserted once per worker run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRun {
    pub strategy_id: String,
    pub first_evaluated_at: DateTime<Utc>,
    pub evaluated_at: DateTime<Utc>,
    pub suggested_next_monitor_at: DateTime<Utc>,
    pub condition_met: bool,
    pub decision_reason: String,
    /// Per-metric `last_monitoring_data_end_at`, keyed by condition id.
    pub last_data_end: Value,
    pub run_count: i64,
}

/// Read model of a condition's latest evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionStateRow {
    pub strategy_id: String,
    pub condition_id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_evaluated_at: Option<DateTime<Utc>>,
}
