//! Engine error taxonomy
//!
//! Every user-visible failure carries a stable `code` plus a human message.
//! Locking errors additionally carry the `lock_until` instant so callers
//! know when to retry.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::strategy::StrategyStatus;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller fault: malformed or inconsistent input.
    #[error("{0}")]
    Validation(String),

    /// `next_strategy_id` edit would close a cycle.
    #[error("chain cycle detected: {0}")]
    CycleDetected(String),

    /// A worker currently holds the strategy's execution lease.
    #[error("strategy {strategy_id} is locked until {lock_until}")]
    StrategyLocked {
        strategy_id: String,
        lock_until: DateTime<Utc>,
    },

    /// Requested status change is not in the admissible-transition table.
    #[error("transition {from:?} -> {to:?} is not admissible")]
    InvalidTransition {
        from: StrategyStatus,
        to: StrategyStatus,
    },

    /// Manual activation of an upstream-only strategy.
    #[error("strategy {0} can only be activated by its upstream trigger")]
    UpstreamOnlyActivation(String),

    #[error("strategy {0} not found")]
    NotFound(String),

    /// Optimistic-concurrency token mismatch.
    #[error("version conflict on strategy {strategy_id}: expected {expected}, found {found}")]
    VersionConflict {
        strategy_id: String,
        expected: i64,
        found: i64,
    },

    /// A pre-trade rule rejected the action.
    #[error("verification rule {rule_id} rejected trade: {reason}")]
    VerificationRejected { rule_id: String, reason: String },

    /// Market data missing under a best-effort policy. Not a caller error;
    /// the evaluator reports WAITING and the run moves on.
    #[error("market data unavailable: {0}")]
    DataUnavailable(String),

    #[error("gateway timed out after {0}s")]
    GatewayTimeout(u64),

    /// Explicit reject from the gateway. Terminal for the order.
    #[error("gateway rejected request: {0}")]
    GatewayRejected(String),

    /// Transient gateway/network fault. Retried with bounded backoff.
    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// Store constraint violation or corruption. Process-fatal at boot.
    #[error("store integrity error: {0}")]
    Integrity(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Stable machine-readable code for transport layers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION",
            EngineError::CycleDetected(_) => "CYCLE_DETECTED",
            EngineError::StrategyLocked { .. } => "STRATEGY_LOCKED",
            EngineError::InvalidTransition { .. } => "INVALID_TRANSITION",
            EngineError::UpstreamOnlyActivation(_) => "UPSTREAM_ONLY_ACTIVATION",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::VersionConflict { .. } => "CONFLICT",
            EngineError::VerificationRejected { .. } => "VERIFICATION_REJECTED",
            EngineError::DataUnavailable(_) => "DATA_UNAVAILABLE",
            EngineError::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            EngineError::GatewayRejected(_) => "GATEWAY_REJECTED",
            EngineError::GatewayUnavailable(_) => "GATEWAY_UNAVAILABLE",
            EngineError::Integrity(_) => "INTEGRITY",
            EngineError::Config(_) => "CONFIG",
        }
    }

    /// Whether a leased run may retry the failed step.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            EngineError::GatewayTimeout(_) | EngineError::GatewayUnavailable(_)
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Integrity(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Integrity(format!("payload encoding: {e}"))
    }
}
