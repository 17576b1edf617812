//! Strategy store
//!
//! Single source of truth for all engine state. Every mutating operation
//! runs in one transaction; `transition` is the only path that changes
//! `status` and rejects anything outside the admissible table. Writes are
//! serialized behind the connection mutex (short critical sections, no
//! awaits while held).

pub mod schema;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::models::events::{event_type, ConditionStateRow};
use crate::models::{
    Condition, ConditionLogic, ConditionState, ExpireMode, Market, Order, OrderStatus, Strategy,
    StrategyEvent, StrategyRun, StrategyStatus, StrategySymbol, SymbolTradeType, TradeAction,
    TradeInstruction, TradeLogEntry, TradeType, VerificationEvent,
};
use schema::SCHEMA_SQL;

/// Optional mutations applied together with a status transition.
#[derive(Debug, Default, Clone)]
pub struct StatusPatch {
    pub activated_at: Option<DateTime<Utc>>,
    pub logical_activated_at: Option<DateTime<Utc>>,
    pub expire_at: Option<DateTime<Utc>>,
    pub upstream_strategy_id: Option<String>,
    /// Event type for the audit entry; defaults to `status_changed`.
    pub event_type: Option<&'static str>,
    pub event_detail: Option<Value>,
}

/// Partial update for `patchBasic`.
#[derive(Debug, Default, Clone)]
pub struct BasicPatch {
    pub trade_type: Option<TradeType>,
    pub condition_logic: Option<ConditionLogic>,
    /// `Some(None)` clears the chain link.
    pub next_strategy_id: Option<Option<String>>,
    pub upstream_only_activation: Option<bool>,
    pub expire_mode: Option<ExpireMode>,
    pub expire_in_seconds: Option<Option<i64>>,
    pub expire_at: Option<Option<DateTime<Utc>>>,
    pub symbols: Option<Vec<StrategySymbol>>,
}

#[derive(Clone)]
pub struct StrategyStore {
    conn: Arc<Mutex<Connection>>,
}

fn ts_of(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn dt_of(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn opt_dt(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.map(dt_of)
}

impl StrategyStore {
    pub fn open(path: &Path) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> EngineResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- create / read ---------------------------------------------------

    /// Persist a new strategy. `idempotency_key` collisions return the
    /// previously accepted record unchanged.
    pub fn create(&self, s: &Strategy, now: DateTime<Utc>) -> EngineResult<Strategy> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(key) = &s.idempotency_key {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM strategies WHERE idempotency_key = ?1 AND deleted_at IS NULL",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                let out = load_strategy(&tx, &id)?
                    .ok_or_else(|| EngineError::NotFound(id.clone()))?;
                tx.commit()?;
                return Ok(out);
            }
        }

        let dup: Option<String> = tx
            .query_row(
                "SELECT id FROM strategies WHERE id = ?1",
                params![s.id],
                |row| row.get(0),
            )
            .optional()?;
        if dup.is_some() {
            return Err(EngineError::Validation(format!(
                "strategy id {} already exists",
                s.id
            )));
        }

        tx.execute(
            "INSERT INTO strategies
             (id, idempotency_key, market, trade_type, condition_logic, conditions_json,
              trade_action_json, next_strategy_id, upstream_only_activation,
              upstream_strategy_id, expire_mode, expire_in_seconds, expire_at,
              activated_at, logical_activated_at, status, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 1, ?17, ?17)",
            params![
                s.id,
                s.idempotency_key,
                s.market.as_str(),
                s.trade_type.as_str(),
                s.condition_logic.as_str(),
                serde_json::to_string(&s.conditions)?,
                s.trade_action
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                s.next_strategy_id,
                s.upstream_only_activation as i64,
                s.upstream_strategy_id,
                s.expire_mode.as_str(),
                s.expire_in_seconds,
                s.expire_at.map(ts_of),
                s.activated_at.map(ts_of),
                s.logical_activated_at.map(ts_of),
                StrategyStatus::PendingActivation.as_str(),
                ts_of(now),
            ],
        )?;
        replace_symbols(&tx, &s.id, &s.symbols)?;
        append_event_tx(
            &tx,
            &s.id,
            now,
            event_type::CREATED,
            json!({"trade_type": s.trade_type.as_str(), "market": s.market.as_str()}),
        )?;
        let out =
            load_strategy(&tx, &s.id)?.ok_or_else(|| EngineError::NotFound(s.id.clone()))?;
        tx.commit()?;
        info!(strategy_id = %out.id, "strategy created");
        Ok(out)
    }

    pub fn get(&self, id: &str) -> EngineResult<Strategy> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let s = load_strategy(&tx, id)?.ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        tx.commit()?;
        Ok(s)
    }

    pub fn list(&self, status: Option<StrategyStatus>) -> EngineResult<Vec<Strategy>> {
        let ids: Vec<String> = {
            let conn = self.conn.lock();
            match status {
                Some(st) => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT id FROM strategies WHERE status = ?1 AND deleted_at IS NULL
                         ORDER BY created_at",
                    )?;
                    let rows = stmt.query_map(params![st.as_str()], |row| row.get(0))?;
                    rows.collect::<Result<_, _>>()?
                }
                None => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT id FROM strategies WHERE deleted_at IS NULL ORDER BY created_at",
                    )?;
                    let rows = stmt.query_map([], |row| row.get(0))?;
                    rows.collect::<Result<_, _>>()?
                }
            }
        };
        ids.iter().map(|id| self.get(id)).collect()
    }

    /// ACTIVE strategies whose next scheduled evaluation is due.
    pub fn list_due_active(&self, now: DateTime<Utc>) -> EngineResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT s.id FROM strategies s
             LEFT JOIN strategy_runs r ON r.strategy_id = s.id
             WHERE s.status = 'ACTIVE' AND s.deleted_at IS NULL
               AND (r.suggested_next_monitor_at IS NULL OR r.suggested_next_monitor_at <= ?1)
             ORDER BY s.created_at",
        )?;
        let rows = stmt.query_map(params![ts_of(now)], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Non-terminal strategies whose expiry instant has passed.
    pub fn list_expired(&self, now: DateTime<Utc>) -> EngineResult<Vec<Strategy>> {
        let ids: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM strategies
                 WHERE expire_at IS NOT NULL AND expire_at <= ?1 AND deleted_at IS NULL
                   AND status NOT IN ('FILLED', 'EXPIRED', 'CANCELLED', 'FAILED')
                 ORDER BY expire_at",
            )?;
            let rows = stmt.query_map(params![ts_of(now)], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        ids.iter().map(|id| self.get(id)).collect()
    }

    /// `(id, next_strategy_id)` edges for the chain validator.
    pub fn chain_edges(&self) -> EngineResult<Vec<(String, Option<String>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, next_strategy_id FROM strategies WHERE deleted_at IS NULL",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ---- transitions -----------------------------------------------------

    /// The only path that changes `status`. Rejects non-admissible moves
    /// and stale versions; never leaves a partial mutation behind.
    pub fn transition(
        &self,
        id: &str,
        from: StrategyStatus,
        to: StrategyStatus,
        patch: StatusPatch,
        expected_version: Option<i64>,
        now: DateTime<Utc>,
    ) -> EngineResult<Strategy> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        transition_tx(&tx, id, from, to, &patch, expected_version, now)?;
        let out = load_strategy(&tx, id)?.ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        tx.commit()?;
        Ok(out)
    }

    // ---- edits -----------------------------------------------------------

    pub fn patch_basic(
        &self,
        id: &str,
        patch: BasicPatch,
        now: DateTime<Utc>,
    ) -> EngineResult<Strategy> {
        self.edit(id, now, "basic", move |tx, id| {
            if let Some(tt) = patch.trade_type {
                tx.execute(
                    "UPDATE strategies SET trade_type = ?2 WHERE id = ?1",
                    params![id, tt.as_str()],
                )?;
            }
            if let Some(logic) = patch.condition_logic {
                tx.execute(
                    "UPDATE strategies SET condition_logic = ?2 WHERE id = ?1",
                    params![id, logic.as_str()],
                )?;
            }
            if let Some(next) = &patch.next_strategy_id {
                tx.execute(
                    "UPDATE strategies SET next_strategy_id = ?2 WHERE id = ?1",
                    params![id, next],
                )?;
            }
            if let Some(flag) = patch.upstream_only_activation {
                tx.execute(
                    "UPDATE strategies SET upstream_only_activation = ?2 WHERE id = ?1",
                    params![id, flag as i64],
                )?;
            }
            if let Some(mode) = patch.expire_mode {
                tx.execute(
                    "UPDATE strategies SET expire_mode = ?2 WHERE id = ?1",
                    params![id, mode.as_str()],
                )?;
            }
            if let Some(secs) = &patch.expire_in_seconds {
                tx.execute(
                    "UPDATE strategies SET expire_in_seconds = ?2 WHERE id = ?1",
                    params![id, secs],
                )?;
            }
            if let Some(at) = patch.expire_at {
                tx.execute(
                    "UPDATE strategies SET expire_at = ?2 WHERE id = ?1",
                    params![id, at.map(ts_of)],
                )?;
            }
            if let Some(symbols) = &patch.symbols {
                replace_symbols(tx, id, symbols)?;
            }
            Ok(())
        })
    }

    pub fn put_conditions(
        &self,
        id: &str,
        conditions: &[Condition],
        now: DateTime<Utc>,
    ) -> EngineResult<Strategy> {
        let encoded = serde_json::to_string(conditions)?;
        self.edit(id, now, "conditions", move |tx, id| {
            tx.execute(
                "UPDATE strategies SET conditions_json = ?2 WHERE id = ?1",
                params![id, encoded],
            )?;
            // Stale read-model rows for removed conditions go with the edit.
            tx.execute(
                "DELETE FROM condition_states WHERE strategy_id = ?1",
                params![id],
            )?;
            Ok(())
        })
    }

    pub fn put_actions(
        &self,
        id: &str,
        action: Option<&TradeAction>,
        now: DateTime<Utc>,
    ) -> EngineResult<Strategy> {
        let encoded = action.map(serde_json::to_string).transpose()?;
        self.edit(id, now, "actions", move |tx, id| {
            tx.execute(
                "UPDATE strategies SET trade_action_json = ?2 WHERE id = ?1",
                params![id, encoded],
            )?;
            Ok(())
        })
    }

    /// Shared edit wrapper: only editable statuses, always resets to
    /// PENDING_ACTIVATION, bumps version, appends an event.
    fn edit(
        &self,
        id: &str,
        now: DateTime<Utc>,
        section: &str,
        apply: impl FnOnce(&Transaction<'_>, &str) -> EngineResult<()>,
    ) -> EngineResult<Strategy> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let status = current_status(&tx, id)?;
        if !status.is_editable() {
            return Err(EngineError::InvalidTransition {
                from: status,
                to: StrategyStatus::PendingActivation,
            });
        }
        apply(&tx, id)?;
        let patch = StatusPatch {
            event_type: Some(event_type::UPDATED),
            event_detail: Some(json!({ "section": section })),
            ..Default::default()
        };
        transition_tx(
            &tx,
            id,
            status,
            StrategyStatus::PendingActivation,
            &patch,
            None,
            now,
        )?;
        let out = load_strategy(&tx, id)?.ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        tx.commit()?;
        Ok(out)
    }

    pub fn soft_delete(&self, id: &str, now: DateTime<Utc>) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let n = tx.execute(
            "UPDATE strategies SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id, ts_of(now)],
        )?;
        if n == 0 {
            return Err(EngineError::NotFound(id.to_string()));
        }
        // Upstream->downstream is a named relation, not ownership.
        tx.execute(
            "UPDATE strategies SET next_strategy_id = NULL WHERE next_strategy_id = ?1",
            params![id],
        )?;
        append_event_tx(&tx, id, now, event_type::DELETED, json!({}))?;
        tx.commit()?;
        Ok(())
    }

    // ---- leases ----------------------------------------------------------

    /// Acquire the per-strategy execution lease for `ttl`.
    pub fn acquire_lease(
        &self,
        id: &str,
        owner: &str,
        ttl: ChronoDuration,
        now: DateTime<Utc>,
    ) -> EngineResult<DateTime<Utc>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let existing: Option<(String, i64)> = tx
            .query_row(
                "SELECT owner, lock_until FROM strategy_leases WHERE strategy_id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((holder, until)) = existing {
            if until > ts_of(now) && holder != owner {
                return Err(EngineError::StrategyLocked {
                    strategy_id: id.to_string(),
                    lock_until: dt_of(until),
                });
            }
        }
        let until = now + ttl;
        tx.execute(
            "INSERT INTO strategy_leases (strategy_id, owner, lock_until) VALUES (?1, ?2, ?3)
             ON CONFLICT(strategy_id) DO UPDATE SET owner = ?2, lock_until = ?3",
            params![id, owner, ts_of(until)],
        )?;
        tx.commit()?;
        Ok(until)
    }

    pub fn release_lease(&self, id: &str, owner: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM strategy_leases WHERE strategy_id = ?1 AND owner = ?2",
            params![id, owner],
        )?;
        Ok(())
    }

    /// User-facing operations call this first; a live lease means the
    /// worker owns the strategy right now.
    pub fn assert_unleased(&self, id: &str, now: DateTime<Utc>) -> EngineResult<()> {
        let conn = self.conn.lock();
        let until: Option<i64> = conn
            .query_row(
                "SELECT lock_until FROM strategy_leases WHERE strategy_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match until {
            Some(t) if t > ts_of(now) => Err(EngineError::StrategyLocked {
                strategy_id: id.to_string(),
                lock_until: dt_of(t),
            }),
            _ => Ok(()),
        }
    }

    pub fn clear_stale_leases(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM strategy_leases WHERE lock_until < ?1",
            params![ts_of(now)],
        )?;
        Ok(n)
    }

    // ---- runtime state ---------------------------------------------------

    pub fn set_runtime(
        &self,
        id: &str,
        key: &str,
        value: &Value,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO strategy_runtime (strategy_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(strategy_id, key) DO UPDATE SET value = ?3, updated_at = ?4",
            params![id, key, value.to_string(), ts_of(now)],
        )?;
        Ok(())
    }

    pub fn get_runtime(&self, id: &str, key: &str) -> EngineResult<Option<Value>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM strategy_runtime WHERE strategy_id = ?1 AND key = ?2",
                params![id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    pub fn set_runtime_f64(
        &self,
        id: &str,
        key: &str,
        value: f64,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.set_runtime(id, key, &json!(value), now)
    }

    pub fn get_runtime_f64(&self, id: &str, key: &str) -> EngineResult<Option<f64>> {
        Ok(self.get_runtime(id, key)?.and_then(|v| v.as_f64()))
    }

    pub fn clear_runtime(&self, id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM strategy_runtime WHERE strategy_id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // ---- condition read model --------------------------------------------

    pub fn upsert_condition_state(
        &self,
        id: &str,
        condition_id: &str,
        state: ConditionState,
        last_value: Option<f64>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO condition_states
             (strategy_id, condition_id, state, last_value, last_evaluated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(strategy_id, condition_id)
             DO UPDATE SET state = ?3, last_value = ?4, last_evaluated_at = ?5",
            params![id, condition_id, state.as_str(), last_value, ts_of(now)],
        )?;
        Ok(())
    }

    pub fn init_condition_states(&self, strategy: &Strategy) -> EngineResult<()> {
        let conn = self.conn.lock();
        for c in &strategy.conditions {
            conn.execute(
                "INSERT INTO condition_states (strategy_id, condition_id, state)
                 VALUES (?1, ?2, 'NOT_EVALUATED')
                 ON CONFLICT(strategy_id, condition_id) DO NOTHING",
                params![strategy.id, c.condition_id],
            )?;
        }
        Ok(())
    }

    pub fn condition_states(&self, id: &str) -> EngineResult<Vec<ConditionStateRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT strategy_id, condition_id, state, last_value, last_evaluated_at
             FROM condition_states WHERE strategy_id = ?1 ORDER BY condition_id",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(ConditionStateRow {
                strategy_id: row.get(0)?,
                condition_id: row.get(1)?,
                state: row.get(2)?,
                last_value: row.get(3)?,
                last_evaluated_at: row.get::<_, Option<i64>>(4)?.map(dt_of),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ---- events ----------------------------------------------------------

    pub fn append_event(
        &self,
        id: &str,
        kind: &str,
        detail: Value,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        append_event_tx(&tx, id, now, kind, detail)?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_events(&self, id: &str, limit: usize) -> EngineResult<Vec<StrategyEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy_id, ts, event_type, detail_json FROM strategy_events
             WHERE strategy_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![id, limit as i64], row_to_event)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn recent_events(&self, limit: usize) -> EngineResult<Vec<StrategyEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy_id, ts, event_type, detail_json FROM strategy_events
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_event)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ---- orders & instructions -------------------------------------------

    /// C8's atomic entry: move TRIGGERED -> ORDER_SUBMITTED and insert the
    /// Order plus TradeInstruction rows in one transaction. The UNIQUE
    /// constraint on `orders.strategy_id` backs the at-most-once guarantee.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_order_submitted(
        &self,
        strategy_id: &str,
        trade_id: &str,
        qty: f64,
        payload: &Value,
        summary: &str,
        expire_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> EngineResult<Strategy> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let patch = StatusPatch {
            event_type: Some(event_type::ORDER_SUBMITTED),
            event_detail: Some(json!({ "trade_id": trade_id })),
            ..Default::default()
        };
        transition_tx(
            &tx,
            strategy_id,
            StrategyStatus::Triggered,
            StrategyStatus::OrderSubmitted,
            &patch,
            None,
            now,
        )?;
        tx.execute(
            "INSERT INTO orders
             (trade_id, strategy_id, status, qty, filled_qty, order_payload_json,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6)",
            params![
                trade_id,
                strategy_id,
                OrderStatus::PendingSubmit.as_str(),
                qty,
                payload.to_string(),
                ts_of(now),
            ],
        )?;
        tx.execute(
            "INSERT INTO trade_instructions
             (trade_id, strategy_id, instruction_summary, status, expire_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                trade_id,
                strategy_id,
                summary,
                OrderStatus::PendingSubmit.as_str(),
                expire_at.map(ts_of),
                ts_of(now),
            ],
        )?;
        append_trade_log_tx(&tx, trade_id, strategy_id, now, "submission", summary)?;
        let out = load_strategy(&tx, strategy_id)?
            .ok_or_else(|| EngineError::NotFound(strategy_id.to_string()))?;
        tx.commit()?;
        Ok(out)
    }

    pub fn update_order(
        &self,
        trade_id: &str,
        ib_order_id: Option<&str>,
        status: OrderStatus,
        filled_qty: f64,
        avg_fill_price: Option<f64>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if let Some(ib) = ib_order_id {
            tx.execute(
                "UPDATE orders SET ib_order_id = ?2, status = ?3, filled_qty = ?4,
                        avg_fill_price = ?5, updated_at = ?6
                 WHERE trade_id = ?1",
                params![
                    trade_id,
                    ib,
                    status.as_str(),
                    filled_qty,
                    avg_fill_price,
                    ts_of(now)
                ],
            )?;
        } else {
            tx.execute(
                "UPDATE orders SET status = ?2, filled_qty = ?3, avg_fill_price = ?4,
                        updated_at = ?5
                 WHERE trade_id = ?1",
                params![
                    trade_id,
                    status.as_str(),
                    filled_qty,
                    avg_fill_price,
                    ts_of(now)
                ],
            )?;
        }
        tx.execute(
            "UPDATE trade_instructions SET status = ?2, updated_at = ?3 WHERE trade_id = ?1",
            params![trade_id, status.as_str(), ts_of(now)],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn order_for_strategy(&self, strategy_id: &str) -> EngineResult<Option<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT trade_id, strategy_id, ib_order_id, status, qty, filled_qty,
                    avg_fill_price, order_payload_json, created_at, updated_at
             FROM orders WHERE strategy_id = ?1",
        )?;
        let order = stmt
            .query_row(params![strategy_id], row_to_order)
            .optional()?;
        Ok(order)
    }

    pub fn get_order(&self, trade_id: &str) -> EngineResult<Option<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT trade_id, strategy_id, ib_order_id, status, qty, filled_qty,
                    avg_fill_price, order_payload_json, created_at, updated_at
             FROM orders WHERE trade_id = ?1",
        )?;
        Ok(stmt.query_row(params![trade_id], row_to_order).optional()?)
    }

    pub fn order_by_ib_id(&self, ib_order_id: &str) -> EngineResult<Option<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT trade_id, strategy_id, ib_order_id, status, qty, filled_qty,
                    avg_fill_price, order_payload_json, created_at, updated_at
             FROM orders WHERE ib_order_id = ?1",
        )?;
        Ok(stmt
            .query_row(params![ib_order_id], row_to_order)
            .optional()?)
    }

    pub fn active_instructions(&self) -> EngineResult<Vec<TradeInstruction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT trade_id, strategy_id, instruction_summary, status, expire_at, updated_at
             FROM trade_instructions
             WHERE status NOT IN ('FILLED', 'CANCELLED', 'REJECTED')
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TradeInstruction {
                trade_id: row.get(0)?,
                strategy_id: row.get(1)?,
                instruction_summary: row.get(2)?,
                status: row.get(3)?,
                expire_at: row.get::<_, Option<i64>>(4)?.map(dt_of),
                updated_at: dt_of(row.get(5)?),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ---- verification & trade log ----------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn record_verification(
        &self,
        trade_id: &str,
        strategy_id: &str,
        rule_id: &str,
        rule_version: i64,
        passed: bool,
        reason: &str,
        snapshot: &Value,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO verification_events
             (trade_id, strategy_id, rule_id, rule_version, passed, reason, snapshot_json, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                trade_id,
                strategy_id,
                rule_id,
                rule_version,
                passed as i64,
                reason,
                snapshot.to_string(),
                ts_of(now),
            ],
        )?;
        append_trade_log_tx(
            &tx,
            trade_id,
            strategy_id,
            now,
            "verification",
            &format!(
                "{} {}: {}",
                rule_id,
                if passed { "passed" } else { "failed" },
                reason
            ),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn verification_events(&self, trade_id: &str) -> EngineResult<Vec<VerificationEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, trade_id, strategy_id, rule_id, rule_version, passed, reason,
                    snapshot_json, ts
             FROM verification_events WHERE trade_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![trade_id], |row| {
            Ok(VerificationEvent {
                id: row.get(0)?,
                trade_id: row.get(1)?,
                strategy_id: row.get(2)?,
                rule_id: row.get(3)?,
                rule_version: row.get(4)?,
                passed: row.get::<_, i64>(5)? != 0,
                reason: row.get(6)?,
                snapshot: serde_json::from_str(&row.get::<_, String>(7)?).unwrap_or(Value::Null),
                ts: dt_of(row.get(8)?),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn append_trade_log(
        &self,
        trade_id: &str,
        strategy_id: &str,
        stage: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        append_trade_log_tx(&tx, trade_id, strategy_id, now, stage, message)?;
        tx.commit()?;
        Ok(())
    }

    pub fn trade_logs(&self, trade_id: &str) -> EngineResult<Vec<TradeLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, trade_id, strategy_id, ts, stage, message FROM trade_logs
             WHERE trade_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![trade_id], |row| {
            Ok(TradeLogEntry {
                id: row.get(0)?,
                trade_id: row.get(1)?,
                strategy_id: row.get(2)?,
                ts: dt_of(row.get(3)?),
                stage: row.get(4)?,
                message: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ---- chain activations -----------------------------------------------

    /// Returns false when `(trigger_event_id, to)` was already recorded,
    /// which is exactly the at-most-once guard for chain activation.
    #[allow(clippy::too_many_arguments)]
    pub fn try_record_activation(
        &self,
        from_id: &str,
        to_id: &str,
        trigger_event_id: &str,
        effective_activated_at: DateTime<Utc>,
        market_snapshot: &Value,
        context: &Value,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "INSERT OR IGNORE INTO strategy_activations
             (from_strategy_id, to_strategy_id, trigger_event_id, effective_activated_at,
              market_snapshot_json, context_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                from_id,
                to_id,
                trigger_event_id,
                ts_of(effective_activated_at),
                market_snapshot.to_string(),
                context.to_string(),
                ts_of(now),
            ],
        )?;
        Ok(n == 1)
    }

    pub fn activation_count(&self, to_id: &str) -> EngineResult<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM strategy_activations WHERE to_strategy_id = ?1",
            params![to_id],
            |row| row.get(0),
        )?)
    }

    // ---- run bookkeeping -------------------------------------------------

    pub fn upsert_run(
        &self,
        strategy_id: &str,
        evaluated_at: DateTime<Utc>,
        suggested_next_monitor_at: DateTime<Utc>,
        condition_met: bool,
        decision_reason: &str,
        last_data_end: &Value,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO strategy_runs
             (strategy_id, first_evaluated_at, evaluated_at, suggested_next_monitor_at,
              condition_met, decision_reason, last_data_end_json, run_count)
             VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, 1)
             ON CONFLICT(strategy_id) DO UPDATE SET
                evaluated_at = ?2,
                suggested_next_monitor_at = ?3,
                condition_met = ?4,
                decision_reason = ?5,
                last_data_end_json = ?6,
                run_count = run_count + 1",
            params![
                strategy_id,
                ts_of(evaluated_at),
                ts_of(suggested_next_monitor_at),
                condition_met as i64,
                decision_reason,
                last_data_end.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, strategy_id: &str) -> EngineResult<Option<StrategyRun>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT strategy_id, first_evaluated_at, evaluated_at, suggested_next_monitor_at,
                    condition_met, decision_reason, last_data_end_json, run_count
             FROM strategy_runs WHERE strategy_id = ?1",
        )?;
        let run = stmt
            .query_row(params![strategy_id], |row| {
                Ok(StrategyRun {
                    strategy_id: row.get(0)?,
                    first_evaluated_at: dt_of(row.get(1)?),
                    evaluated_at: dt_of(row.get(2)?),
                    suggested_next_monitor_at: dt_of(row.get(3)?),
                    condition_met: row.get::<_, i64>(4)? != 0,
                    decision_reason: row.get(5)?,
                    last_data_end: serde_json::from_str(&row.get::<_, String>(6)?)
                        .unwrap_or(Value::Null),
                    run_count: row.get(7)?,
                })
            })
            .optional()?;
        Ok(run)
    }
}

// ---- transaction-scoped helpers ------------------------------------------

fn current_status(tx: &Transaction<'_>, id: &str) -> EngineResult<StrategyStatus> {
    let raw: Option<String> = tx
        .query_row(
            "SELECT status FROM strategies WHERE id = ?1 AND deleted_at IS NULL",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let raw = raw.ok_or_else(|| EngineError::NotFound(id.to_string()))?;
    StrategyStatus::parse(&raw)
        .ok_or_else(|| EngineError::Integrity(format!("unknown status {raw} on {id}")))
}

fn transition_tx(
    tx: &Transaction<'_>,
    id: &str,
    from: StrategyStatus,
    to: StrategyStatus,
    patch: &StatusPatch,
    expected_version: Option<i64>,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let (actual_raw, version): (String, i64) = tx
        .query_row(
            "SELECT status, version FROM strategies WHERE id = ?1 AND deleted_at IS NULL",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
    let actual = StrategyStatus::parse(&actual_raw)
        .ok_or_else(|| EngineError::Integrity(format!("unknown status {actual_raw} on {id}")))?;

    if actual != from {
        return Err(EngineError::InvalidTransition { from: actual, to });
    }
    if !StrategyStatus::admissible(from, to) {
        return Err(EngineError::InvalidTransition { from, to });
    }
    if let Some(expected) = expected_version {
        if expected != version {
            return Err(EngineError::VersionConflict {
                strategy_id: id.to_string(),
                expected,
                found: version,
            });
        }
    }

    tx.execute(
        "UPDATE strategies SET status = ?2, version = version + 1, updated_at = ?3 WHERE id = ?1",
        params![id, to.as_str(), ts_of(now)],
    )?;
    if let Some(at) = patch.activated_at {
        tx.execute(
            "UPDATE strategies SET activated_at = ?2 WHERE id = ?1",
            params![id, ts_of(at)],
        )?;
    }
    if let Some(at) = patch.logical_activated_at {
        tx.execute(
            "UPDATE strategies SET logical_activated_at = ?2 WHERE id = ?1",
            params![id, ts_of(at)],
        )?;
    }
    if let Some(at) = patch.expire_at {
        tx.execute(
            "UPDATE strategies SET expire_at = ?2 WHERE id = ?1",
            params![id, ts_of(at)],
        )?;
    }
    if let Some(upstream) = &patch.upstream_strategy_id {
        tx.execute(
            "UPDATE strategies SET upstream_strategy_id = ?2 WHERE id = ?1",
            params![id, upstream],
        )?;
    }

    let kind = patch.event_type.unwrap_or(event_type::STATUS_CHANGED);
    let mut detail = patch.event_detail.clone().unwrap_or_else(|| json!({}));
    if let Value::Object(map) = &mut detail {
        map.insert("from".to_string(), json!(from.as_str()));
        map.insert("to".to_string(), json!(to.as_str()));
    }
    append_event_tx(tx, id, now, kind, detail)?;
    Ok(())
}

fn append_event_tx(
    tx: &Transaction<'_>,
    id: &str,
    now: DateTime<Utc>,
    kind: &str,
    detail: Value,
) -> EngineResult<()> {
    tx.execute(
        "INSERT INTO strategy_events (strategy_id, ts, event_type, detail_json)
         VALUES (?1, ?2, ?3, ?4)",
        params![id, ts_of(now), kind, detail.to_string()],
    )?;
    Ok(())
}

fn append_trade_log_tx(
    tx: &Transaction<'_>,
    trade_id: &str,
    strategy_id: &str,
    now: DateTime<Utc>,
    stage: &str,
    message: &str,
) -> EngineResult<()> {
    tx.execute(
        "INSERT INTO trade_logs (trade_id, strategy_id, ts, stage, message)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![trade_id, strategy_id, ts_of(now), stage, message],
    )?;
    Ok(())
}

fn replace_symbols(
    tx: &Transaction<'_>,
    id: &str,
    symbols: &[StrategySymbol],
) -> EngineResult<()> {
    tx.execute(
        "DELETE FROM strategy_symbols WHERE strategy_id = ?1",
        params![id],
    )?;
    for sym in symbols {
        tx.execute(
            "INSERT INTO strategy_symbols (strategy_id, position, symbol, trade_type)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, sym.position, sym.symbol, sym.trade_type.as_str()],
        )?;
    }
    Ok(())
}

fn load_strategy(tx: &Transaction<'_>, id: &str) -> EngineResult<Option<Strategy>> {
    let row = tx
        .query_row(
            "SELECT id, idempotency_key, market, trade_type, condition_logic, conditions_json,
                    trade_action_json, next_strategy_id, upstream_only_activation,
                    upstream_strategy_id, expire_mode, expire_in_seconds, expire_at,
                    activated_at, logical_activated_at, status, version, created_at, updated_at
             FROM strategies WHERE id = ?1 AND deleted_at IS NULL",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, Option<i64>>(11)?,
                    row.get::<_, Option<i64>>(12)?,
                    row.get::<_, Option<i64>>(13)?,
                    row.get::<_, Option<i64>>(14)?,
                    row.get::<_, String>(15)?,
                    row.get::<_, i64>(16)?,
                    row.get::<_, i64>(17)?,
                    row.get::<_, i64>(18)?,
                ))
            },
        )
        .optional()?;

    let Some((
        id,
        idempotency_key,
        market,
        trade_type,
        condition_logic,
        conditions_json,
        trade_action_json,
        next_strategy_id,
        upstream_only,
        upstream_strategy_id,
        expire_mode,
        expire_in_seconds,
        expire_at,
        activated_at,
        logical_activated_at,
        status,
        version,
        created_at,
        updated_at,
    )) = row
    else {
        return Ok(None);
    };

    let mut stmt = tx.prepare_cached(
        "SELECT position, symbol, trade_type FROM strategy_symbols
         WHERE strategy_id = ?1 ORDER BY position",
    )?;
    let symbols: Vec<StrategySymbol> = stmt
        .query_map(params![id], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(position, symbol, tt)| {
            Ok(StrategySymbol {
                position,
                symbol,
                trade_type: SymbolTradeType::parse(&tt)
                    .ok_or_else(|| EngineError::Integrity(format!("bad symbol trade_type {tt}")))?,
            })
        })
        .collect::<EngineResult<_>>()?;

    let strategy = Strategy {
        idempotency_key,
        market: Market::parse(&market)
            .ok_or_else(|| EngineError::Integrity(format!("bad market {market}")))?,
        trade_type: TradeType::parse(&trade_type)
            .ok_or_else(|| EngineError::Integrity(format!("bad trade_type {trade_type}")))?,
        condition_logic: ConditionLogic::parse(&condition_logic)
            .ok_or_else(|| EngineError::Integrity(format!("bad logic {condition_logic}")))?,
        conditions: serde_json::from_str(&conditions_json)?,
        trade_action: trade_action_json
            .map(|raw| serde_json::from_str::<TradeAction>(&raw))
            .transpose()?,
        symbols,
        next_strategy_id,
        upstream_only_activation: upstream_only != 0,
        upstream_strategy_id,
        expire_mode: ExpireMode::parse(&expire_mode)
            .ok_or_else(|| EngineError::Integrity(format!("bad expire_mode {expire_mode}")))?,
        expire_in_seconds,
        expire_at: opt_dt(expire_at),
        activated_at: opt_dt(activated_at),
        logical_activated_at: opt_dt(logical_activated_at),
        status: StrategyStatus::parse(&status)
            .ok_or_else(|| EngineError::Integrity(format!("bad status {status}")))?,
        version,
        created_at: dt_of(created_at),
        updated_at: dt_of(updated_at),
        id,
    };
    Ok(Some(strategy))
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<StrategyEvent> {
    Ok(StrategyEvent {
        id: row.get(0)?,
        strategy_id: row.get(1)?,
        ts: dt_of(row.get(2)?),
        event_type: row.get(3)?,
        detail: serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or(Value::Null),
    })
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        trade_id: row.get(0)?,
        strategy_id: row.get(1)?,
        ib_order_id: row.get(2)?,
        status: OrderStatus::parse(&row.get::<_, String>(3)?).unwrap_or(OrderStatus::PendingSubmit),
        qty: row.get(4)?,
        filled_qty: row.get(5)?,
        avg_fill_price: row.get(6)?,
        payload: serde_json::from_str(&row.get::<_, String>(7)?).unwrap_or(Value::Null),
        created_at: dt_of(row.get(8)?),
        updated_at: dt_of(row.get(9)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CompareOp, ConditionType, EvaluationWindow, Metric, OrderSide, OrderType, PriceBasis,
        TriggerMode,
    };

    fn sample_condition() -> Condition {
        Condition {
            condition_id: "c-1".into(),
            condition_type: ConditionType::SingleProduct,
            metric: Metric::Price,
            trigger_mode: TriggerMode::LevelInstant,
            evaluation_window: EvaluationWindow::M1,
            window_price_basis: PriceBasis::Close,
            operator: CompareOp::Le,
            value: 60.0,
            product: "SLV".into(),
            product_b: None,
        }
    }

    fn sample_strategy(id: &str) -> Strategy {
        let now = Utc::now();
        Strategy {
            id: id.into(),
            idempotency_key: None,
            market: Market::UsStock,
            trade_type: TradeType::Buy,
            condition_logic: ConditionLogic::And,
            conditions: vec![sample_condition()],
            trade_action: Some(TradeAction::StockTrade {
                symbol: "SLV".into(),
                side: OrderSide::Buy,
                quantity: 100.0,
                order_type: OrderType::Mkt,
                limit_price: None,
                allow_overnight: false,
                cancel_on_expiry: false,
            }),
            symbols: vec![StrategySymbol {
                position: 0,
                symbol: "SLV".into(),
                trade_type: SymbolTradeType::Buy,
            }],
            next_strategy_id: None,
            upstream_only_activation: false,
            upstream_strategy_id: None,
            expire_mode: ExpireMode::Relative,
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
    fn create_and_get_round_trip() {
        let store = StrategyStore::open_in_memory().unwrap();
        let now = Utc::now();
        let created = store.create(&sample_strategy("s-1"), now).unwrap();
        assert_eq!(created.status, StrategyStatus::PendingActivation);
        assert_eq!(created.version, 1);

        let got = store.get("s-1").unwrap();
        assert_eq!(got.conditions.len(), 1);
        assert_eq!(got.symbols.len(), 1);
        // Case-insensitive identity.
        assert!(store.get("S-1").is_ok());
    }

    #[test]
    fn idempotency_key_collision_returns_existing() {
        let store = StrategyStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut a = sample_strategy("s-1");
        a.idempotency_key = Some("key-1".into());
        let mut b = sample_strategy("s-2");
        b.idempotency_key = Some("key-1".into());

        let first = store.create(&a, now).unwrap();
        let second = store.create(&b, now).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list(None).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_id_rejected() {
        let store = StrategyStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.create(&sample_strategy("s-1"), now).unwrap();
        let err = store.create(&sample_strategy("S-1"), now).unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn transition_gates_and_bumps_version() {
        let store = StrategyStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.create(&sample_strategy("s-1"), now).unwrap();

        let s = store
            .transition(
                "s-1",
                StrategyStatus::PendingActivation,
                StrategyStatus::Verifying,
                StatusPatch::default(),
                None,
                now,
            )
            .unwrap();
        assert_eq!(s.status, StrategyStatus::Verifying);
        assert_eq!(s.version, 2);

        // Wrong `from` is a typed rejection, no partial mutation.
        let err = store
            .transition(
                "s-1",
                StrategyStatus::PendingActivation,
                StrategyStatus::Verifying,
                StatusPatch::default(),
                None,
                now,
            )
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(store.get("s-1").unwrap().version, 2);

        // Non-admissible move rejected even with correct `from`.
        let err = store
            .transition(
                "s-1",
                StrategyStatus::Verifying,
                StrategyStatus::Triggered,
                StatusPatch::default(),
                None,
                now,
            )
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[test]
    fn transition_respects_expected_version() {
        let store = StrategyStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.create(&sample_strategy("s-1"), now).unwrap();
        let err = store
            .transition(
                "s-1",
                StrategyStatus::PendingActivation,
                StrategyStatus::Verifying,
                StatusPatch::default(),
                Some(99),
                now,
            )
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn edits_reset_status_and_bump_version() {
        let store = StrategyStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.create(&sample_strategy("s-1"), now).unwrap();
        // Walk to PAUSED: pending -> verifying -> active -> paused.
        for (from, to) in [
            (StrategyStatus::PendingActivation, StrategyStatus::Verifying),
            (StrategyStatus::Verifying, StrategyStatus::Active),
            (StrategyStatus::Active, StrategyStatus::Paused),
        ] {
            store
                .transition("s-1", from, to, StatusPatch::default(), None, now)
                .unwrap();
        }

        let before = store.get("s-1").unwrap().version;
        let s = store
            .put_conditions("s-1", &[sample_condition()], now)
            .unwrap();
        assert_eq!(s.status, StrategyStatus::PendingActivation);
        assert_eq!(s.version, before + 1);

        // Editing a triggered strategy is rejected.
        for (from, to) in [
            (StrategyStatus::PendingActivation, StrategyStatus::Verifying),
            (StrategyStatus::Verifying, StrategyStatus::Active),
            (StrategyStatus::Active, StrategyStatus::Triggered),
        ] {
            store
                .transition("s-1", from, to, StatusPatch::default(), None, now)
                .unwrap();
        }
        let err = store.put_actions("s-1", None, now).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[test]
    fn lease_excludes_other_owners_until_expiry() {
        let store = StrategyStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.create(&sample_strategy("s-1"), now).unwrap();

        store
            .acquire_lease("s-1", "worker-1", ChronoDuration::seconds(30), now)
            .unwrap();
        let err = store
            .acquire_lease("s-1", "worker-2", ChronoDuration::seconds(30), now)
            .unwrap_err();
        assert_eq!(err.code(), "STRATEGY_LOCKED");
        assert!(store.assert_unleased("s-1", now).is_err());

        // Expired lease is reclaimable.
        let later = now + ChronoDuration::seconds(31);
        assert!(store.assert_unleased("s-1", later).is_ok());
        store
            .acquire_lease("s-1", "worker-2", ChronoDuration::seconds(30), later)
            .unwrap();

        store.release_lease("s-1", "worker-2").unwrap();
        assert!(store.assert_unleased("s-1", later).is_ok());
    }

    #[test]
    fn activation_rows_are_at_most_once() {
        let store = StrategyStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.create(&sample_strategy("up"), now).unwrap();
        store.create(&sample_strategy("down"), now).unwrap();

        let snap = json!({"price": 100.0});
        let ctx = json!({});
        assert!(store
            .try_record_activation("up", "down", "evt-1", now, &snap, &ctx, now)
            .unwrap());
        assert!(!store
            .try_record_activation("up", "down", "evt-1", now, &snap, &ctx, now)
            .unwrap());
        assert_eq!(store.activation_count("down").unwrap(), 1);
    }

    #[test]
    fn one_order_per_strategy_lifetime() {
        let store = StrategyStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.create(&sample_strategy("s-1"), now).unwrap();
        for (from, to) in [
            (StrategyStatus::PendingActivation, StrategyStatus::Verifying),
            (StrategyStatus::Verifying, StrategyStatus::Active),
            (StrategyStatus::Active, StrategyStatus::Triggered),
        ] {
            store
                .transition("s-1", from, to, StatusPatch::default(), None, now)
                .unwrap();
        }

        store
            .mark_order_submitted("s-1", "t-1", 100.0, &json!({}), "BUY 100 SLV MKT", None, now)
            .unwrap();
        // Strategy left TRIGGERED, so a second submission cannot pass the
        // transition gate.
        let err = store
            .mark_order_submitted("s-1", "t-2", 100.0, &json!({}), "BUY 100 SLV MKT", None, now)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        let order = store.order_for_strategy("s-1").unwrap().unwrap();
        assert_eq!(order.trade_id, "t-1");
    }

    #[test]
    fn run_rows_upsert_and_count() {
        let store = StrategyStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.create(&sample_strategy("s-1"), now).unwrap();
        store
            .upsert_run("s-1", now, now + ChronoDuration::seconds(60), false, "no", &json!({}))
            .unwrap();
        store
            .upsert_run("s-1", now, now + ChronoDuration::seconds(60), true, "yes", &json!({}))
            .unwrap();
        let run = store.get_run("s-1").unwrap().unwrap();
        assert_eq!(run.run_count, 2);
        assert!(run.condition_met);
        assert_eq!(run.first_evaluated_at.timestamp(), now.timestamp());
    }

    #[test]
    fn soft_delete_hides_and_unlinks() {
        let store = StrategyStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.create(&sample_strategy("down"), now).unwrap();
        let mut up = sample_strategy("up");
        up.next_strategy_id = Some("down".into());
        store.create(&up, now).unwrap();

        store.soft_delete("down", now).unwrap();
        assert!(matches!(
            store.get("down").unwrap_err(),
            EngineError::NotFound(_)
        ));
        assert_eq!(store.get("up").unwrap().next_strategy_id, None);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let now = Utc::now();
        {
            let store = StrategyStore::open(&path).unwrap();
            store.create(&sample_strategy("s-1"), now).unwrap();
            store
                .transition(
                    "s-1",
                    StrategyStatus::PendingActivation,
                    StrategyStatus::Verifying,
                    StatusPatch::default(),
                    None,
                    now,
                )
                .unwrap();
        }
        let store = StrategyStore::open(&path).unwrap();
        let s = store.get("s-1").unwrap();
        assert_eq!(s.status, StrategyStatus::Verifying);
        assert_eq!(s.version, 2);
        assert_eq!(store.list_events("s-1", 10).unwrap().len(), 2);
    }

    #[test]
    fn events_preserve_insertion_order() {
        let store = StrategyStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.create(&sample_strategy("s-1"), now).unwrap();
        store
            .append_event("s-1", "a", json!({}), now)
            .unwrap();
        store
            .append_event("s-1", "b", json!({}), now)
            .unwrap();
        let events = store.list_events("s-1", 10).unwrap();
        // Newest first; created event is the oldest.
        assert_eq!(events[0].event_type, "b");
        assert_eq!(events[1].event_type, "a");
        assert_eq!(events.last().unwrap().event_type, "created");
    }
}
