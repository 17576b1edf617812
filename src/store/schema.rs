//! Engine store schema
//!
//! One strategy row owns its symbols, runtime keys, events, order,
//! instruction, verification events, trade logs, activations, and run
//! bookkeeping (cascade on delete). `next_strategy_id` is a named
//! relation, not ownership: deleting the upstream nulls it.

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS strategies (
    id TEXT PRIMARY KEY COLLATE NOCASE,
    idempotency_key TEXT UNIQUE,
    market TEXT NOT NULL,
    trade_type TEXT NOT NULL,
    condition_logic TEXT NOT NULL,
    conditions_json TEXT NOT NULL CHECK (json_valid(conditions_json)),
    trade_action_json TEXT CHECK (trade_action_json IS NULL OR json_valid(trade_action_json)),
    next_strategy_id TEXT COLLATE NOCASE REFERENCES strategies(id) ON DELETE SET NULL,
    upstream_only_activation INTEGER NOT NULL DEFAULT 0,
    upstream_strategy_id TEXT,
    expire_mode TEXT NOT NULL,
    expire_in_seconds INTEGER,
    expire_at INTEGER,
    activated_at INTEGER,
    logical_activated_at INTEGER,
    status TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_strategies_status
    ON strategies(status) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_strategies_expire
    ON strategies(expire_at) WHERE expire_at IS NOT NULL AND deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS strategy_symbols (
    strategy_id TEXT NOT NULL COLLATE NOCASE REFERENCES strategies(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    trade_type TEXT NOT NULL,
    PRIMARY KEY (strategy_id, position)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS condition_states (
    strategy_id TEXT NOT NULL COLLATE NOCASE REFERENCES strategies(id) ON DELETE CASCADE,
    condition_id TEXT NOT NULL,
    state TEXT NOT NULL,
    last_value REAL,
    last_evaluated_at INTEGER,
    PRIMARY KEY (strategy_id, condition_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS strategy_runtime (
    strategy_id TEXT NOT NULL COLLATE NOCASE REFERENCES strategies(id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    value TEXT NOT NULL CHECK (json_valid(value)),
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (strategy_id, key)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS strategy_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_id TEXT NOT NULL COLLATE NOCASE REFERENCES strategies(id) ON DELETE CASCADE,
    ts INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    detail_json TEXT NOT NULL CHECK (json_valid(detail_json))
);

CREATE INDEX IF NOT EXISTS idx_strategy_events_strategy
    ON strategy_events(strategy_id, id);

CREATE TABLE IF NOT EXISTS orders (
    trade_id TEXT PRIMARY KEY,
    strategy_id TEXT NOT NULL COLLATE NOCASE UNIQUE REFERENCES strategies(id) ON DELETE CASCADE,
    ib_order_id TEXT,
    status TEXT NOT NULL,
    qty REAL NOT NULL,
    filled_qty REAL NOT NULL DEFAULT 0,
    avg_fill_price REAL,
    order_payload_json TEXT NOT NULL CHECK (json_valid(order_payload_json)),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_ib ON orders(ib_order_id);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);

CREATE TABLE IF NOT EXISTS trade_instructions (
    trade_id TEXT PRIMARY KEY,
    strategy_id TEXT NOT NULL COLLATE NOCASE REFERENCES strategies(id) ON DELETE CASCADE,
    instruction_summary TEXT NOT NULL,
    status TEXT NOT NULL,
    expire_at INTEGER,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS verification_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id TEXT NOT NULL,
    strategy_id TEXT NOT NULL COLLATE NOCASE REFERENCES strategies(id) ON DELETE CASCADE,
    rule_id TEXT NOT NULL,
    rule_version INTEGER NOT NULL,
    passed INTEGER NOT NULL,
    reason TEXT NOT NULL,
    snapshot_json TEXT NOT NULL CHECK (json_valid(snapshot_json)),
    ts INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_verification_trade
    ON verification_events(trade_id, id);

CREATE TABLE IF NOT EXISTS trade_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id TEXT NOT NULL,
    strategy_id TEXT NOT NULL COLLATE NOCASE REFERENCES strategies(id) ON DELETE CASCADE,
    ts INTEGER NOT NULL,
    stage TEXT NOT NULL,
    message TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trade_logs_trade ON trade_logs(trade_id, id);

CREATE TABLE IF NOT EXISTS strategy_activations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_strategy_id TEXT NOT NULL,
    to_strategy_id TEXT NOT NULL COLLATE NOCASE REFERENCES strategies(id) ON DELETE CASCADE,
    trigger_event_id TEXT NOT NULL,
    effective_activated_at INTEGER NOT NULL,
    market_snapshot_json TEXT NOT NULL CHECK (json_valid(market_snapshot_json)),
    context_json TEXT NOT NULL CHECK (json_valid(context_json)),
    created_at INTEGER NOT NULL,
    UNIQUE (trigger_event_id, to_strategy_id)
);

CREATE TABLE IF NOT EXISTS strategy_runs (
    strategy_id TEXT PRIMARY KEY COLLATE NOCASE REFERENCES strategies(id) ON DELETE CASCADE,
    first_evaluated_at INTEGER NOT NULL,
    evaluated_at INTEGER NOT NULL,
    suggested_next_monitor_at INTEGER NOT NULL,
    condition_met INTEGER NOT NULL,
    decision_reason TEXT NOT NULL,
    last_data_end_json TEXT NOT NULL CHECK (json_valid(last_data_end_json)),
    run_count INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS strategy_leases (
    strategy_id TEXT PRIMARY KEY COLLATE NOCASE REFERENCES strategies(id) ON DELETE CASCADE,
    owner TEXT NOT NULL,
    lock_until INTEGER NOT NULL
) WITHOUT ROWID;
"#;
