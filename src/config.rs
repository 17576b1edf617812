//! Configuration surface
//!
//! Precedence: environment variables > config file > built-in defaults.
//! The condition-rules file is separate and loaded into an immutable
//! snapshot; running evaluations pin the snapshot they started with.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::marketdata::BarSize;
use crate::models::{CompareOp, EvaluationWindow, Metric, TriggerMode};

pub const MONITOR_INTERVAL_MIN: u64 = 20;
pub const MONITOR_INTERVAL_MAX: u64 = 300;
pub const MAX_EXPIRE_IN_SECONDS: i64 = 604_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    Paper,
    Live,
}

impl TradingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paper" => Some(TradingMode::Paper),
            "live" => Some(TradingMode::Live),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IbGatewayConfig {
    pub host: String,
    pub paper_port: u16,
    pub live_port: u16,
    pub client_id: u32,
    pub timeout_seconds: u64,
    pub trading_mode: TradingMode,
    /// Live trading refuses to start unless this is explicitly set.
    pub allow_live: bool,
}

impl Default for IbGatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            paper_port: 7497,
            live_port: 7496,
            client_id: 1,
            timeout_seconds: 10,
            trading_mode: TradingMode::Paper,
            allow_live: false,
        }
    }
}

impl IbGatewayConfig {
    pub fn port(&self) -> u16 {
        match self.trading_mode {
            TradingMode::Paper => self.paper_port,
            TradingMode::Live => self.live_port,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub data_dir: String,
    pub db_path: String,
    pub log_path: String,
    pub market_data_log_path: String,
    pub market_cache_db_path: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            db_path: "./data/tradewatch.db".to_string(),
            log_path: "./data/tradewatch.log".to_string(),
            market_data_log_path: "./data/market_data.log".to_string(),
            market_cache_db_path: "./data/market_cache.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub monitor_interval_seconds: u64,
    pub configured_threads: usize,
    pub queue_maxsize: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            monitor_interval_seconds: 60,
            configured_threads: 4,
            queue_maxsize: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub max_notional_usd: f64,
    pub allowed_order_types: Vec<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_notional_usd: 100_000.0,
            allowed_order_types: vec!["MKT".to_string(), "LMT".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_conditions_per_strategy: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_conditions_per_strategy: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ib_gateway: IbGatewayConfig,
    pub runtime: RuntimeConfig,
    pub worker: WorkerConfig,
    pub verification: VerificationConfig,
    pub limits: LimitsConfig,
}

impl AppConfig {
    /// Load with full precedence: defaults, then the TOML file if present,
    /// then environment overrides. Clamps out-of-range values.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| EngineError::Config(format!("read {}: {e}", p.display())))?;
                toml::from_str(&raw)
                    .map_err(|e| EngineError::Config(format!("parse {}: {e}", p.display())))?
            }
            _ => AppConfig::default(),
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.normalize()?;
        Ok(cfg)
    }

    /// Per-field environment overrides. The getter indirection keeps this
    /// testable without mutating process env.
    pub fn apply_env_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("IB_GATEWAY_HOST") {
            self.ib_gateway.host = v;
        }
        if let Some(v) = get("IB_GATEWAY_PAPER_PORT").and_then(|v| v.parse().ok()) {
            self.ib_gateway.paper_port = v;
        }
        if let Some(v) = get("IB_GATEWAY_LIVE_PORT").and_then(|v| v.parse().ok()) {
            self.ib_gateway.live_port = v;
        }
        if let Some(v) = get("IB_GATEWAY_CLIENT_ID").and_then(|v| v.parse().ok()) {
            self.ib_gateway.client_id = v;
        }
        if let Some(v) = get("IB_GATEWAY_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
            self.ib_gateway.timeout_seconds = v;
        }
        if let Some(v) = get("IB_GATEWAY_TRADING_MODE").and_then(|v| TradingMode::parse(&v)) {
            self.ib_gateway.trading_mode = v;
        }
        if let Some(v) = get("IB_GATEWAY_ALLOW_LIVE") {
            self.ib_gateway.allow_live = parse_bool(&v);
        }
        if let Some(v) = get("RUNTIME_DATA_DIR") {
            self.runtime.data_dir = v;
        }
        if let Some(v) = get("RUNTIME_DB_PATH") {
            self.runtime.db_path = v;
        }
        if let Some(v) = get("RUNTIME_LOG_PATH") {
            self.runtime.log_path = v;
        }
        if let Some(v) = get("RUNTIME_MARKET_DATA_LOG_PATH") {
            self.runtime.market_data_log_path = v;
        }
        if let Some(v) = get("RUNTIME_MARKET_CACHE_DB_PATH") {
            self.runtime.market_cache_db_path = v;
        }
        if let Some(v) = get("WORKER_ENABLED") {
            self.worker.enabled = parse_bool(&v);
        }
        if let Some(v) = get("WORKER_MONITOR_INTERVAL_SECONDS").and_then(|v| v.parse().ok()) {
            self.worker.monitor_interval_seconds = v;
        }
        if let Some(v) = get("WORKER_CONFIGURED_THREADS").and_then(|v| v.parse().ok()) {
            self.worker.configured_threads = v;
        }
        if let Some(v) = get("WORKER_QUEUE_MAXSIZE").and_then(|v| v.parse().ok()) {
            self.worker.queue_maxsize = v;
        }
        if let Some(v) = get("VERIFICATION_MAX_NOTIONAL_USD").and_then(|v| v.parse().ok()) {
            self.verification.max_notional_usd = v;
        }
        if let Some(v) = get("VERIFICATION_ALLOWED_ORDER_TYPES") {
            self.verification.allowed_order_types = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = get("LIMITS_MAX_CONDITIONS_PER_STRATEGY").and_then(|v| v.parse().ok()) {
            self.limits.max_conditions_per_strategy = v;
        }
    }

    fn normalize(&mut self) -> EngineResult<()> {
        let interval = self.worker.monitor_interval_seconds;
        let clamped = interval.clamp(MONITOR_INTERVAL_MIN, MONITOR_INTERVAL_MAX);
        if clamped != interval {
            warn!(
                requested = interval,
                clamped, "monitor_interval_seconds out of range, clamping"
            );
            self.worker.monitor_interval_seconds = clamped;
        }
        if self.worker.configured_threads == 0 {
            warn!("configured_threads must be >= 1, using 1");
            self.worker.configured_threads = 1;
        }
        if self.worker.queue_maxsize == 0 {
            warn!("queue_maxsize must be >= 1, using 1");
            self.worker.queue_maxsize = 1;
        }
        if self.ib_gateway.trading_mode == TradingMode::Live && !self.ib_gateway.allow_live {
            return Err(EngineError::Config(
                "trading_mode=live requires ib_gateway.allow_live=true".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v, "1" | "true" | "TRUE" | "on" | "ON" | "yes")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingDataPolicy {
    Reject,
    #[default]
    BestEffort,
}

/// Evaluation parameters for one `(trigger_mode, evaluation_window)` cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRule {
    pub base_bar: BarSize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_consecutive: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_ratio: Option<f64>,
    #[serde(default)]
    pub include_partial_bar: bool,
    #[serde(default)]
    pub missing_data_policy: MissingDataPolicy,
}

/// Per-metric constraints on where and how it may be evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRule {
    pub allowed_windows: Vec<EvaluationWindow>,
    /// Permitted `(trigger_mode, operator)` pairs.
    pub allowed_rules: Vec<(TriggerMode, CompareOp)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionRules {
    pub trigger_mode_windows: HashMap<TriggerMode, HashMap<EvaluationWindow, WindowRule>>,
    pub metric_rules: HashMap<Metric, MetricRule>,
}

impl ConditionRules {
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let rules = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| EngineError::Config(format!("read {}: {e}", p.display())))?;
                toml::from_str(&raw)
                    .map_err(|e| EngineError::Config(format!("parse {}: {e}", p.display())))?
            }
            _ => ConditionRules::default(),
        };
        rules.validate()?;
        Ok(rules)
    }

    /// Exactly one of `confirm_consecutive`/`confirm_ratio` per confirm
    /// cell; both set (or neither, for a confirm mode) is a load error.
    pub fn validate(&self) -> EngineResult<()> {
        for (mode, windows) in &self.trigger_mode_windows {
            for (window, rule) in windows {
                let both = rule.confirm_consecutive.is_some() && rule.confirm_ratio.is_some();
                if both {
                    return Err(EngineError::Config(format!(
                        "rules for {} x {} set both confirm_consecutive and confirm_ratio",
                        mode.as_str(),
                        window.as_str()
                    )));
                }
                if mode.is_confirm()
                    && rule.confirm_consecutive.is_none()
                    && rule.confirm_ratio.is_none()
                {
                    return Err(EngineError::Config(format!(
                        "rules for {} x {} set neither confirm_consecutive nor confirm_ratio",
                        mode.as_str(),
                        window.as_str()
                    )));
                }
                if let Some(r) = rule.confirm_ratio {
                    if !(0.0..=1.0).contains(&r) {
                        return Err(EngineError::Config(format!(
                            "confirm_ratio {} out of [0,1] for {} x {}",
                            r,
                            mode.as_str(),
                            window.as_str()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn window_rule(&self, mode: TriggerMode, window: EvaluationWindow) -> Option<&WindowRule> {
        self.trigger_mode_windows.get(&mode)?.get(&window)
    }

    /// Whether a condition's `(metric, window, mode, operator)` tuple is
    /// permitted by the rules config.
    pub fn permits(
        &self,
        metric: Metric,
        window: EvaluationWindow,
        mode: TriggerMode,
        op: CompareOp,
    ) -> bool {
        let Some(rule) = self.metric_rules.get(&metric) else {
            return false;
        };
        rule.allowed_windows.contains(&window)
            && rule.allowed_rules.contains(&(mode, op))
            && self.window_rule(mode, window).is_some()
    }
}

impl Default for ConditionRules {
    fn default() -> Self {
        use EvaluationWindow::*;
        use TriggerMode::*;

        let minute_windows = [M1, M5, M30, H1];
        let hour_windows = [H1, H2, H4, D1, D2];
        let all_windows: Vec<EvaluationWindow> = {
            let mut v = minute_windows.to_vec();
            for w in hour_windows {
                if !v.contains(&w) {
                    v.push(w);
                }
            }
            v
        };

        // Base bar granularity per window: enough bars to confirm, coarse
        // enough to keep fetches small.
        fn base_bar(window: EvaluationWindow) -> BarSize {
            match window {
                M1 | M5 => BarSize::Min1,
                M30 | H1 | H2 => BarSize::Min5,
                H4 => BarSize::Min30,
                D1 | D2 => BarSize::Hour1,
            }
        }

        let modes = [
            LevelInstant,
            LevelConfirm,
            CrossUpInstant,
            CrossDownInstant,
            CrossUpConfirm,
            CrossDownConfirm,
        ];

        let mut trigger_mode_windows = HashMap::new();
        for mode in modes {
            let mut per_window = HashMap::new();
            for window in all_windows.iter().copied() {
                per_window.insert(
                    window,
                    WindowRule {
                        base_bar: base_bar(window),
                        confirm_consecutive: mode.is_confirm().then_some(3),
                        confirm_ratio: None,
                        include_partial_bar: !mode.is_confirm(),
                        missing_data_policy: MissingDataPolicy::BestEffort,
                    },
                );
            }
            trigger_mode_windows.insert(mode, per_window);
        }

        let level_ops = |ops: &[CompareOp]| -> Vec<(TriggerMode, CompareOp)> {
            let mut out = Vec::new();
            for op in ops {
                out.push((LevelInstant, *op));
                out.push((LevelConfirm, *op));
            }
            out.push((CrossUpInstant, CompareOp::Ge));
            out.push((CrossUpConfirm, CompareOp::Ge));
            out.push((CrossDownInstant, CompareOp::Le));
            out.push((CrossDownConfirm, CompareOp::Le));
            out
        };
        let all_ops = [CompareOp::Lt, CompareOp::Le, CompareOp::Gt, CompareOp::Ge];

        let mut metric_rules = HashMap::new();
        metric_rules.insert(
            Metric::Price,
            MetricRule {
                allowed_windows: minute_windows.to_vec(),
                allowed_rules: level_ops(&all_ops),
            },
        );
        // SPREAD is confirm-only.
        metric_rules.insert(
            Metric::Spread,
            MetricRule {
                allowed_windows: minute_windows.to_vec(),
                allowed_rules: all_ops
                    .iter()
                    .map(|op| (LevelConfirm, *op))
                    .chain([
                        (CrossUpConfirm, CompareOp::Ge),
                        (CrossDownConfirm, CompareOp::Le),
                    ])
                    .collect(),
            },
        );
        for metric in [
            Metric::DrawdownPct,
            Metric::RallyPct,
            Metric::VolumeRatio,
            Metric::AmountRatio,
        ] {
            metric_rules.insert(
                metric,
                MetricRule {
                    allowed_windows: hour_windows.to_vec(),
                    allowed_rules: level_ops(&all_ops),
                },
            );
        }

        Self {
            trigger_mode_windows,
            metric_rules,
        }
    }
}
