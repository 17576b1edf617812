//! Condition vocabulary: metrics, trigger modes, windows, operators
//!
//! `conditions_json` on a strategy row is a list of these records,
//! validated and normalized on write and consumed typed in memory.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    SingleProduct,
    PairProducts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Metric {
    Price,
    DrawdownPct,
    RallyPct,
    VolumeRatio,
    AmountRatio,
    Spread,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Price => "PRICE",
            Metric::DrawdownPct => "DRAWDOWN_PCT",
            Metric::RallyPct => "RALLY_PCT",
            Metric::VolumeRatio => "VOLUME_RATIO",
            Metric::AmountRatio => "AMOUNT_RATIO",
            Metric::Spread => "SPREAD",
        }
    }

    /// Value units: USD for PRICE/SPREAD, ratio in [0,1) otherwise.
    pub fn is_usd_valued(&self) -> bool {
        matches!(self, Metric::Price | Metric::Spread)
    }

    pub fn requires_pair(&self) -> bool {
        matches!(
            self,
            Metric::VolumeRatio | Metric::AmountRatio | Metric::Spread
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerMode {
    LevelInstant,
    LevelConfirm,
    CrossUpInstant,
    CrossDownInstant,
    CrossUpConfirm,
    CrossDownConfirm,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::LevelInstant => "LEVEL_INSTANT",
            TriggerMode::LevelConfirm => "LEVEL_CONFIRM",
            TriggerMode::CrossUpInstant => "CROSS_UP_INSTANT",
            TriggerMode::CrossDownInstant => "CROSS_DOWN_INSTANT",
            TriggerMode::CrossUpConfirm => "CROSS_UP_CONFIRM",
            TriggerMode::CrossDownConfirm => "CROSS_DOWN_CONFIRM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LEVEL_INSTANT" => Some(TriggerMode::LevelInstant),
            "LEVEL_CONFIRM" => Some(TriggerMode::LevelConfirm),
            "CROSS_UP_INSTANT" => Some(TriggerMode::CrossUpInstant),
            "CROSS_DOWN_INSTANT" => Some(TriggerMode::CrossDownInstant),
            "CROSS_UP_CONFIRM" => Some(TriggerMode::CrossUpConfirm),
            "CROSS_DOWN_CONFIRM" => Some(TriggerMode::CrossDownConfirm),
            _ => None,
        }
    }

    pub fn is_confirm(&self) -> bool {
        matches!(
            self,
            TriggerMode::LevelConfirm
                | TriggerMode::CrossUpConfirm
                | TriggerMode::CrossDownConfirm
        )
    }

    pub fn is_cross(&self) -> bool {
        matches!(
            self,
            TriggerMode::CrossUpInstant
                | TriggerMode::CrossDownInstant
                | TriggerMode::CrossUpConfirm
                | TriggerMode::CrossDownConfirm
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Le),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Ge),
            _ => None,
        }
    }

    pub fn apply(&self, observed: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Lt => observed < threshold,
            CompareOp::Le => observed <= threshold,
            CompareOp::Gt => observed > threshold,
            CompareOp::Ge => observed >= threshold,
        }
    }
}

/// Rolling evaluation window. Independent of scan cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EvaluationWindow {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "2d")]
    D2,
}

impl EvaluationWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationWindow::M1 => "1m",
            EvaluationWindow::M5 => "5m",
            EvaluationWindow::M30 => "30m",
            EvaluationWindow::H1 => "1h",
            EvaluationWindow::H2 => "2h",
            EvaluationWindow::H4 => "4h",
            EvaluationWindow::D1 => "1d",
            EvaluationWindow::D2 => "2d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(EvaluationWindow::M1),
            "5m" => Some(EvaluationWindow::M5),
            "30m" => Some(EvaluationWindow::M30),
            "1h" => Some(EvaluationWindow::H1),
            "2h" => Some(EvaluationWindow::H2),
            "4h" => Some(EvaluationWindow::H4),
            "1d" => Some(EvaluationWindow::D1),
            "2d" => Some(EvaluationWindow::D2),
            _ => None,
        }
    }

    pub fn duration(&self) -> Duration {
        let secs = match self {
            EvaluationWindow::M1 => 60,
            EvaluationWindow::M5 => 5 * 60,
            EvaluationWindow::M30 => 30 * 60,
            EvaluationWindow::H1 => 3600,
            EvaluationWindow::H2 => 2 * 3600,
            EvaluationWindow::H4 => 4 * 3600,
            EvaluationWindow::D1 => 86400,
            EvaluationWindow::D2 => 2 * 86400,
        };
        Duration::from_secs(secs)
    }
}

/// Which scalar a bar contributes under evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriceBasis {
    #[default]
    Close,
    High,
    Low,
    Avg,
}

impl PriceBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceBasis::Close => "close",
            PriceBasis::High => "high",
            PriceBasis::Low => "low",
            PriceBasis::Avg => "avg",
        }
    }
}

/// Runtime evaluation state of a condition. `NotEvaluated` is the
/// initial read-model value before the first run touches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionState {
    True,
    False,
    Waiting,
    NotEvaluated,
}

impl ConditionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionState::True => "TRUE",
            ConditionState::False => "FALSE",
            ConditionState::Waiting => "WAITING",
            ConditionState::NotEvaluated => "NOT_EVALUATED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRUE" => Some(ConditionState::True),
            "FALSE" => Some(ConditionState::False),
            "WAITING" => Some(ConditionState::Waiting),
            "NOT_EVALUATED" => Some(ConditionState::NotEvaluated),
            _ => None,
        }
    }
}

/// A single conditional rule on a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub condition_id: String,
    pub condition_type: ConditionType,
    pub metric: Metric,
    pub trigger_mode: TriggerMode,
    pub evaluation_window: EvaluationWindow,
    #[serde(default)]
    pub window_price_basis: PriceBasis,
    pub operator: CompareOp,
    pub value: f64,
    pub product: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_b: Option<String>,
}

impl Condition {
    /// Products this condition reads, primary first.
    pub fn products(&self) -> Vec<&str> {
        let mut out = vec![self.product.as_str()];
        if let Some(b) = &self.product_b {
            out.push(b.as_str());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_semantics() {
        assert!(CompareOp::Le.apply(60.0, 60.0));
        assert!(!CompareOp::Lt.apply(60.0, 60.0));
        assert!(CompareOp::Ge.apply(100.5, 100.0));
        assert!(!CompareOp::Gt.apply(100.0, 100.0));
    }

    #[test]
    fn window_round_trip() {
        for w in [
            EvaluationWindow::M1,
            EvaluationWindow::M5,
            EvaluationWindow::M30,
            EvaluationWindow::H1,
            EvaluationWindow::H2,
            EvaluationWindow::H4,
            EvaluationWindow::D1,
            EvaluationWindow::D2,
        ] {
            assert_eq!(EvaluationWindow::parse(w.as_str()), Some(w));
        }
        assert!(EvaluationWindow::parse("3h").is_none());
    }

    #[test]
    fn condition_json_shape() {
        let c = Condition {
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
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["metric"], "PRICE");
        assert_eq!(json["trigger_mode"], "LEVEL_INSTANT");
        assert_eq!(json["operator"], "<=");
        assert_eq!(json["evaluation_window"], "1m");
        let back: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }
}
