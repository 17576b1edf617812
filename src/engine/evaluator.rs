//! Condition evaluator
//!
//! `prepare` turns a condition plus the rules config into concrete bar
//! requirements; `evaluate` combines the fetched series with strategy
//! runtime state and produces TRUE/FALSE/WAITING with the observed value
//! and a reason. WAITING is data absence under a best-effort policy; the
//! reject policy surfaces a typed failure instead, which the orchestrator
//! logs without transitioning the strategy.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::{ConditionRules, MissingDataPolicy, WindowRule};
use crate::error::{EngineError, EngineResult};
use crate::marketdata::{Bar, BarRequest};
use crate::models::{CompareOp, Condition, ConditionState, Metric, TriggerMode};

/// Extra base bars fetched beyond the window so cross modes always have a
/// prior observation.
const CROSS_LOOKBACK_BARS: i64 = 2;

#[derive(Debug, Clone)]
pub struct PreparedCondition {
    pub condition: Condition,
    pub rule: WindowRule,
    pub requests: Vec<BarRequest>,
}

#[derive(Debug, Default)]
pub struct ConditionInputs<'a> {
    pub bars_a: &'a [Bar],
    pub bars_b: Option<&'a [Bar]>,
    pub since_activation_high: Option<f64>,
    pub since_activation_low: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ConditionOutcome {
    pub state: ConditionState,
    pub observed_value: Option<f64>,
    pub reason: String,
    /// End of the data actually used, for run bookkeeping.
    pub data_end: Option<DateTime<Utc>>,
}

impl ConditionOutcome {
    fn holds(observed: f64, reason: String, data_end: Option<DateTime<Utc>>) -> Self {
        Self {
            state: ConditionState::True,
            observed_value: Some(observed),
            reason,
            data_end,
        }
    }

    fn fails(observed: f64, reason: String, data_end: Option<DateTime<Utc>>) -> Self {
        Self {
            state: ConditionState::False,
            observed_value: Some(observed),
            reason,
            data_end,
        }
    }

    fn waiting(reason: String) -> Self {
        Self {
            state: ConditionState::Waiting,
            observed_value: None,
            reason,
            data_end: None,
        }
    }
}

/// Resolve a condition against the rules config into bar requirements.
pub fn prepare(
    condition: &Condition,
    rules: &ConditionRules,
    now: DateTime<Utc>,
) -> EngineResult<PreparedCondition> {
    if !rules.permits(
        condition.metric,
        condition.evaluation_window,
        condition.trigger_mode,
        condition.operator,
    ) {
        return Err(EngineError::Validation(format!(
            "{} does not permit {} {} over {}",
            condition.metric.as_str(),
            condition.trigger_mode.as_str(),
            condition.operator.as_str(),
            condition.evaluation_window.as_str(),
        )));
    }
    let rule = rules
        .window_rule(condition.trigger_mode, condition.evaluation_window)
        .cloned()
        .ok_or_else(|| {
            EngineError::Validation(format!(
                "no window rule for {} x {}",
                condition.trigger_mode.as_str(),
                condition.evaluation_window.as_str()
            ))
        })?;

    let window_secs = condition.evaluation_window.duration().as_secs() as i64;
    let lookback = window_secs + CROSS_LOOKBACK_BARS * rule.base_bar.seconds();
    let start = now - ChronoDuration::seconds(lookback);

    let requests = condition
        .products()
        .into_iter()
        .map(|contract| BarRequest {
            contract: contract.to_string(),
            bar_size: rule.base_bar,
            start,
            end: now,
            what_to_show: Default::default(),
            use_rth: false,
            include_partial_bar: rule.include_partial_bar,
        })
        .collect();

    Ok(PreparedCondition {
        condition: condition.clone(),
        rule,
        requests,
    })
}

/// Evaluate a prepared condition over its inputs.
pub fn evaluate(
    prepared: &PreparedCondition,
    inputs: &ConditionInputs<'_>,
) -> EngineResult<ConditionOutcome> {
    let condition = &prepared.condition;
    let rule = &prepared.rule;

    let series = match build_series(condition, inputs) {
        Ok(series) => series,
        Err(reason) => return missing_data(rule, reason),
    };
    if series.is_empty() {
        return missing_data(rule, "no bars in window".to_string());
    }
    let data_end = series.last().map(|(ts, _)| *ts + ChronoDuration::seconds(rule.base_bar.seconds()));
    let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
    let op = condition.operator;
    let threshold = condition.value;

    match condition.trigger_mode {
        TriggerMode::LevelInstant => {
            let observed = instant_observed(condition, inputs, &values);
            let reason = format!(
                "{} {} {} {}",
                condition.metric.as_str(),
                observed,
                op.as_str(),
                threshold
            );
            if op.apply(observed, threshold) {
                Ok(ConditionOutcome::holds(observed, reason, data_end))
            } else {
                Ok(ConditionOutcome::fails(observed, reason, data_end))
            }
        }
        TriggerMode::LevelConfirm => evaluate_level_confirm(rule, &values, op, threshold, data_end),
        TriggerMode::CrossUpInstant | TriggerMode::CrossDownInstant => {
            evaluate_cross_instant(condition.trigger_mode, &values, op, threshold, rule, data_end)
        }
        TriggerMode::CrossUpConfirm | TriggerMode::CrossDownConfirm => {
            evaluate_cross_confirm(condition.trigger_mode, rule, &values, op, threshold, data_end)
        }
    }
}

/// Merge freshly observed bars into since-activation extrema.
pub fn roll_extrema(bars: &[Bar], high: Option<f64>, low: Option<f64>) -> (Option<f64>, Option<f64>) {
    let mut high = high;
    let mut low = low;
    for bar in bars {
        high = Some(high.map_or(bar.high, |h| h.max(bar.high)));
        low = Some(low.map_or(bar.low, |l| l.min(bar.low)));
    }
    (high, low)
}

fn missing_data(rule: &WindowRule, reason: String) -> EngineResult<ConditionOutcome> {
    match rule.missing_data_policy {
        MissingDataPolicy::BestEffort => Ok(ConditionOutcome::waiting(reason)),
        MissingDataPolicy::Reject => Err(EngineError::DataUnavailable(reason)),
    }
}

/// Per-bar observable series `(ts, value)` for the metric.
fn build_series(
    condition: &Condition,
    inputs: &ConditionInputs<'_>,
) -> Result<Vec<(DateTime<Utc>, f64)>, String> {
    let basis = condition.window_price_basis;
    match condition.metric {
        Metric::Price => Ok(inputs
            .bars_a
            .iter()
            .map(|b| (b.ts, b.basis(basis)))
            .collect()),
        Metric::DrawdownPct => {
            let high = inputs
                .since_activation_high
                .ok_or_else(|| "since-activation high not initialized".to_string())?;
            if high <= 0.0 {
                return Err("since-activation high is not positive".to_string());
            }
            Ok(inputs
                .bars_a
                .iter()
                .map(|b| {
                    let p = b.basis(basis);
                    (b.ts, ((high - p) / high).max(0.0))
                })
                .collect())
        }
        Metric::RallyPct => {
            let low = inputs
                .since_activation_low
                .ok_or_else(|| "since-activation low not initialized".to_string())?;
            if low <= 0.0 {
                return Err("since-activation low is not positive".to_string());
            }
            Ok(inputs
                .bars_a
                .iter()
                .map(|b| {
                    let p = b.basis(basis);
                    (b.ts, ((p - low) / low).max(0.0))
                })
                .collect())
        }
        Metric::VolumeRatio => {
            let bars_b = inputs.bars_b.ok_or_else(|| "missing pair series".to_string())?;
            align(inputs.bars_a, bars_b, |a, b| {
                if b.volume > 0.0 {
                    Some(a.volume / b.volume)
                } else {
                    None
                }
            })
        }
        Metric::AmountRatio => {
            let bars_b = inputs.bars_b.ok_or_else(|| "missing pair series".to_string())?;
            align(inputs.bars_a, bars_b, |a, b| {
                let denom = b.amount();
                if denom > 0.0 {
                    Some(a.amount() / denom)
                } else {
                    None
                }
            })
        }
        Metric::Spread => {
            let bars_b = inputs.bars_b.ok_or_else(|| "missing pair series".to_string())?;
            align(inputs.bars_a, bars_b, |a, b| {
                Some(a.basis(basis) - b.basis(basis))
            })
        }
    }
}

/// Join two bar series on bucket timestamps.
fn align(
    a: &[Bar],
    b: &[Bar],
    f: impl Fn(&Bar, &Bar) -> Option<f64>,
) -> Result<Vec<(DateTime<Utc>, f64)>, String> {
    let mut out = Vec::new();
    let mut ib = 0usize;
    for bar_a in a {
        while ib < b.len() && b[ib].ts < bar_a.ts {
            ib += 1;
        }
        if ib < b.len() && b[ib].ts == bar_a.ts {
            if let Some(v) = f(bar_a, &b[ib]) {
                out.push((bar_a.ts, v));
            }
        }
    }
    if out.is_empty() {
        return Err("pair series do not overlap".to_string());
    }
    Ok(out)
}

/// Observed value for LEVEL_INSTANT: ratio metrics aggregate the whole
/// window; everything else reads the latest basis.
fn instant_observed(condition: &Condition, inputs: &ConditionInputs<'_>, values: &[f64]) -> f64 {
    match condition.metric {
        Metric::VolumeRatio => {
            let (num, den) = window_sums(inputs, |b| b.volume);
            if den > 0.0 {
                num / den
            } else {
                *values.last().unwrap()
            }
        }
        Metric::AmountRatio => {
            let (num, den) = window_sums(inputs, |b| b.amount());
            if den > 0.0 {
                num / den
            } else {
                *values.last().unwrap()
            }
        }
        _ => *values.last().unwrap(),
    }
}

fn window_sums(inputs: &ConditionInputs<'_>, f: impl Fn(&Bar) -> f64) -> (f64, f64) {
    let num: f64 = inputs.bars_a.iter().map(&f).sum();
    let den: f64 = inputs
        .bars_b
        .map(|bars| bars.iter().map(&f).sum())
        .unwrap_or(0.0);
    (num, den)
}

fn evaluate_level_confirm(
    rule: &WindowRule,
    values: &[f64],
    op: CompareOp,
    threshold: f64,
    data_end: Option<DateTime<Utc>>,
) -> EngineResult<ConditionOutcome> {
    let observed = *values.last().unwrap();
    if let Some(k) = rule.confirm_consecutive {
        let k = k as usize;
        if values.len() < k {
            return missing_data(
                rule,
                format!("need {k} bars to confirm, have {}", values.len()),
            );
        }
        let confirmed = values[values.len() - k..]
            .iter()
            .all(|v| op.apply(*v, threshold));
        let reason = format!(
            "last {k} bars {} {} {} {}",
            if confirmed { "all" } else { "not all" },
            op.as_str(),
            threshold,
            format_args!("(latest {observed})")
        );
        return Ok(if confirmed {
            ConditionOutcome::holds(observed, reason, data_end)
        } else {
            ConditionOutcome::fails(observed, reason, data_end)
        });
    }
    // Rules validation guarantees exactly one of the two is set.
    let ratio = rule.confirm_ratio.unwrap_or(1.0);
    let satisfied = values.iter().filter(|v| op.apply(**v, threshold)).count();
    let fraction = satisfied as f64 / values.len() as f64;
    let confirmed = fraction >= ratio;
    let reason = format!(
        "{satisfied}/{} bars {} {} (need ratio {ratio})",
        values.len(),
        op.as_str(),
        threshold
    );
    Ok(if confirmed {
        ConditionOutcome::holds(observed, reason, data_end)
    } else {
        ConditionOutcome::fails(observed, reason, data_end)
    })
}

fn evaluate_cross_instant(
    mode: TriggerMode,
    values: &[f64],
    op: CompareOp,
    threshold: f64,
    rule: &WindowRule,
    data_end: Option<DateTime<Utc>>,
) -> EngineResult<ConditionOutcome> {
    if values.len() < 2 {
        return missing_data(rule, "need a prior bar to detect a cross".to_string());
    }
    let prior = values[values.len() - 2];
    let latest = *values.last().unwrap();
    let crossed = match mode {
        TriggerMode::CrossUpInstant => prior < threshold && op.apply(latest, threshold),
        TriggerMode::CrossDownInstant => prior > threshold && op.apply(latest, threshold),
        _ => unreachable!("not a cross-instant mode"),
    };
    let reason = format!("prior {prior}, latest {latest}, threshold {threshold}");
    Ok(if crossed {
        ConditionOutcome::holds(latest, reason, data_end)
    } else {
        ConditionOutcome::fails(latest, reason, data_end)
    })
}

fn evaluate_cross_confirm(
    mode: TriggerMode,
    rule: &WindowRule,
    values: &[f64],
    op: CompareOp,
    threshold: f64,
    data_end: Option<DateTime<Utc>>,
) -> EngineResult<ConditionOutcome> {
    let k = rule.confirm_consecutive.unwrap_or(1) as usize;
    if values.len() < k + 1 {
        return missing_data(
            rule,
            format!("need {} bars to confirm a cross, have {}", k + 1, values.len()),
        );
    }
    // Latest cross: the most recent index whose prior bar sat on the wrong
    // side of the threshold.
    let cross_idx = (1..values.len()).rev().find(|&i| {
        let prior = values[i - 1];
        let wrong_side = match mode {
            TriggerMode::CrossUpConfirm => prior < threshold,
            TriggerMode::CrossDownConfirm => prior > threshold,
            _ => unreachable!("not a cross-confirm mode"),
        };
        wrong_side && op.apply(values[i], threshold)
    });
    let latest = *values.last().unwrap();
    let Some(idx) = cross_idx else {
        return Ok(ConditionOutcome::fails(
            latest,
            format!("no cross of {threshold} observed in window"),
            data_end,
        ));
    };
    let since_cross = &values[idx..];
    let confirmed =
        since_cross.len() >= k && since_cross.iter().all(|v| op.apply(*v, threshold));
    let reason = format!(
        "cross at bar {idx}, {} of {k} confirming bars",
        since_cross.iter().filter(|v| op.apply(**v, threshold)).count()
    );
    Ok(if confirmed {
        ConditionOutcome::holds(latest, reason, data_end)
    } else {
        ConditionOutcome::fails(latest, reason, data_end)
    })
}
