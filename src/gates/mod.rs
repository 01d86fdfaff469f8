//! 质量闸门：阶段结果指标 -> 通过 / 拒绝 + 原因
//!
//! 纯函数，无副作用。阈值均为闭区间（恰好等于阈值视为通过）。
//! 闸门失败是普通返回值（GateResult），由状态机转换为 GateError 使研究周期失败。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::operations::ParameterMap;

/// 浮点比较容差，保证阈值边界值通过
const EPSILON: f64 = 1e-9;

/// 训练结果中的指标键
pub const TEST_ACCURACY: &str = "test_accuracy";
pub const TEST_LOSS: &str = "test_loss";
pub const TRAIN_LOSS_HISTORY: &str = "train_loss_history";

/// 回测结果中的指标键
pub const WIN_RATE: &str = "win_rate";
pub const MAX_DRAWDOWN_PCT: &str = "max_drawdown_pct";
pub const SHARPE_RATIO: &str = "sharpe_ratio";

/// 闸门名称
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    Training,
    Backtest,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Training => "training",
            GateKind::Backtest => "backtest",
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 闸门评估结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateResult {
    pub passed: bool,
    pub reason: String,
    pub metrics: BTreeMap<String, f64>,
}

impl GateResult {
    fn pass(metrics: BTreeMap<String, f64>) -> Self {
        Self {
            passed: true,
            reason: "all_checks_passed".to_string(),
            metrics,
        }
    }

    fn fail(reason: String, metrics: BTreeMap<String, f64>) -> Self {
        Self {
            passed: false,
            reason,
            metrics,
        }
    }

    /// 失败结果转为 GateError；通过时返回 None
    pub fn into_error(self, gate: GateKind) -> Option<GateError> {
        if self.passed {
            return None;
        }
        Some(GateError {
            gate,
            metrics: self.metrics,
            message: self.reason,
        })
    }
}

/// 闸门失败：研究周期在下一阶段子任务创建之前失败
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{gate} gate failed: {message}")]
pub struct GateError {
    pub gate: GateKind,
    pub metrics: BTreeMap<String, f64>,
    pub message: String,
}

/// 训练闸门阈值
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainingGateConfig {
    #[serde(default = "default_min_accuracy")]
    pub min_accuracy: f64,
    #[serde(default = "default_max_loss")]
    pub max_loss: f64,
    /// 首个到末个训练损失样本的最小相对下降
    #[serde(default = "default_min_loss_decrease")]
    pub min_loss_decrease: f64,
}

fn default_min_accuracy() -> f64 {
    0.45
}

fn default_max_loss() -> f64 {
    0.8
}

fn default_min_loss_decrease() -> f64 {
    0.2
}

impl Default for TrainingGateConfig {
    fn default() -> Self {
        Self {
            min_accuracy: default_min_accuracy(),
            max_loss: default_max_loss(),
            min_loss_decrease: default_min_loss_decrease(),
        }
    }
}

/// 回测闸门阈值
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BacktestGateConfig {
    #[serde(default = "default_min_win_rate")]
    pub min_win_rate: f64,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    #[serde(default = "default_min_sharpe_ratio")]
    pub min_sharpe_ratio: f64,
}

fn default_min_win_rate() -> f64 {
    0.45
}

fn default_max_drawdown_pct() -> f64 {
    0.40
}

fn default_min_sharpe_ratio() -> f64 {
    -0.5
}

impl Default for BacktestGateConfig {
    fn default() -> Self {
        Self {
            min_win_rate: default_min_win_rate(),
            max_drawdown_pct: default_max_drawdown_pct(),
            min_sharpe_ratio: default_min_sharpe_ratio(),
        }
    }
}

fn below(value: f64, threshold: f64) -> bool {
    value < threshold - EPSILON
}

fn above(value: f64, threshold: f64) -> bool {
    value > threshold + EPSILON
}

/// 百分比格式：45.0 -> "45"，42.25 -> "42.2"
fn pct(ratio: f64) -> String {
    let s = format!("{:.1}", ratio * 100.0);
    s.strip_suffix(".0").map(str::to_string).unwrap_or(s)
}

fn number(map: &ParameterMap, key: &str) -> Option<f64> {
    map.get(key).and_then(Value::as_f64)
}

fn loss_history(map: &ParameterMap) -> Vec<f64> {
    map.get(TRAIN_LOSS_HISTORY)
        .and_then(Value::as_array)
        .map(|samples| samples.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

/// 训练闸门：准确率、测试损失、训练损失下降幅度；第一个失败条件决定原因
pub fn check_training_gate(result: &ParameterMap, config: &TrainingGateConfig) -> GateResult {
    let mut metrics = BTreeMap::new();

    let accuracy = number(result, TEST_ACCURACY);
    let loss = number(result, TEST_LOSS);
    if let Some(a) = accuracy {
        metrics.insert(TEST_ACCURACY.to_string(), a);
    }
    if let Some(l) = loss {
        metrics.insert(TEST_LOSS.to_string(), l);
    }

    let history = loss_history(result);
    let decrease = match (history.first(), history.last()) {
        (Some(&first), Some(&last)) if history.len() >= 2 && first > 0.0 => {
            Some((first - last) / first)
        }
        _ => None,
    };
    if let Some(d) = decrease {
        metrics.insert("loss_decrease".to_string(), d);
    }

    let accuracy = match accuracy {
        Some(a) => a,
        None => return GateResult::fail(format!("missing_metric ({TEST_ACCURACY})"), metrics),
    };
    if below(accuracy, config.min_accuracy) {
        let reason = format!(
            "accuracy_below_threshold ({}% < {}%)",
            pct(accuracy),
            pct(config.min_accuracy)
        );
        return GateResult::fail(reason, metrics);
    }

    let loss = match loss {
        Some(l) => l,
        None => return GateResult::fail(format!("missing_metric ({TEST_LOSS})"), metrics),
    };
    if above(loss, config.max_loss) {
        let reason = format!("loss_above_threshold ({loss:.3} > {})", config.max_loss);
        return GateResult::fail(reason, metrics);
    }

    // 样本不足两个时无法判断下降幅度，跳过
    if let Some(d) = decrease {
        if below(d, config.min_loss_decrease) {
            let reason = format!(
                "insufficient_loss_decrease ({}% < {}%)",
                pct(d),
                pct(config.min_loss_decrease)
            );
            return GateResult::fail(reason, metrics);
        }
    }

    GateResult::pass(metrics)
}

/// 回测闸门：胜率、最大回撤、夏普比率。三项独立评估，原因取第一个违规指标
pub fn check_backtest_gate(result: &ParameterMap, config: &BacktestGateConfig) -> GateResult {
    let mut metrics = BTreeMap::new();
    let mut violations: Vec<String> = Vec::new();

    match number(result, WIN_RATE) {
        Some(v) => {
            metrics.insert(WIN_RATE.to_string(), v);
            if below(v, config.min_win_rate) {
                violations.push(format!(
                    "win_rate_below_threshold ({}% < {}%)",
                    pct(v),
                    pct(config.min_win_rate)
                ));
            }
        }
        None => violations.push(format!("missing_metric ({WIN_RATE})")),
    }

    match number(result, MAX_DRAWDOWN_PCT) {
        Some(v) => {
            metrics.insert(MAX_DRAWDOWN_PCT.to_string(), v);
            if above(v, config.max_drawdown_pct) {
                violations.push(format!(
                    "drawdown_above_threshold ({}% > {}%)",
                    pct(v),
                    pct(config.max_drawdown_pct)
                ));
            }
        }
        None => violations.push(format!("missing_metric ({MAX_DRAWDOWN_PCT})")),
    }

    match number(result, SHARPE_RATIO) {
        Some(v) => {
            metrics.insert(SHARPE_RATIO.to_string(), v);
            if below(v, config.min_sharpe_ratio) {
                violations.push(format!(
                    "sharpe_below_threshold ({v:.2} < {})",
                    config.min_sharpe_ratio
                ));
            }
        }
        None => violations.push(format!("missing_metric ({SHARPE_RATIO})")),
    }

    if violations.len() > 1 {
        tracing::debug!(violations = ?violations, "Backtest gate: multiple violations");
    }

    match violations.into_iter().next() {
        Some(reason) => GateResult::fail(reason, metrics),
        None => GateResult::pass(metrics),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> ParameterMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_training_gate_passes() {
        let result = map(json!({
            "test_accuracy": 0.62,
            "test_loss": 0.41,
            "train_loss_history": [1.0, 0.7, 0.5],
        }));
        let gate = check_training_gate(&result, &TrainingGateConfig::default());
        assert!(gate.passed, "{}", gate.reason);
        assert_eq!(gate.metrics.get("test_accuracy"), Some(&0.62));
    }

    #[test]
    fn test_training_gate_accuracy_reason() {
        let result = map(json!({ "test_accuracy": 0.423, "test_loss": 0.2 }));
        let gate = check_training_gate(&result, &TrainingGateConfig::default());
        assert!(!gate.passed);
        assert_eq!(gate.reason, "accuracy_below_threshold (42.3% < 45%)");
    }

    #[test]
    fn test_training_gate_first_failure_wins() {
        // 准确率与损失都不达标时，原因取准确率
        let result = map(json!({ "test_accuracy": 0.30, "test_loss": 0.95 }));
        let gate = check_training_gate(&result, &TrainingGateConfig::default());
        assert!(gate.reason.starts_with("accuracy_below_threshold"));
    }

    #[test]
    fn test_training_gate_loss() {
        let result = map(json!({ "test_accuracy": 0.5, "test_loss": 0.85 }));
        let gate = check_training_gate(&result, &TrainingGateConfig::default());
        assert!(!gate.passed);
        assert!(gate.reason.starts_with("loss_above_threshold"));
    }

    #[test]
    fn test_training_gate_loss_decrease() {
        let result = map(json!({
            "test_accuracy": 0.5,
            "test_loss": 0.5,
            "train_loss_history": [1.0, 0.95, 0.9],
        }));
        let gate = check_training_gate(&result, &TrainingGateConfig::default());
        assert!(!gate.passed);
        assert_eq!(gate.reason, "insufficient_loss_decrease (10% < 20%)");
    }

    #[test]
    fn test_training_gate_inclusive_thresholds() {
        let result = map(json!({
            "test_accuracy": 0.45,
            "test_loss": 0.8,
            "train_loss_history": [1.0, 0.8],
        }));
        let gate = check_training_gate(&result, &TrainingGateConfig::default());
        assert!(gate.passed, "{}", gate.reason);
    }

    #[test]
    fn test_training_gate_short_history_skips_decrease() {
        let result = map(json!({
            "test_accuracy": 0.5,
            "test_loss": 0.5,
            "train_loss_history": [0.9],
        }));
        assert!(check_training_gate(&result, &TrainingGateConfig::default()).passed);
    }

    #[test]
    fn test_training_gate_missing_metric() {
        let gate = check_training_gate(&ParameterMap::new(), &TrainingGateConfig::default());
        assert!(!gate.passed);
        assert_eq!(gate.reason, "missing_metric (test_accuracy)");
    }

    #[test]
    fn test_backtest_gate_inclusive_thresholds() {
        let result = map(json!({
            "win_rate": 0.45,
            "max_drawdown_pct": 0.40,
            "sharpe_ratio": -0.5,
        }));
        let gate = check_backtest_gate(&result, &BacktestGateConfig::default());
        assert!(gate.passed, "{}", gate.reason);
    }

    #[test]
    fn test_backtest_gate_reason_names_first_violation() {
        let result = map(json!({
            "win_rate": 0.55,
            "max_drawdown_pct": 0.55,
            "sharpe_ratio": -1.2,
        }));
        let gate = check_backtest_gate(&result, &BacktestGateConfig::default());
        assert!(!gate.passed);
        assert_eq!(gate.reason, "drawdown_above_threshold (55% > 40%)");
        assert_eq!(gate.metrics.len(), 3);
    }

    #[test]
    fn test_backtest_gate_sharpe_only() {
        let result = map(json!({
            "win_rate": 0.5,
            "max_drawdown_pct": 0.1,
            "sharpe_ratio": -0.8,
        }));
        let gate = check_backtest_gate(&result, &BacktestGateConfig::default());
        assert_eq!(gate.reason, "sharpe_below_threshold (-0.80 < -0.5)");
    }

    #[test]
    fn test_gate_error_conversion() {
        let result = map(json!({ "test_accuracy": 0.30, "test_loss": 0.2 }));
        let err = check_training_gate(&result, &TrainingGateConfig::default())
            .into_error(GateKind::Training)
            .unwrap();
        assert_eq!(err.gate, GateKind::Training);
        assert_eq!(err.metrics.get("test_accuracy"), Some(&0.30));
        assert!(err.to_string().starts_with("training gate failed"));

        let ok = map(json!({ "win_rate": 0.6, "max_drawdown_pct": 0.1, "sharpe_ratio": 1.0 }));
        assert!(check_backtest_gate(&ok, &BacktestGateConfig::default())
            .into_error(GateKind::Backtest)
            .is_none());
    }
}
