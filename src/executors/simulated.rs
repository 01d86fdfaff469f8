//! 模拟阶段执行器（本地运行与测试用，无需训练 / 回测后端）
//!
//! 按阶段生成确定性的指标映射，可配置延迟、覆盖结果或固定失败。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::core::Phase;
use crate::executors::{PhaseError, PhaseExecutor, PhaseRequest};
use crate::operations::ParameterMap;

#[derive(Debug, Clone)]
enum Outcome {
    Default,
    Result(ParameterMap),
    Fail(String),
}

/// 模拟执行器
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    delay: Duration,
    outcome: Outcome,
}

impl SimulatedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            outcome: Outcome::Default,
        }
    }

    /// 以给定结果映射完成
    pub fn with_result(mut self, result: ParameterMap) -> Self {
        self.outcome = Outcome::Result(result);
        self
    }

    /// 总是失败
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.outcome = Outcome::Fail(message.into());
        self
    }

    fn default_result(request: &PhaseRequest) -> ParameterMap {
        let short_id: String = request.parent_operation_id.chars().rev().take(6).collect();
        let value = match request.phase {
            Phase::Designing => {
                let name = format!("{}_strategy_{}", request.model, short_id);
                json!({
                    "strategy_name": name,
                    "strategy_path": format!("strategies/{name}.yaml"),
                    "input_tokens": 1500,
                    "output_tokens": 400,
                    "cost_usd": 0.02,
                })
            }
            Phase::Training => json!({
                "model_path": format!(
                    "models/{}/model.pt",
                    request.strategy_name.as_deref().unwrap_or("unnamed")
                ),
                "test_accuracy": 0.58,
                "test_loss": 0.52,
                "train_loss_history": [0.95, 0.81, 0.70, 0.62, 0.55],
                "epochs": 5,
            }),
            Phase::Backtesting => json!({
                "win_rate": 0.53,
                "max_drawdown_pct": 0.18,
                "sharpe_ratio": 0.9,
                "total_return": 0.12,
                "total_trades": 48,
            }),
            Phase::Assessing => json!({
                "verdict": "promising",
                "summary": "Edge holds out of sample; drawdown within tolerance.",
                "input_tokens": 900,
                "output_tokens": 250,
                "cost_usd": 0.01,
            }),
            _ => json!({}),
        };
        value.as_object().cloned().unwrap_or_default()
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

#[async_trait]
impl PhaseExecutor for SimulatedExecutor {
    async fn run(&self, request: PhaseRequest) -> Result<ParameterMap, PhaseError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.outcome {
            Outcome::Default => Ok(Self::default_result(&request)),
            Outcome::Result(result) => Ok(result.clone()),
            Outcome::Fail(message) => Err(PhaseError::Failed(message.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{check_backtest_gate, check_training_gate, BacktestGateConfig, TrainingGateConfig};

    fn request(phase: Phase) -> PhaseRequest {
        PhaseRequest {
            parent_operation_id: "op_abcdef123456".into(),
            operation_id: "op_child".into(),
            phase,
            model: "mlp".into(),
            brief: None,
            strategy_name: Some("mlp_strategy_654321".into()),
            strategy_path: None,
            training_result: None,
            backtest_result: None,
        }
    }

    #[tokio::test]
    async fn test_default_results_pass_gates() {
        let executor = SimulatedExecutor::new(Duration::ZERO);

        let design = executor.run(request(Phase::Designing)).await.unwrap();
        assert!(design.get("strategy_name").and_then(|v| v.as_str()).is_some());

        let training = executor.run(request(Phase::Training)).await.unwrap();
        assert!(check_training_gate(&training, &TrainingGateConfig::default()).passed);

        let backtest = executor.run(request(Phase::Backtesting)).await.unwrap();
        assert!(check_backtest_gate(&backtest, &BacktestGateConfig::default()).passed);
    }

    #[tokio::test]
    async fn test_failing_executor() {
        let executor = SimulatedExecutor::new(Duration::ZERO).failing("worker crashed");
        let err = executor.run(request(Phase::Training)).await.unwrap_err();
        assert_eq!(err, PhaseError::Failed("worker crashed".into()));
    }
}
