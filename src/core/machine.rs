//! 阶段状态机：每次调用把一个研究周期推进一步
//!
//! 每个工作阶段遵循同一约定：
//! 1. 没有子任务 -> 创建子任务、记录 `<phase>_op_id` 与 `phase_start_time`、后台启动执行器，立即返回
//! 2. 有子任务 -> 读取子任务记录：运行中则本 tick 无操作；完成则应用闸门、写入结果、前进阶段；
//!    失败 / 取消则返回错误，由协调器将父记录置为终态并保存检查点
//!
//! 闸门失败发生在下一阶段子任务创建之前，因此下一阶段的子任务 ID 不会出现在元数据中。

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::admission::BudgetTracker;
use crate::core::state::keys;
use crate::core::{CheckpointAdapter, Phase, ResearchError, ResearchState};
use crate::executors::{PhaseError, PhaseExecutors, PhaseRequest};
use crate::gates::{
    check_backtest_gate, check_training_gate, BacktestGateConfig, GateKind, TrainingGateConfig,
};
use crate::operations::{
    OperationKind, OperationMetadata, OperationRecord, OperationStatus, OperationStore,
    ParameterMap, Progress, StoreError,
};

/// 单步推进的结果
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// 记录已终态或正在恢复，不推进
    Skipped,
    /// 创建并启动了该阶段的子任务
    Started { phase: Phase, child_id: String },
    /// 子任务仍在运行
    Waiting { phase: Phase, child_id: String },
    /// 阶段闸门通过，进入下一阶段（并已启动其子任务）
    Advanced { from: Phase, to: Phase, child_id: String },
    /// 研究周期完成
    Completed,
}

/// 闸门阈值（对应配置中的 [gates] 段）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    pub training: TrainingGateConfig,
    pub backtest: BacktestGateConfig,
}

pub struct PhaseMachine {
    store: Arc<dyn OperationStore>,
    executors: PhaseExecutors,
    checkpoints: Arc<CheckpointAdapter>,
    budget: Arc<dyn BudgetTracker>,
    gates: GateSettings,
    default_model: String,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl PhaseMachine {
    pub fn new(
        store: Arc<dyn OperationStore>,
        executors: PhaseExecutors,
        checkpoints: Arc<CheckpointAdapter>,
        budget: Arc<dyn BudgetTracker>,
        gates: GateSettings,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            executors,
            checkpoints,
            budget,
            gates,
            default_model: default_model.into(),
        }
    }

    /// 推进一个研究周期一步；错误只属于该研究周期
    pub async fn advance(&self, research_id: &str) -> Result<AdvanceOutcome, ResearchError> {
        let record = self
            .store
            .get_operation(research_id)
            .await?
            .ok_or_else(|| ResearchError::NotFound(research_id.to_string()))?;

        if record.kind != OperationKind::Research {
            return Err(ResearchError::InvalidState(format!(
                "{} is a {} operation, not RESEARCH",
                record.id, record.kind
            )));
        }

        match record.status {
            s if s.is_terminal() => return Ok(AdvanceOutcome::Skipped),
            // 由 resume 持有，合并完检查点后才转为 RUNNING
            OperationStatus::Resuming => return Ok(AdvanceOutcome::Skipped),
            OperationStatus::Pending => {
                self.store
                    .start_operation(&record.id, CancellationToken::new())
                    .await?;
                tracing::info!(operation_id = %record.id, "Research cycle started");
            }
            _ => {}
        }

        let mut state = ResearchState::from_parameters(&record.metadata.parameters)?;
        match state.phase {
            Phase::Idle => {
                state.advance();
                let child_id = self.start_child(&record, &mut state).await?;
                Ok(AdvanceOutcome::Advanced {
                    from: Phase::Idle,
                    to: Phase::Designing,
                    child_id,
                })
            }
            // 完成标记已写入但记录未终态（上次在收尾中途中断）
            Phase::Completed => {
                self.finalize(&record, &mut state, ParameterMap::new()).await?;
                Ok(AdvanceOutcome::Completed)
            }
            phase => self.step_phase(&record, state, phase).await,
        }
    }

    async fn step_phase(
        &self,
        record: &OperationRecord,
        mut state: ResearchState,
        phase: Phase,
    ) -> Result<AdvanceOutcome, ResearchError> {
        let child_id = match state.op_id(phase) {
            Some(id) => id.clone(),
            None => {
                let child_id = self.start_child(record, &mut state).await?;
                return Ok(AdvanceOutcome::Started { phase, child_id });
            }
        };

        let child = self
            .store
            .get_operation(&child_id)
            .await?
            .ok_or_else(|| ResearchError::ChildFailed {
                phase,
                operation_id: child_id.clone(),
                message: "child operation record missing".to_string(),
            })?;

        match child.status {
            OperationStatus::Pending | OperationStatus::Running | OperationStatus::Resuming => {
                Ok(AdvanceOutcome::Waiting { phase, child_id })
            }
            OperationStatus::Failed => Err(ResearchError::ChildFailed {
                phase,
                operation_id: child_id,
                message: child.error.unwrap_or_else(|| "unknown error".to_string()),
            }),
            OperationStatus::Cancelled => Err(ResearchError::Cancelled(format!(
                "{phase} child operation {child_id} was cancelled"
            ))),
            OperationStatus::Completed => {
                let result = child.result_summary.unwrap_or_default();
                self.on_child_completed(record, state, phase, &child_id, result)
                    .await
            }
        }
    }

    async fn on_child_completed(
        &self,
        record: &OperationRecord,
        mut state: ResearchState,
        phase: Phase,
        child_id: &str,
        result: ParameterMap,
    ) -> Result<AdvanceOutcome, ResearchError> {
        if !state.add_tokens(child_id, &result) {
            tracing::debug!(operation_id = %record.id, child_id, "Child tokens already counted");
        }
        if let Some(start) = state.phase_start_time {
            tracing::info!(
                operation_id = %record.id,
                phase = %phase,
                duration_ms = now_ms() - start,
                "Phase finished"
            );
        }

        let gate = match phase {
            Phase::Training => Some((
                GateKind::Training,
                check_training_gate(&result, &self.gates.training),
            )),
            Phase::Backtesting => Some((
                GateKind::Backtest,
                check_backtest_gate(&result, &self.gates.backtest),
            )),
            _ => None,
        };
        if let Some((kind, verdict)) = gate {
            if let Some(err) = verdict.into_error(kind) {
                // 保留 token 用量供检查点记录；阶段与结果不变
                self.store
                    .update_parameters(&record.id, state.to_parameters())
                    .await?;
                tracing::warn!(
                    operation_id = %record.id,
                    gate = %kind,
                    reason = %err.message,
                    "Quality gate failed"
                );
                return Err(err.into());
            }
            tracing::info!(operation_id = %record.id, gate = %kind, "Quality gate passed");
        }

        match phase {
            Phase::Designing => {
                let name = result
                    .get(keys::STRATEGY_NAME)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| ResearchError::InvalidResult {
                        phase,
                        message: "missing strategy_name".to_string(),
                    })?;
                state.strategy_name = Some(name.to_string());
                state.strategy_path = result
                    .get(keys::STRATEGY_PATH)
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            Phase::Training => state.training_result = Some(result),
            Phase::Backtesting => state.backtest_result = Some(result),
            Phase::Assessing => {
                state.assessment_verdict = Some(
                    result
                        .get("verdict")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                );
                state.advance();
                self.finalize(record, &mut state, result).await?;
                return Ok(AdvanceOutcome::Completed);
            }
            _ => {}
        }

        let next = state.advance().ok_or_else(|| {
            ResearchError::InvalidState(format!("no phase after {phase}"))
        })?;
        let child_id = self.start_child(record, &mut state).await?;
        Ok(AdvanceOutcome::Advanced {
            from: phase,
            to: next,
            child_id,
        })
    }

    /// 为 state.phase 创建子任务并在后台运行执行器
    async fn start_child(
        &self,
        record: &OperationRecord,
        state: &mut ResearchState,
    ) -> Result<String, ResearchError> {
        let phase = state.phase;
        let kind = phase.child_kind().ok_or_else(|| {
            ResearchError::InvalidState(format!("phase {phase} has no child operation"))
        })?;
        let executor = self
            .executors
            .for_phase(phase)
            .cloned()
            .ok_or_else(|| ResearchError::InvalidState(format!("no executor for {phase}")))?;

        let mut child_params = ParameterMap::new();
        child_params.insert(keys::PHASE.into(), json!(phase.as_str()));
        if let Some(name) = &state.strategy_name {
            child_params.insert(keys::STRATEGY_NAME.into(), json!(name));
        }
        let child = self
            .store
            .create_operation(
                kind,
                OperationMetadata::with_parameters(child_params),
                Some(record.id.clone()),
            )
            .await?;

        state.set_op_id(phase, child.id.clone());
        state.phase_start_time = Some(now_ms());
        // 父记录在创建子任务期间被取消：撤销子任务，不启动执行器
        match self
            .store
            .update_parameters(&record.id, state.to_parameters())
            .await
        {
            Ok(()) => {}
            Err(StoreError::Finished(_)) => {
                self.store
                    .cancel_operation(&child.id, "parent research finished")
                    .await?;
                tracing::info!(
                    operation_id = %record.id,
                    child_id = %child.id,
                    phase = %phase,
                    "Parent finished before phase start, child cancelled"
                );
                return Err(ResearchError::Cancelled(format!(
                    "research finished before {phase} child started"
                )));
            }
            Err(e) => return Err(e.into()),
        }
        self.store
            .update_progress(
                &record.id,
                Progress::new(phase.progress_percent(), phase.step_label())
                    .with_steps(phase.step_index() - 1, 4),
            )
            .await?;

        let token = CancellationToken::new();
        self.store.start_operation(&child.id, token.clone()).await?;

        let request = PhaseRequest {
            parent_operation_id: record.id.clone(),
            operation_id: child.id.clone(),
            phase,
            model: state
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            brief: state.brief.clone(),
            strategy_name: state.strategy_name.clone(),
            strategy_path: state.strategy_path.clone(),
            training_result: state.training_result.clone(),
            backtest_result: state.backtest_result.clone(),
        };

        let store = Arc::clone(&self.store);
        let budget = Arc::clone(&self.budget);
        let child_id = child.id.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                res = executor.run(request) => Some(res),
            };

            let res = match outcome {
                None => {
                    tracing::info!(operation_id = %child_id, phase = %phase, "Phase executor cancelled");
                    return;
                }
                Some(Ok(result)) => {
                    let cost = result.get("cost_usd").and_then(Value::as_f64);
                    let completed = store.complete_operation(&child_id, result).await;
                    if let (Ok(true), Some(cost)) = (&completed, cost) {
                        budget.record_spend(cost, phase.as_str()).await;
                    }
                    completed
                }
                Some(Err(PhaseError::Cancelled)) => {
                    store
                        .cancel_operation(&child_id, "phase executor cancelled")
                        .await
                }
                Some(Err(PhaseError::Failed(message))) => {
                    tracing::warn!(operation_id = %child_id, phase = %phase, "Phase executor failed: {}", message);
                    store.fail_operation(&child_id, &message).await
                }
            };
            if let Err(e) = res {
                tracing::error!(operation_id = %child_id, "Failed to record phase outcome: {}", e);
            }
        });

        tracing::info!(
            operation_id = %record.id,
            child_id = %child.id,
            phase = %phase,
            "Phase started"
        );
        Ok(child.id)
    }

    /// 收尾：写入最终结果、标记 COMPLETED、删除检查点
    async fn finalize(
        &self,
        record: &OperationRecord,
        state: &mut ResearchState,
        assessment: ParameterMap,
    ) -> Result<(), ResearchError> {
        state.phase = Phase::Completed;
        state.phase_start_time = None;
        self.store
            .update_parameters(&record.id, state.to_parameters())
            .await?;

        let duration_ms = record.duration_ms(now_ms());
        let mut summary = ParameterMap::new();
        summary.insert("strategy_name".into(), json!(state.strategy_name));
        summary.insert("strategy_path".into(), json!(state.strategy_path));
        summary.insert("model".into(), json!(state.model));
        summary.insert("verdict".into(), json!(state.assessment_verdict));
        summary.insert(
            "training_result".into(),
            state.training_result.clone().map(Value::Object).unwrap_or(Value::Null),
        );
        summary.insert(
            "backtest_result".into(),
            state.backtest_result.clone().map(Value::Object).unwrap_or(Value::Null),
        );
        summary.insert("assessment".into(), Value::Object(assessment));
        summary.insert("input_tokens".into(), json!(state.tokens.input_tokens));
        summary.insert("output_tokens".into(), json!(state.tokens.output_tokens));
        summary.insert("total_tokens".into(), json!(state.tokens.total()));
        summary.insert("duration_seconds".into(), json!(duration_ms as f64 / 1000.0));

        self.store
            .update_progress(
                &record.id,
                Progress::new(Phase::Completed.progress_percent(), Phase::Completed.step_label())
                    .with_steps(4, 4),
            )
            .await?;
        self.store.complete_operation(&record.id, summary).await?;
        self.checkpoints.delete_checkpoint(&record.id).await;

        tracing::info!(
            operation_id = %record.id,
            strategy = ?state.strategy_name,
            verdict = ?state.assessment_verdict,
            duration_ms,
            "Research cycle completed"
        );
        Ok(())
    }
}
