//! 研究服务门面：trigger / cancel / resume / status
//!
//! 所有调用返回结构化的 `{success, reason, message}` 响应而不是错误；
//! 只有存储层故障以 `ResearchError` 形式向上传播。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::admission::{
    AdmissionController, AdmissionDecision, AdmissionRejection, BudgetStatus, CapacityStatus,
};
use crate::checkpoint::CheckpointKind;
use crate::core::state::keys;
use crate::core::{CheckpointAdapter, Coordinator, Phase, ResearchError, ResearchState};
use crate::operations::{
    OperationFilter, OperationKind, OperationMetadata, OperationRecord, OperationStatus,
    OperationStore, ParameterMap,
};

/// trigger 参数
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    /// 为空时使用配置中的默认模型
    pub model: Option<String>,
    pub brief: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerResponse {
    pub triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_cancelled: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CancelResponse {
    fn rejected(reason: &str, message: String) -> Self {
        Self {
            success: false,
            child_cancelled: None,
            reason: Some(reason.to_string()),
            message: Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_from_phase: Option<String>,
    /// 合并后仍记录在元数据中的子任务 ID
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recovered_child_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResumeResponse {
    fn rejected(reason: &str, message: String) -> Self {
        Self {
            success: false,
            resumed_from_phase: None,
            recovered_child_ids: Vec::new(),
            reason: Some(reason.to_string()),
            message: Some(message),
        }
    }
}

/// 单个活跃研究周期的状态
#[derive(Debug, Clone, Serialize)]
pub struct ActiveResearch {
    pub operation_id: String,
    pub phase: String,
    pub status: OperationStatus,
    pub progress: f64,
    pub current_step: Option<String>,
    pub child_operation_id: Option<String>,
    pub strategy_name: Option<String>,
    pub age_seconds: f64,
}

/// 最近一次结束的研究周期
#[derive(Debug, Clone, Serialize)]
pub struct LastCycle {
    pub operation_id: String,
    pub status: OperationStatus,
    pub phase: String,
    pub strategy_name: Option<String>,
    pub error: Option<String>,
    pub result: Option<ParameterMap>,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub active: Vec<ActiveResearch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle: Option<LastCycle>,
    pub budget: BudgetStatus,
    pub capacity: CapacityStatus,
    pub coordinator_running: bool,
}

/// 研究服务门面，持有协调器并对外提供 trigger / cancel / resume / status
pub struct ResearchService {
    store: Arc<dyn OperationStore>,
    admission: AdmissionController,
    checkpoints: Arc<CheckpointAdapter>,
    coordinator: Coordinator,
    default_model: String,
    /// 串行化准入检查与记录创建，并发 trigger 不会超出容量
    trigger_lock: Mutex<()>,
    /// 串行化 resume，配合 RESUMING 状态防止重复恢复
    resume_lock: Mutex<()>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn phase_of(record: &OperationRecord) -> String {
    record
        .metadata
        .parameters
        .get(keys::PHASE)
        .and_then(|v| v.as_str())
        .unwrap_or("idle")
        .to_string()
}

impl ResearchService {
    pub fn new(
        store: Arc<dyn OperationStore>,
        admission: AdmissionController,
        checkpoints: Arc<CheckpointAdapter>,
        coordinator: Coordinator,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            admission,
            checkpoints,
            coordinator,
            default_model: default_model.into(),
            trigger_lock: Mutex::new(()),
            resume_lock: Mutex::new(()),
        }
    }

    /// 底层操作存储
    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    /// 协调器句柄
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// 启动时扫描：存在活跃研究周期（如从持久化存储恢复）则启动协调器
    pub async fn start(&self) -> Result<usize, ResearchError> {
        let active = self
            .store
            .list_operations(&OperationFilter::active_research())
            .await?;
        if active.total > 0 {
            tracing::info!(active = active.total, "Resuming active research on startup");
            self.coordinator.ensure_running().await;
        }
        Ok(active.total)
    }

    /// 停止协调器；活跃研究周期保存 cancellation 检查点
    pub async fn shutdown(&self) {
        self.coordinator.stop().await;
    }

    /// 发起一个研究周期：先准入（预算，再容量），通过后才创建记录
    pub async fn trigger(&self, options: TriggerOptions) -> Result<TriggerResponse, ResearchError> {
        let guard = self.trigger_lock.lock().await;
        let decision = self.admission.check(self.store.as_ref()).await?;
        let (active_count, limit) = match decision {
            AdmissionDecision::Rejected(rejection) => {
                tracing::info!(reason = rejection.reason(), "Research trigger rejected: {}", rejection.message());
                let (active_count, limit) = match &rejection {
                    AdmissionRejection::AtCapacity { active_count, limit } => {
                        (Some(*active_count), Some(*limit))
                    }
                    _ => (None, None),
                };
                return Ok(TriggerResponse {
                    triggered: false,
                    operation_id: None,
                    reason: Some(rejection.reason().to_string()),
                    message: Some(rejection.message()),
                    active_count,
                    limit,
                });
            }
            AdmissionDecision::Admitted { active_count, limit } => (active_count, limit),
        };

        let model = options
            .model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.default_model.clone());
        let state = ResearchState::new(model.clone(), options.brief);
        let record = self
            .store
            .create_operation(
                OperationKind::Research,
                OperationMetadata::with_parameters(state.to_parameters()),
                None,
            )
            .await?;
        drop(guard);

        tracing::info!(operation_id = %record.id, model = %model, "Research cycle triggered");
        self.coordinator.ensure_running().await;

        Ok(TriggerResponse {
            triggered: true,
            operation_id: Some(record.id),
            reason: None,
            message: Some(format!("Research cycle started with model {model}")),
            active_count: Some(active_count + 1),
            limit: Some(limit),
        })
    }

    /// 取消：先取消父记录，再直接取消当前阶段的子任务
    pub async fn cancel(&self, operation_id: &str) -> Result<CancelResponse, ResearchError> {
        let record = match self.store.get_operation(operation_id).await? {
            Some(r) => r,
            None => {
                return Ok(CancelResponse::rejected(
                    "not_found",
                    format!("Operation {operation_id} not found"),
                ))
            }
        };
        if record.kind != OperationKind::Research {
            return Ok(CancelResponse::rejected(
                "not_research",
                format!("Operation {operation_id} is a {} operation", record.kind),
            ));
        }
        if !matches!(record.status, OperationStatus::Running | OperationStatus::Pending) {
            return Ok(CancelResponse::rejected(
                "not_cancellable",
                format!("Operation {operation_id} is {}", record.status.as_str()),
            ));
        }

        let cancelled = self
            .store
            .cancel_operation(operation_id, "cancelled by user")
            .await?;
        if !cancelled {
            return Ok(CancelResponse::rejected(
                "not_cancellable",
                format!("Operation {operation_id} already finished"),
            ));
        }

        // 取消前读到的记录可能已过时（协调器正切换阶段），以取消后的元数据为准
        let latest = match self.store.get_operation(operation_id).await? {
            Some(r) => r,
            None => record,
        };
        let mut child_cancelled = None;
        if let Ok(state) = ResearchState::from_parameters(&latest.metadata.parameters) {
            for child_id in state.child_ids().into_values() {
                match self.store.cancel_operation(&child_id, "parent research cancelled").await {
                    Ok(true) => child_cancelled = Some(child_id),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(child_id = %child_id, "Failed to cancel child operation: {}", e),
                }
            }
        }

        self.checkpoints
            .save_checkpoint(operation_id, CheckpointKind::Cancellation)
            .await;
        tracing::info!(
            operation_id,
            child_cancelled = ?child_cancelled,
            "Research cycle cancelled"
        );

        Ok(CancelResponse {
            success: true,
            child_cancelled,
            reason: None,
            message: Some(format!("Research {operation_id} cancelled")),
        })
    }

    /// 从检查点恢复一个已失败 / 已取消的研究周期
    pub async fn resume(&self, operation_id: &str) -> Result<ResumeResponse, ResearchError> {
        let _guard = self.resume_lock.lock().await;

        let record = match self.store.get_operation(operation_id).await? {
            Some(r) if r.kind == OperationKind::Research => r,
            _ => {
                return Ok(ResumeResponse::rejected(
                    "not_found",
                    format!("Research {operation_id} not found"),
                ))
            }
        };
        if !matches!(
            record.status,
            OperationStatus::Cancelled | OperationStatus::Failed | OperationStatus::Resuming
        ) {
            return Ok(ResumeResponse::rejected(
                "not_resumable",
                format!("Research {operation_id} is {}", record.status.as_str()),
            ));
        }

        let active = self
            .store
            .list_operations(&OperationFilter::active_research())
            .await?;
        if let Some(other) = active.items.iter().find(|r| r.id != operation_id) {
            return Ok(ResumeResponse::rejected(
                "active_cycle_exists",
                format!("Research {} is still active", other.id),
            ));
        }

        let checkpoint = match self.checkpoints.load_checkpoint(operation_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                return Ok(ResumeResponse::rejected(
                    "no_checkpoint",
                    format!("No checkpoint for research {operation_id}"),
                ))
            }
            Err(e) => {
                tracing::warn!(operation_id, "Failed to load checkpoint: {}", e);
                return Ok(ResumeResponse::rejected("no_checkpoint", e.to_string()));
            }
        };

        let locked = self
            .store
            .transition_status(
                operation_id,
                &[OperationStatus::Cancelled, OperationStatus::Failed, OperationStatus::Resuming],
                OperationStatus::Resuming,
            )
            .await?;
        if !locked {
            return Ok(ResumeResponse::rejected(
                "not_resumable",
                format!("Research {operation_id} changed state during resume"),
            ));
        }

        let merged = CheckpointAdapter::merge(&record.metadata.parameters, &checkpoint.state);
        let mut state = match ResearchState::from_parameters(&merged) {
            Ok(s) => s,
            Err(e) => {
                self.store
                    .transition_status(operation_id, &[OperationStatus::Resuming], record.status)
                    .await?;
                return Ok(ResumeResponse::rejected("invalid_checkpoint", e.to_string()));
            }
        };

        // 当前阶段的子任务：仍在运行则继续等待；取消前已完成则下个 tick 收割（token 不重复计入）；
        // 研究周期失败时（闸门未通过或子任务失败）清除，重跑该阶段
        if let Some(child_id) = state.active_child().cloned() {
            let keep = match self.store.get_operation(&child_id).await? {
                Some(child) if child.status.is_active() => true,
                Some(child) => {
                    child.status == OperationStatus::Completed
                        && checkpoint.kind != CheckpointKind::Failure
                }
                None => false,
            };
            if !keep {
                state.clear_op_id(state.phase);
                state.phase_start_time = None;
                tracing::info!(operation_id, child_id = %child_id, phase = %state.phase, "Restarting phase on resume");
            }
        }

        let recovered_child_ids: Vec<String> = state.child_ids().into_values().collect();
        self.store
            .update_parameters(operation_id, state.to_parameters())
            .await?;
        self.store
            .transition_status(operation_id, &[OperationStatus::Resuming], OperationStatus::Running)
            .await?;
        self.coordinator.ensure_running().await;

        tracing::info!(
            operation_id,
            phase = %state.phase,
            checkpoint = %checkpoint.kind,
            "Research cycle resumed"
        );

        Ok(ResumeResponse {
            success: true,
            resumed_from_phase: Some(state.phase.as_str().to_string()),
            recovered_child_ids,
            reason: None,
            message: Some(format!("Resumed from {} checkpoint", checkpoint.kind)),
        })
    }

    /// 活跃研究周期、最近一次结束的周期、预算与容量
    pub async fn status(&self) -> Result<StatusResponse, ResearchError> {
        let now = now_ms();
        let researches = self.store.list_operations(&OperationFilter::research()).await?;

        let active: Vec<ActiveResearch> = researches
            .items
            .iter()
            .filter(|r| r.status.is_active())
            .map(|r| {
                let state = ResearchState::from_parameters(&r.metadata.parameters).ok();
                ActiveResearch {
                    operation_id: r.id.clone(),
                    phase: phase_of(r),
                    status: r.status,
                    progress: r.progress.percentage,
                    current_step: r.progress.current_step.clone(),
                    child_operation_id: state.as_ref().and_then(|s| s.active_child().cloned()),
                    strategy_name: state.and_then(|s| s.strategy_name),
                    age_seconds: r.duration_ms(now) as f64 / 1000.0,
                }
            })
            .collect();

        let last_cycle = if active.is_empty() {
            researches
                .items
                .iter()
                .filter(|r| r.is_finished())
                .max_by_key(|r| r.completed_at.unwrap_or(r.created_at))
                .map(|r| LastCycle {
                    operation_id: r.id.clone(),
                    status: r.status,
                    phase: phase_of(r),
                    strategy_name: r
                        .metadata
                        .parameters
                        .get(keys::STRATEGY_NAME)
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    error: r.error.clone(),
                    result: r.result_summary.clone(),
                    duration_seconds: r.duration_ms(now) as f64 / 1000.0,
                })
        } else {
            None
        };

        Ok(StatusResponse {
            active,
            last_cycle,
            budget: self.admission.budget().status().await,
            capacity: self.admission.capacity_status(self.store.as_ref()).await?,
            coordinator_running: self.coordinator.is_running().await,
        })
    }

    /// 当前阶段（测试与状态展示用）
    pub async fn phase(&self, operation_id: &str) -> Result<Option<Phase>, ResearchError> {
        let record = self.store.get_operation(operation_id).await?;
        Ok(record
            .and_then(|r| ResearchState::from_parameters(&r.metadata.parameters).ok())
            .map(|s| s.phase))
    }
}
