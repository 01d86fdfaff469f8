//! 准入控制：预算与容量
//!
//! 在创建任何研究记录之前执行；预算检查严格先于容量检查。
//! 拒绝是普通返回值（AdmissionDecision），不是错误。

pub mod budget;
pub mod workers;

use std::sync::Arc;

use serde::Serialize;

pub use budget::{BudgetCheck, BudgetStatus, BudgetTracker, InMemoryBudgetTracker};
pub use workers::{StaticWorkerRegistry, WorkerHandle, WorkerRegistry, WorkerType};

use crate::operations::{OperationFilter, OperationStore, StoreError};

/// 并发上限策略：显式覆盖值，否则 训练节点数 + 回测节点数 + 缓冲，下限为 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityPolicy {
    pub override_limit: Option<usize>,
    pub buffer: usize,
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            override_limit: None,
            buffer: 1,
        }
    }
}

impl CapacityPolicy {
    /// 并发上限：配置覆盖优先，否则为节点数 + 缓冲，至少为 1
    pub fn limit(&self, training_workers: usize, backtest_workers: usize) -> usize {
        self.override_limit
            .unwrap_or(training_workers + backtest_workers + self.buffer)
            .max(1)
    }
}

/// 拒绝原因
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionRejection {
    BudgetExhausted { message: String },
    AtCapacity { active_count: usize, limit: usize },
}

impl AdmissionRejection {
    /// 机器可读的拒绝原因
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionRejection::BudgetExhausted { .. } => "budget_exhausted",
            AdmissionRejection::AtCapacity { .. } => "at_capacity",
        }
    }

    /// 面向用户的说明
    pub fn message(&self) -> String {
        match self {
            AdmissionRejection::BudgetExhausted { message } => message.clone(),
            AdmissionRejection::AtCapacity {
                active_count,
                limit,
            } => format!("{active_count} research cycles active (limit {limit})"),
        }
    }
}

/// 准入判定结果
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Admitted { active_count: usize, limit: usize },
    Rejected(AdmissionRejection),
}

impl AdmissionDecision {
    /// 是否准入
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted { .. })
    }
}

/// 纯判定：预算优先，其次容量（active_count >= limit 时拒绝）
pub fn evaluate_admission(budget: &BudgetCheck, active_count: usize, limit: usize) -> AdmissionDecision {
    if !budget.allowed {
        return AdmissionDecision::Rejected(AdmissionRejection::BudgetExhausted {
            message: budget.reason.clone(),
        });
    }
    if active_count >= limit {
        return AdmissionDecision::Rejected(AdmissionRejection::AtCapacity {
            active_count,
            limit,
        });
    }
    AdmissionDecision::Admitted {
        active_count,
        limit,
    }
}

/// 容量快照（status 展示用）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityStatus {
    pub active_count: usize,
    pub limit: usize,
    pub training_workers: usize,
    pub backtest_workers: usize,
}

/// 准入控制器：组合预算追踪、节点注册表与容量策略
pub struct AdmissionController {
    budget: Arc<dyn BudgetTracker>,
    workers: Arc<dyn WorkerRegistry>,
    policy: CapacityPolicy,
}

impl AdmissionController {
    pub fn new(
        budget: Arc<dyn BudgetTracker>,
        workers: Arc<dyn WorkerRegistry>,
        policy: CapacityPolicy,
    ) -> Self {
        Self {
            budget,
            workers,
            policy,
        }
    }

    /// 预算追踪器（执行器任务记录花费、status 展示余额）
    pub fn budget(&self) -> &Arc<dyn BudgetTracker> {
        &self.budget
    }

    async fn worker_counts(&self) -> (usize, usize) {
        let training = self.workers.list_workers(WorkerType::Training).await.len();
        let backtest = self.workers.list_workers(WorkerType::Backtesting).await.len();
        (training, backtest)
    }

    /// 按当前注册节点计算的并发上限
    pub async fn capacity_limit(&self) -> usize {
        let (training, backtest) = self.worker_counts().await;
        self.policy.limit(training, backtest)
    }

    /// 当前活跃数与上限
    pub async fn capacity_status(&self, store: &dyn OperationStore) -> Result<CapacityStatus, StoreError> {
        let (training, backtest) = self.worker_counts().await;
        let active = store
            .list_operations(&OperationFilter::active_research())
            .await?;
        Ok(CapacityStatus {
            active_count: active.total,
            limit: self.policy.limit(training, backtest),
            training_workers: training,
            backtest_workers: backtest,
        })
    }

    /// 预算不足时不查询存储
    pub async fn check(&self, store: &dyn OperationStore) -> Result<AdmissionDecision, StoreError> {
        let budget = self.budget.can_spend().await;
        if !budget.allowed {
            return Ok(evaluate_admission(&budget, 0, 0));
        }
        let capacity = self.capacity_status(store).await?;
        Ok(evaluate_admission(&budget, capacity.active_count, capacity.limit))
    }
}
