//! 研究服务构建器：统一的组装逻辑
//!
//! 二进制与测试共用同一套组装：配置 -> 存储 -> 准入 -> 阶段状态机 -> 协调器 -> 服务。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::admission::{
    AdmissionController, BudgetTracker, InMemoryBudgetTracker, StaticWorkerRegistry, WorkerRegistry,
};
use crate::checkpoint::{
    CheckpointError, CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore,
};
use crate::config::AppConfig;
use crate::core::{CheckpointAdapter, Coordinator, PhaseMachine, ResearchService};
use crate::executors::PhaseExecutors;
use crate::operations::{InMemoryOperationStore, OperationStore};

/// 构建失败
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("Failed to open checkpoint store: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[cfg(feature = "async-sqlite")]
    #[error("Failed to open operation store: {0}")]
    Sqlite(#[from] sqlx::Error),
}

#[cfg(feature = "async-sqlite")]
async fn open_persistent_store(path: &Path) -> Result<Arc<dyn OperationStore>, BuildError> {
    let store = InMemoryOperationStore::with_persistence(path).await?;
    tracing::info!(path = %path.display(), "Operation store persisted to SQLite");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "async-sqlite"))]
async fn open_persistent_store(path: &Path) -> Result<Arc<dyn OperationStore>, BuildError> {
    tracing::warn!(
        path = %path.display(),
        "operations_db set but async-sqlite feature is disabled, using in-memory store"
    );
    Ok(Arc::new(InMemoryOperationStore::new()))
}

/// 研究服务构建器；未显式设置的组件按配置创建
pub struct ResearchServiceBuilder {
    config: AppConfig,
    executors: Option<PhaseExecutors>,
    store: Option<Arc<dyn OperationStore>>,
    checkpoints: Option<Option<Arc<dyn CheckpointStore>>>,
    budget: Option<Arc<dyn BudgetTracker>>,
    workers: Option<Arc<dyn WorkerRegistry>>,
    poll_interval: Option<Duration>,
}

impl ResearchServiceBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            executors: None,
            store: None,
            checkpoints: None,
            budget: None,
            workers: None,
            poll_interval: None,
        }
    }

    pub fn with_executors(mut self, executors: PhaseExecutors) -> Self {
        self.executors = Some(executors);
        self
    }

    pub fn with_operation_store(mut self, store: Arc<dyn OperationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// None 表示检查点存储不可用（保存与加载均为空操作）
    pub fn with_checkpoint_store(mut self, store: Option<Arc<dyn CheckpointStore>>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_budget(mut self, budget: Arc<dyn BudgetTracker>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_workers(mut self, workers: Arc<dyn WorkerRegistry>) -> Self {
        self.workers = Some(workers);
        self
    }

    /// 覆盖配置中的轮询间隔（不做钳制，测试用）
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    async fn build_operation_store(&self) -> Result<Arc<dyn OperationStore>, BuildError> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        match &self.config.storage.operations_db {
            Some(path) => open_persistent_store(path).await,
            None => Ok(Arc::new(InMemoryOperationStore::new())),
        }
    }

    fn build_checkpoint_store(&self) -> Result<Option<Arc<dyn CheckpointStore>>, BuildError> {
        if let Some(store) = &self.checkpoints {
            return Ok(store.clone());
        }
        let store: Arc<dyn CheckpointStore> = match &self.config.storage.checkpoint_db {
            Some(path) => Arc::new(SqliteCheckpointStore::open(path)?),
            None => Arc::new(InMemoryCheckpointStore::new()),
        };
        Ok(Some(store))
    }

    pub async fn build(self) -> Result<ResearchService, BuildError> {
        let store = self.build_operation_store().await?;
        let checkpoint_store = self.build_checkpoint_store()?;
        let checkpoints = Arc::new(CheckpointAdapter::new(Arc::clone(&store), checkpoint_store));

        let budget: Arc<dyn BudgetTracker> = match &self.budget {
            Some(b) => Arc::clone(b),
            None => Arc::new(InMemoryBudgetTracker::new(self.config.budget.limit_usd)),
        };
        let workers: Arc<dyn WorkerRegistry> = match &self.workers {
            Some(w) => Arc::clone(w),
            None => Arc::new(StaticWorkerRegistry::new(
                self.config.admission.training_workers,
                self.config.admission.backtest_workers,
            )),
        };
        let admission = AdmissionController::new(
            Arc::clone(&budget),
            workers,
            self.config.admission.capacity_policy(),
        );

        let executors = self
            .executors
            .clone()
            .unwrap_or_else(|| PhaseExecutors::simulated(Duration::from_millis(200)));
        let machine = PhaseMachine::new(
            Arc::clone(&store),
            executors,
            Arc::clone(&checkpoints),
            budget,
            self.config.gates.clone(),
            self.config.research.default_model.clone(),
        );

        let poll_interval = self
            .poll_interval
            .unwrap_or_else(|| self.config.coordinator.poll_interval());
        let coordinator = Coordinator::new(
            Arc::clone(&store),
            machine,
            Arc::clone(&checkpoints),
            poll_interval,
        );

        Ok(ResearchService::new(
            store,
            admission,
            checkpoints,
            coordinator,
            self.config.research.default_model.clone(),
        ))
    }
}
