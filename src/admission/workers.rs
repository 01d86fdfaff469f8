//! 工作节点注册表（仅用于容量计算）

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    Training,
    Backtesting,
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerType::Training => f.write_str("training"),
            WorkerType::Backtesting => f.write_str("backtesting"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerHandle {
    pub id: String,
    pub worker_type: WorkerType,
    pub endpoint: Option<String>,
}

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn list_workers(&self, worker_type: WorkerType) -> Vec<WorkerHandle>;
}

/// 静态注册表：启动时按配置数量生成，或运行时手动注册 / 注销
#[derive(Debug, Default)]
pub struct StaticWorkerRegistry {
    workers: RwLock<Vec<WorkerHandle>>,
}

impl StaticWorkerRegistry {
    /// 按数量生成训练 / 回测节点
    pub fn new(training: usize, backtesting: usize) -> Self {
        let mut workers = Vec::with_capacity(training + backtesting);
        for i in 0..training {
            workers.push(WorkerHandle {
                id: format!("training-{i}"),
                worker_type: WorkerType::Training,
                endpoint: None,
            });
        }
        for i in 0..backtesting {
            workers.push(WorkerHandle {
                id: format!("backtesting-{i}"),
                worker_type: WorkerType::Backtesting,
                endpoint: None,
            });
        }
        Self {
            workers: RwLock::new(workers),
        }
    }

    /// 注册节点；同 ID 的旧记录被替换
    pub async fn register(&self, handle: WorkerHandle) {
        let mut workers = self.workers.write().await;
        workers.retain(|w| w.id != handle.id);
        workers.push(handle);
    }

    /// 注销节点，返回是否存在
    pub async fn unregister(&self, id: &str) -> bool {
        let mut workers = self.workers.write().await;
        let before = workers.len();
        workers.retain(|w| w.id != id);
        workers.len() != before
    }
}

#[async_trait]
impl WorkerRegistry for StaticWorkerRegistry {
    async fn list_workers(&self, worker_type: WorkerType) -> Vec<WorkerHandle> {
        self.workers
            .read()
            .await
            .iter()
            .filter(|w| w.worker_type == worker_type)
            .cloned()
            .collect()
    }
}
