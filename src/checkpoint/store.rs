//! 检查点存储抽象与内存实现

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::checkpoint::types::*;

/// 检查点存储错误
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// 检查点存储：每个操作最多一个检查点，保存即覆盖
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save_checkpoint(
        &self,
        operation_id: &str,
        kind: CheckpointKind,
        state: &CheckpointState,
    ) -> Result<(), CheckpointError>;

    async fn load_checkpoint(&self, operation_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// 返回是否删除了已存在的检查点；不存在时不报错
    async fn delete_checkpoint(&self, operation_id: &str) -> Result<bool, CheckpointError>;
}

/// 内存检查点存储（测试与无持久化运行）
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save_checkpoint(
        &self,
        operation_id: &str,
        kind: CheckpointKind,
        state: &CheckpointState,
    ) -> Result<(), CheckpointError> {
        let checkpoint = Checkpoint {
            operation_id: operation_id.to_string(),
            kind,
            state: state.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        self.checkpoints
            .write()
            .await
            .insert(operation_id.to_string(), checkpoint);
        Ok(())
    }

    async fn load_checkpoint(&self, operation_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.read().await.get(operation_id).cloned())
    }

    async fn delete_checkpoint(&self, operation_id: &str) -> Result<bool, CheckpointError> {
        Ok(self.checkpoints.write().await.remove(operation_id).is_some())
    }
}
