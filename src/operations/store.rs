//! 操作存储抽象
//!
//! 操作存储是记录状态的唯一事实来源与唯一修改者；协调器每个 tick 都重新读取，不跨 tick 持锁。

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::operations::types::*;

/// 操作存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Operation not found: {0}")]
    NotFound(OperationId),

    #[error("Operation already finished: {0}")]
    Finished(OperationId),

    #[error("Operation store unavailable: {0}")]
    Unavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// 操作存储：创建、读取、状态迁移、进度与元数据更新
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// 创建一条 PENDING 记录
    async fn create_operation(
        &self,
        kind: OperationKind,
        metadata: OperationMetadata,
        parent_id: Option<OperationId>,
    ) -> Result<OperationRecord, StoreError>;

    async fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>, StoreError>;

    /// 标记 RUNNING 并登记取消令牌；`cancel_operation` 会触发该令牌
    async fn start_operation(&self, id: &str, token: CancellationToken) -> Result<(), StoreError>;

    /// 终态迁移：对已终态记录为 no-op，返回 false
    async fn complete_operation(&self, id: &str, result: ParameterMap) -> Result<bool, StoreError>;

    async fn fail_operation(&self, id: &str, error: &str) -> Result<bool, StoreError>;

    async fn cancel_operation(&self, id: &str, reason: &str) -> Result<bool, StoreError>;

    async fn update_progress(&self, id: &str, progress: Progress) -> Result<(), StoreError>;

    /// 整体替换 `metadata.parameters`；记录已终态时返回 `StoreError::Finished`
    async fn update_parameters(&self, id: &str, parameters: ParameterMap) -> Result<(), StoreError>;

    /// 比较并设置：当前状态在 `from` 中时迁移到 `to`，返回是否迁移成功
    async fn transition_status(
        &self,
        id: &str,
        from: &[OperationStatus],
        to: OperationStatus,
    ) -> Result<bool, StoreError>;

    async fn list_operations(&self, filter: &OperationFilter) -> Result<OperationList, StoreError>;
}
