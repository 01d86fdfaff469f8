//! 阶段执行器抽象
//!
//! 设计 / 训练 / 回测 / 评估各自是不透明的异步工作单元：返回结果映射或错误。
//! 取消通过丢弃执行器所在任务的 future 传递，执行器无需自行轮询取消令牌。

use async_trait::async_trait;
use thiserror::Error;

use crate::core::Phase;
use crate::operations::{OperationId, ParameterMap};

/// 阶段执行错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PhaseError {
    #[error("Phase execution failed: {0}")]
    Failed(String),

    #[error("Phase execution cancelled")]
    Cancelled,
}

/// 传给执行器的阶段参数
#[derive(Debug, Clone)]
pub struct PhaseRequest {
    pub parent_operation_id: OperationId,
    /// 本阶段子任务 ID
    pub operation_id: OperationId,
    pub phase: Phase,
    pub model: String,
    pub brief: Option<String>,
    pub strategy_name: Option<String>,
    pub strategy_path: Option<String>,
    pub training_result: Option<ParameterMap>,
    pub backtest_result: Option<ParameterMap>,
}

/// 阶段执行器
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn run(&self, request: PhaseRequest) -> Result<ParameterMap, PhaseError>;
}
