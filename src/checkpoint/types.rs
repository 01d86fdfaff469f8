//! 检查点类型
//!
//! 检查点是研究周期阶段状态的快照（不是活记录），只在 FAILED / CANCELLED 时创建，完成时删除。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::operations::{OperationId, ParameterMap};

/// 检查点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    Failure,
    Cancellation,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Failure => "failure",
            CheckpointKind::Cancellation => "cancellation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "failure" => Some(CheckpointKind::Failure),
            "cancellation" => Some(CheckpointKind::Cancellation),
            _ => None,
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 累计 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenCounts {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// 阶段状态快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub phase: String,
    pub strategy_name: Option<String>,
    pub strategy_path: Option<String>,
    pub design_operation_id: Option<OperationId>,
    pub training_operation_id: Option<OperationId>,
    pub backtest_operation_id: Option<OperationId>,
    pub assessment_operation_id: Option<OperationId>,
    #[serde(default)]
    pub token_counts: TokenCounts,
    /// 恢复时原样并回元数据，只填补缺失键，不覆盖较新的值
    #[serde(default)]
    pub original_request: ParameterMap,
}

/// 已持久化的检查点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub operation_id: OperationId,
    pub kind: CheckpointKind,
    pub state: CheckpointState,
    /// 毫秒时间戳
    pub created_at: i64,
}
