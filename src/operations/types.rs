//! 操作记录类型定义
//!
//! 研究周期（RESEARCH）与各阶段子任务（DESIGN / TRAINING / BACKTEST / ASSESSMENT）共用同一种记录。

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 操作 ID（`op_` 前缀 + UUID）
pub type OperationId = String;

/// 元数据参数与结果共用的字符串键映射
pub type ParameterMap = Map<String, Value>;

/// 操作类型：RESEARCH 为父工作流，其余为子任务
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Research,
    Design,
    Training,
    Backtest,
    Assessment,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Research => "RESEARCH",
            OperationKind::Design => "DESIGN",
            OperationKind::Training => "TRAINING",
            OperationKind::Backtest => "BACKTEST",
            OperationKind::Assessment => "ASSESSMENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RESEARCH" => Some(OperationKind::Research),
            "DESIGN" => Some(OperationKind::Design),
            "TRAINING" => Some(OperationKind::Training),
            "BACKTEST" => Some(OperationKind::Backtest),
            "ASSESSMENT" => Some(OperationKind::Assessment),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 操作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// 已创建，等待协调器接手
    Pending,
    /// 正在执行
    Running,
    /// 恢复中（瞬时锁，防止同一工作流被并发恢复）
    Resuming,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    /// 活跃状态：计入容量、由协调器推进
    pub const ACTIVE: [OperationStatus; 3] = [
        OperationStatus::Running,
        OperationStatus::Resuming,
        OperationStatus::Pending,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "PENDING",
            OperationStatus::Running => "RUNNING",
            OperationStatus::Resuming => "RESUMING",
            OperationStatus::Completed => "COMPLETED",
            OperationStatus::Failed => "FAILED",
            OperationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OperationStatus::Pending),
            "RUNNING" => Some(OperationStatus::Running),
            "RESUMING" => Some(OperationStatus::Resuming),
            "COMPLETED" => Some(OperationStatus::Completed),
            "FAILED" => Some(OperationStatus::Failed),
            "CANCELLED" => Some(OperationStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 进度遥测（只写，不参与控制流）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// 0-100
    pub percentage: f64,
    pub current_step: Option<String>,
    pub steps_completed: u32,
    pub steps_total: u32,
}

impl Progress {
    pub fn new(percentage: f64, step: impl Into<String>) -> Self {
        Self {
            percentage: percentage.clamp(0.0, 100.0),
            current_step: Some(step.into()),
            steps_completed: 0,
            steps_total: 0,
        }
    }

    pub fn with_steps(mut self, completed: u32, total: u32) -> Self {
        self.steps_completed = completed;
        self.steps_total = total;
        self
    }
}

/// 操作元数据：`parameters` 是工作流的可变草稿区
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetadata {
    #[serde(default)]
    pub parameters: ParameterMap,
}

impl OperationMetadata {
    pub fn with_parameters(parameters: ParameterMap) -> Self {
        Self { parameters }
    }
}

/// 操作记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    /// 仅子任务设置；父任务只记录子任务 ID，不持有子任务
    pub parent_id: Option<OperationId>,
    pub metadata: OperationMetadata,
    pub progress: Progress,
    /// 完成时写入一次
    pub result_summary: Option<ParameterMap>,
    pub error: Option<String>,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl OperationRecord {
    pub fn new(kind: OperationKind, metadata: OperationMetadata, parent_id: Option<OperationId>) -> Self {
        Self {
            id: format!("op_{}", uuid::Uuid::new_v4().simple()),
            kind,
            status: OperationStatus::Pending,
            parent_id,
            metadata,
            progress: Progress::default(),
            result_summary: None,
            error: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// 持续时间总是从 created_at 起算，包含排队时间
    pub fn duration_ms(&self, now_ms: i64) -> i64 {
        let end = self.completed_at.unwrap_or(now_ms);
        (end - self.created_at).max(0)
    }
}

/// 列表查询过滤条件
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub kind: Option<OperationKind>,
    /// 为空表示不过滤状态
    pub statuses: Vec<OperationStatus>,
    pub parent_id: Option<OperationId>,
    pub limit: Option<usize>,
}

impl OperationFilter {
    /// 所有活跃的研究周期（RUNNING / RESUMING / PENDING）
    pub fn active_research() -> Self {
        Self {
            kind: Some(OperationKind::Research),
            statuses: OperationStatus::ACTIVE.to_vec(),
            parent_id: None,
            limit: None,
        }
    }

    pub fn research() -> Self {
        Self {
            kind: Some(OperationKind::Research),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &OperationRecord) -> bool {
        if let Some(kind) = self.kind {
            if record.kind != kind {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if let Some(parent) = &self.parent_id {
            if record.parent_id.as_ref() != Some(parent) {
                return false;
            }
        }
        true
    }
}

/// 列表查询结果：(items, total, active_count)
#[derive(Debug, Clone, Default)]
pub struct OperationList {
    pub items: Vec<OperationRecord>,
    /// 过滤后的总数（截断前）
    pub total: usize,
    /// 过滤结果中非终态记录数
    pub active_count: usize,
}
