//! 研究周期错误类型
//!
//! 单个研究周期的错误在协调器边界被转换为终态 + 检查点，不会影响同一 tick 中的其他研究周期：
//! - Cancelled -> CANCELLED + cancellation 检查点
//! - Gate / ChildFailed / InvalidResult / InvalidState -> FAILED + failure 检查点
//! - Store / NotFound -> 记录日志，下一个 tick 重试

use thiserror::Error;

use crate::core::Phase;
use crate::gates::GateError;
use crate::operations::{OperationId, StoreError};

#[derive(Error, Debug)]
pub enum ResearchError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("{phase} child operation {operation_id} failed: {message}")]
    ChildFailed {
        phase: Phase,
        operation_id: OperationId,
        message: String,
    },

    #[error("Research cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid {phase} result: {message}")]
    InvalidResult { phase: Phase, message: String },

    #[error("Invalid research state: {0}")]
    InvalidState(String),

    #[error("Operation not found: {0}")]
    NotFound(OperationId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResearchError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ResearchError::Cancelled(_))
    }

    /// 业务错误：使研究周期失败
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ResearchError::Gate(_)
                | ResearchError::ChildFailed { .. }
                | ResearchError::InvalidResult { .. }
                | ResearchError::InvalidState(_)
        )
    }

    pub fn gate(&self) -> Option<&GateError> {
        match self {
            ResearchError::Gate(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::GateKind;

    #[test]
    fn test_error_classification() {
        let gate = ResearchError::Gate(GateError {
            gate: GateKind::Training,
            metrics: Default::default(),
            message: "accuracy_below_threshold (30% < 45%)".into(),
        });
        assert!(gate.is_failure());
        assert_eq!(gate.gate().map(|g| g.gate), Some(GateKind::Training));
        assert_eq!(
            gate.to_string(),
            "training gate failed: accuracy_below_threshold (30% < 45%)"
        );

        let cancelled = ResearchError::Cancelled("user".into());
        assert!(cancelled.is_cancellation());
        assert!(!cancelled.is_failure());

        let store = ResearchError::Store(StoreError::Unavailable("db down".into()));
        assert!(!store.is_failure());
        assert!(!store.is_cancellation());
    }

    #[test]
    fn test_child_failed_message() {
        let err = ResearchError::ChildFailed {
            phase: Phase::Training,
            operation_id: "op_t".into(),
            message: "CUDA out of memory".into(),
        };
        assert_eq!(
            err.to_string(),
            "training child operation op_t failed: CUDA out of memory"
        );
    }
}
