//! 检查点适配：从操作记录合成快照、保存 / 删除 / 加载、恢复时合并回元数据
//!
//! 检查点失败绝不能让研究周期二次失败：保存与删除只记录日志，不返回错误。

use std::sync::Arc;

use serde_json::{json, Value};

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointKind, CheckpointState, CheckpointStore};
use crate::core::state::keys;
use crate::core::ResearchState;
use crate::operations::{OperationRecord, OperationStore, ParameterMap};

pub struct CheckpointAdapter {
    store: Arc<dyn OperationStore>,
    /// None 表示检查点存储不可用
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl CheckpointAdapter {
    pub fn new(store: Arc<dyn OperationStore>, checkpoints: Option<Arc<dyn CheckpointStore>>) -> Self {
        Self { store, checkpoints }
    }

    pub fn is_available(&self) -> bool {
        self.checkpoints.is_some()
    }

    /// 仅依据记录元数据合成快照
    pub fn snapshot(record: &OperationRecord) -> CheckpointState {
        let parameters = &record.metadata.parameters;
        let phase = parameters
            .get(keys::PHASE)
            .and_then(Value::as_str)
            .unwrap_or("idle")
            .to_string();

        // 元数据损坏时仍保留阶段名与原始请求
        let state = ResearchState::from_parameters(parameters).unwrap_or_default();

        CheckpointState {
            phase,
            strategy_name: state.strategy_name,
            strategy_path: state.strategy_path,
            design_operation_id: state.design_op_id,
            training_operation_id: state.training_op_id,
            backtest_operation_id: state.backtest_op_id,
            assessment_operation_id: state.assessment_op_id,
            token_counts: state.tokens,
            original_request: parameters.clone(),
        }
    }

    pub async fn save_checkpoint(&self, operation_id: &str, kind: CheckpointKind) {
        let checkpoints = match &self.checkpoints {
            Some(c) => c,
            None => {
                tracing::warn!(operation_id, %kind, "Checkpoint store unavailable, skipping save");
                return;
            }
        };

        let record = match self.store.get_operation(operation_id).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                tracing::warn!(operation_id, %kind, "Operation not found, skipping checkpoint");
                return;
            }
            Err(e) => {
                tracing::warn!(operation_id, %kind, "Failed to read operation for checkpoint: {}", e);
                return;
            }
        };

        let state = Self::snapshot(&record);
        match checkpoints.save_checkpoint(operation_id, kind, &state).await {
            Ok(()) => tracing::info!(operation_id, %kind, phase = %state.phase, "Checkpoint saved"),
            Err(e) => tracing::warn!(operation_id, %kind, "Failed to save checkpoint: {}", e),
        }
    }

    pub async fn delete_checkpoint(&self, operation_id: &str) {
        let Some(checkpoints) = &self.checkpoints else {
            return;
        };
        match checkpoints.delete_checkpoint(operation_id).await {
            Ok(true) => tracing::debug!(operation_id, "Checkpoint deleted"),
            Ok(false) => {}
            Err(e) => tracing::warn!(operation_id, "Failed to delete checkpoint: {}", e),
        }
    }

    pub async fn load_checkpoint(&self, operation_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        match &self.checkpoints {
            Some(c) => c.load_checkpoint(operation_id).await,
            None => Ok(None),
        }
    }

    /// 合并检查点：检查点自身字段覆盖；original_request 只填补缺失键
    pub fn merge(parameters: &ParameterMap, checkpoint: &CheckpointState) -> ParameterMap {
        let mut merged = parameters.clone();
        merged.insert(keys::PHASE.into(), json!(checkpoint.phase));

        let fields = [
            (keys::STRATEGY_NAME, &checkpoint.strategy_name),
            (keys::STRATEGY_PATH, &checkpoint.strategy_path),
            (keys::DESIGN_OP_ID, &checkpoint.design_operation_id),
            (keys::TRAINING_OP_ID, &checkpoint.training_operation_id),
            (keys::BACKTEST_OP_ID, &checkpoint.backtest_operation_id),
            (keys::ASSESSMENT_OP_ID, &checkpoint.assessment_operation_id),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                merged.insert(key.into(), json!(v));
            }
        }
        merged.insert(
            keys::INPUT_TOKENS.into(),
            json!(checkpoint.token_counts.input_tokens),
        );
        merged.insert(
            keys::OUTPUT_TOKENS.into(),
            json!(checkpoint.token_counts.output_tokens),
        );

        for (key, value) in &checkpoint.original_request {
            merged.entry(key.clone()).or_insert_with(|| value.clone());
        }
        merged
    }
}
