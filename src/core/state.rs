//! 研究周期状态：阶段枚举与强类型元数据
//!
//! `metadata.parameters` 是无版本的键值草稿区；这里把已知键映射为结构体字段，
//! 未知键原样保留在 `extra` 中，保证往返转换无损。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::checkpoint::TokenCounts;
use crate::core::ResearchError;
use crate::operations::{OperationId, OperationKind, ParameterMap};

/// 元数据键
pub mod keys {
    pub const PHASE: &str = "phase";
    pub const MODEL: &str = "model";
    pub const BRIEF: &str = "brief";
    pub const DESIGN_OP_ID: &str = "design_op_id";
    pub const TRAINING_OP_ID: &str = "training_op_id";
    pub const BACKTEST_OP_ID: &str = "backtest_op_id";
    pub const ASSESSMENT_OP_ID: &str = "assessment_op_id";
    pub const STRATEGY_NAME: &str = "strategy_name";
    pub const STRATEGY_PATH: &str = "strategy_path";
    pub const TRAINING_RESULT: &str = "training_result";
    pub const BACKTEST_RESULT: &str = "backtest_result";
    pub const ASSESSMENT_VERDICT: &str = "assessment_verdict";
    pub const INPUT_TOKENS: &str = "input_tokens";
    pub const OUTPUT_TOKENS: &str = "output_tokens";
    pub const PHASE_START_TIME: &str = "phase_start_time";
    pub const TOKENS_COUNTED: &str = "tokens_counted_op_ids";
}

/// 研究周期阶段：idle → designing → training → backtesting → assessing → completed
///
/// 失败与取消体现在记录状态上，阶段停留在出错时的值，便于检查点记录。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Designing,
    Training,
    Backtesting,
    Assessing,
    Completed,
}

impl Phase {
    /// 四个工作阶段（有子任务的阶段）
    pub const WORKING: [Phase; 4] = [
        Phase::Designing,
        Phase::Training,
        Phase::Backtesting,
        Phase::Assessing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Designing => "designing",
            Phase::Training => "training",
            Phase::Backtesting => "backtesting",
            Phase::Assessing => "assessing",
            Phase::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Phase::Idle),
            "designing" => Some(Phase::Designing),
            "training" => Some(Phase::Training),
            "backtesting" => Some(Phase::Backtesting),
            "assessing" => Some(Phase::Assessing),
            "completed" => Some(Phase::Completed),
            _ => None,
        }
    }

    /// 唯一合法的后继阶段；completed 没有后继
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Idle => Some(Phase::Designing),
            Phase::Designing => Some(Phase::Training),
            Phase::Training => Some(Phase::Backtesting),
            Phase::Backtesting => Some(Phase::Assessing),
            Phase::Assessing => Some(Phase::Completed),
            Phase::Completed => None,
        }
    }

    pub fn is_working(&self) -> bool {
        Self::WORKING.contains(self)
    }

    /// 进入该阶段时上报的进度百分比（只是遥测）
    pub fn progress_percent(&self) -> f64 {
        match self {
            Phase::Idle => 0.0,
            Phase::Designing => 5.0,
            Phase::Training => 20.0,
            Phase::Backtesting => 65.0,
            Phase::Assessing => 90.0,
            Phase::Completed => 100.0,
        }
    }

    /// 第几个工作阶段（1-4），用于 steps_completed
    pub fn step_index(&self) -> u32 {
        match self {
            Phase::Idle => 0,
            Phase::Designing => 1,
            Phase::Training => 2,
            Phase::Backtesting => 3,
            Phase::Assessing => 4,
            Phase::Completed => 4,
        }
    }

    /// 子任务 ID 在元数据中的键
    pub fn op_id_key(&self) -> Option<&'static str> {
        match self {
            Phase::Designing => Some(keys::DESIGN_OP_ID),
            Phase::Training => Some(keys::TRAINING_OP_ID),
            Phase::Backtesting => Some(keys::BACKTEST_OP_ID),
            Phase::Assessing => Some(keys::ASSESSMENT_OP_ID),
            _ => None,
        }
    }

    pub fn child_kind(&self) -> Option<OperationKind> {
        match self {
            Phase::Designing => Some(OperationKind::Design),
            Phase::Training => Some(OperationKind::Training),
            Phase::Backtesting => Some(OperationKind::Backtest),
            Phase::Assessing => Some(OperationKind::Assessment),
            _ => None,
        }
    }

    pub fn step_label(&self) -> &'static str {
        match self {
            Phase::Idle => "Queued",
            Phase::Designing => "Designing strategy",
            Phase::Training => "Training model",
            Phase::Backtesting => "Running backtest",
            Phase::Assessing => "Assessing results",
            Phase::Completed => "Completed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 研究周期的强类型草稿状态
#[derive(Debug, Clone, PartialEq)]
pub struct ResearchState {
    pub phase: Phase,
    pub model: Option<String>,
    pub brief: Option<String>,
    pub design_op_id: Option<OperationId>,
    pub training_op_id: Option<OperationId>,
    pub backtest_op_id: Option<OperationId>,
    pub assessment_op_id: Option<OperationId>,
    pub strategy_name: Option<String>,
    pub strategy_path: Option<String>,
    pub training_result: Option<ParameterMap>,
    pub backtest_result: Option<ParameterMap>,
    pub assessment_verdict: Option<String>,
    pub tokens: TokenCounts,
    /// 已计入 tokens 的子任务 ID，同一子任务只计一次
    pub tokens_counted: Vec<OperationId>,
    /// 当前阶段开始时间（毫秒时间戳），用于阶段耗时
    pub phase_start_time: Option<i64>,
    /// 未知键，向前兼容
    pub extra: ParameterMap,
}

impl Default for ResearchState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            model: None,
            brief: None,
            design_op_id: None,
            training_op_id: None,
            backtest_op_id: None,
            assessment_op_id: None,
            strategy_name: None,
            strategy_path: None,
            training_result: None,
            backtest_result: None,
            assessment_verdict: None,
            tokens: TokenCounts::default(),
            tokens_counted: Vec::new(),
            phase_start_time: None,
            extra: ParameterMap::new(),
        }
    }
}

fn take_string(map: &mut ParameterMap, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

fn take_object(map: &mut ParameterMap, key: &str) -> Option<ParameterMap> {
    match map.remove(key) {
        Some(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

fn take_u64(map: &mut ParameterMap, key: &str) -> u64 {
    map.remove(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

impl ResearchState {
    pub fn new(model: impl Into<String>, brief: Option<String>) -> Self {
        Self {
            model: Some(model.into()),
            brief,
            ..Self::default()
        }
    }

    /// 从元数据解析；未知阶段名视为状态损坏
    pub fn from_parameters(parameters: &ParameterMap) -> Result<Self, ResearchError> {
        let mut map = parameters.clone();

        let phase = match take_string(&mut map, keys::PHASE) {
            Some(name) => Phase::parse(&name)
                .ok_or_else(|| ResearchError::InvalidState(format!("unknown phase '{name}'")))?,
            None => Phase::Idle,
        };

        Ok(Self {
            phase,
            model: take_string(&mut map, keys::MODEL),
            brief: take_string(&mut map, keys::BRIEF),
            design_op_id: take_string(&mut map, keys::DESIGN_OP_ID),
            training_op_id: take_string(&mut map, keys::TRAINING_OP_ID),
            backtest_op_id: take_string(&mut map, keys::BACKTEST_OP_ID),
            assessment_op_id: take_string(&mut map, keys::ASSESSMENT_OP_ID),
            strategy_name: take_string(&mut map, keys::STRATEGY_NAME),
            strategy_path: take_string(&mut map, keys::STRATEGY_PATH),
            training_result: take_object(&mut map, keys::TRAINING_RESULT),
            backtest_result: take_object(&mut map, keys::BACKTEST_RESULT),
            assessment_verdict: take_string(&mut map, keys::ASSESSMENT_VERDICT),
            tokens: TokenCounts {
                input_tokens: take_u64(&mut map, keys::INPUT_TOKENS),
                output_tokens: take_u64(&mut map, keys::OUTPUT_TOKENS),
            },
            tokens_counted: match map.remove(keys::TOKENS_COUNTED) {
                Some(Value::Array(ids)) => ids
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            },
            phase_start_time: map.remove(keys::PHASE_START_TIME).and_then(|v| v.as_i64()),
            extra: map,
        })
    }

    pub fn to_parameters(&self) -> ParameterMap {
        let mut map = self.extra.clone();
        map.insert(keys::PHASE.into(), json!(self.phase.as_str()));

        let strings = [
            (keys::MODEL, &self.model),
            (keys::BRIEF, &self.brief),
            (keys::DESIGN_OP_ID, &self.design_op_id),
            (keys::TRAINING_OP_ID, &self.training_op_id),
            (keys::BACKTEST_OP_ID, &self.backtest_op_id),
            (keys::ASSESSMENT_OP_ID, &self.assessment_op_id),
            (keys::STRATEGY_NAME, &self.strategy_name),
            (keys::STRATEGY_PATH, &self.strategy_path),
            (keys::ASSESSMENT_VERDICT, &self.assessment_verdict),
        ];
        for (key, value) in strings {
            if let Some(v) = value {
                map.insert(key.into(), json!(v));
            }
        }

        if let Some(r) = &self.training_result {
            map.insert(keys::TRAINING_RESULT.into(), Value::Object(r.clone()));
        }
        if let Some(r) = &self.backtest_result {
            map.insert(keys::BACKTEST_RESULT.into(), Value::Object(r.clone()));
        }
        map.insert(keys::INPUT_TOKENS.into(), json!(self.tokens.input_tokens));
        map.insert(keys::OUTPUT_TOKENS.into(), json!(self.tokens.output_tokens));
        if !self.tokens_counted.is_empty() {
            map.insert(keys::TOKENS_COUNTED.into(), json!(self.tokens_counted));
        }
        if let Some(t) = self.phase_start_time {
            map.insert(keys::PHASE_START_TIME.into(), json!(t));
        }
        map
    }

    pub fn op_id(&self, phase: Phase) -> Option<&OperationId> {
        match phase {
            Phase::Designing => self.design_op_id.as_ref(),
            Phase::Training => self.training_op_id.as_ref(),
            Phase::Backtesting => self.backtest_op_id.as_ref(),
            Phase::Assessing => self.assessment_op_id.as_ref(),
            _ => None,
        }
    }

    fn op_id_slot(&mut self, phase: Phase) -> Option<&mut Option<OperationId>> {
        match phase {
            Phase::Designing => Some(&mut self.design_op_id),
            Phase::Training => Some(&mut self.training_op_id),
            Phase::Backtesting => Some(&mut self.backtest_op_id),
            Phase::Assessing => Some(&mut self.assessment_op_id),
            _ => None,
        }
    }

    pub fn set_op_id(&mut self, phase: Phase, id: OperationId) {
        if let Some(slot) = self.op_id_slot(phase) {
            *slot = Some(id);
        }
    }

    pub fn clear_op_id(&mut self, phase: Phase) -> Option<OperationId> {
        self.op_id_slot(phase).and_then(Option::take)
    }

    /// 当前阶段的子任务 ID（没有或阶段无子任务时为 None）
    pub fn active_child(&self) -> Option<&OperationId> {
        self.op_id(self.phase)
    }

    /// 已记录的所有子任务 ID，键为元数据键名
    pub fn child_ids(&self) -> BTreeMap<String, OperationId> {
        Phase::WORKING
            .iter()
            .filter_map(|p| Some((p.op_id_key()?.to_string(), self.op_id(*p)?.clone())))
            .collect()
    }

    /// 前进到下一阶段；completed 之后不再前进
    pub fn advance(&mut self) -> Option<Phase> {
        let next = self.phase.next()?;
        self.phase = next;
        self.phase_start_time = None;
        Some(next)
    }

    /// 累加子任务结果中报告的 token 用量；该子任务已计入过时返回 false
    pub fn add_tokens(&mut self, child_id: &str, result: &ParameterMap) -> bool {
        if self.tokens_counted.iter().any(|id| id == child_id) {
            return false;
        }
        let read = |key: &str| result.get(key).and_then(Value::as_u64).unwrap_or(0);
        self.tokens.input_tokens += read(keys::INPUT_TOKENS);
        self.tokens.output_tokens += read(keys::OUTPUT_TOKENS);
        self.tokens_counted.push(child_id.to_string());
        true
    }
}
