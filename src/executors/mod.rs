//! 阶段执行器：设计、训练、回测、评估

pub mod simulated;
pub mod traits;

use std::sync::Arc;

pub use simulated::SimulatedExecutor;
pub use traits::{PhaseError, PhaseExecutor, PhaseRequest};

use crate::core::Phase;

/// 四个阶段的执行器集合
#[derive(Clone)]
pub struct PhaseExecutors {
    pub design: Arc<dyn PhaseExecutor>,
    pub training: Arc<dyn PhaseExecutor>,
    pub backtest: Arc<dyn PhaseExecutor>,
    pub assessment: Arc<dyn PhaseExecutor>,
}

impl PhaseExecutors {
    pub fn new(
        design: Arc<dyn PhaseExecutor>,
        training: Arc<dyn PhaseExecutor>,
        backtest: Arc<dyn PhaseExecutor>,
        assessment: Arc<dyn PhaseExecutor>,
    ) -> Self {
        Self {
            design,
            training,
            backtest,
            assessment,
        }
    }

    /// 四个阶段共用同一个执行器
    pub fn uniform(executor: Arc<dyn PhaseExecutor>) -> Self {
        Self::new(executor.clone(), executor.clone(), executor.clone(), executor)
    }

    /// 全部使用模拟执行器
    pub fn simulated(delay: std::time::Duration) -> Self {
        Self::uniform(Arc::new(SimulatedExecutor::new(delay)))
    }

    /// 工作阶段对应的执行器；idle 与终态阶段没有执行器
    pub fn for_phase(&self, phase: Phase) -> Option<&Arc<dyn PhaseExecutor>> {
        match phase {
            Phase::Designing => Some(&self.design),
            Phase::Training => Some(&self.training),
            Phase::Backtesting => Some(&self.backtest),
            Phase::Assessing => Some(&self.assessment),
            _ => None,
        }
    }
}
