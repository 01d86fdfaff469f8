//! 预算追踪
//!
//! 准入只读取 `can_spend`；花费由阶段执行器的宿主上下文在阶段成功后记录，
//! 取消或失败的工作不计费。

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

/// 预算检查结果
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub reason: String,
}

/// 预算快照（status 展示用）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub limit_usd: f64,
    pub spent_usd: f64,
    pub remaining_usd: f64,
}

#[async_trait]
pub trait BudgetTracker: Send + Sync {
    async fn can_spend(&self) -> BudgetCheck;

    async fn remaining(&self) -> f64;

    async fn record_spend(&self, amount_usd: f64, label: &str);

    async fn status(&self) -> BudgetStatus;
}

/// 内存预算追踪：固定上限 + 累计花费
#[derive(Debug)]
pub struct InMemoryBudgetTracker {
    limit_usd: f64,
    spent_usd: RwLock<f64>,
}

impl InMemoryBudgetTracker {
    /// 创建预算追踪器；负数上限按 0 处理
    pub fn new(limit_usd: f64) -> Self {
        Self {
            limit_usd: limit_usd.max(0.0),
            spent_usd: RwLock::new(0.0),
        }
    }

    /// 以已有花费初始化（如跨进程恢复当日用量）
    pub fn with_spent(limit_usd: f64, spent_usd: f64) -> Self {
        Self {
            limit_usd: limit_usd.max(0.0),
            spent_usd: RwLock::new(spent_usd.max(0.0)),
        }
    }
}

#[async_trait]
impl BudgetTracker for InMemoryBudgetTracker {
    async fn can_spend(&self) -> BudgetCheck {
        let spent = *self.spent_usd.read().await;
        if spent < self.limit_usd {
            BudgetCheck {
                allowed: true,
                reason: "within_budget".to_string(),
            }
        } else {
            BudgetCheck {
                allowed: false,
                reason: format!(
                    "budget_exhausted (${:.2} spent of ${:.2})",
                    spent, self.limit_usd
                ),
            }
        }
    }

    async fn remaining(&self) -> f64 {
        (self.limit_usd - *self.spent_usd.read().await).max(0.0)
    }

    async fn record_spend(&self, amount_usd: f64, label: &str) {
        if !amount_usd.is_finite() || amount_usd <= 0.0 {
            return;
        }
        let mut spent = self.spent_usd.write().await;
        *spent += amount_usd;
        tracing::debug!(label, amount_usd, total_spent = *spent, "Recorded spend");
    }

    async fn status(&self) -> BudgetStatus {
        let spent = *self.spent_usd.read().await;
        BudgetStatus {
            limit_usd: self.limit_usd,
            spent_usd: spent,
            remaining_usd: (self.limit_usd - spent).max(0.0),
        }
    }
}
