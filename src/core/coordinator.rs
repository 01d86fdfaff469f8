//! 协调器：发现所有活跃研究周期，逐个推进一步，休眠，循环
//!
//! 由服务持有的显式监管者，提供 start / stop。没有活跃研究周期时循环退出，
//! 下一次 trigger / resume 会重新启动它。

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointKind;
use crate::core::{AdvanceOutcome, CheckpointAdapter, PhaseMachine, ResearchError};
use crate::operations::{OperationFilter, OperationStore};

/// 轮询间隔上下限（毫秒）
pub const MIN_POLL_INTERVAL_MS: u64 = 10;
pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;

pub fn clamp_poll_interval(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS))
}

#[derive(Default)]
struct LoopSlot {
    running: bool,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<Result<(), ResearchError>>>,
}

struct Inner {
    store: Arc<dyn OperationStore>,
    machine: PhaseMachine,
    checkpoints: Arc<CheckpointAdapter>,
    poll_interval: Duration,
    slot: Mutex<LoopSlot>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn OperationStore>,
        machine: PhaseMachine,
        checkpoints: Arc<CheckpointAdapter>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                machine,
                checkpoints,
                poll_interval,
                slot: Mutex::new(LoopSlot::default()),
            }),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    pub async fn is_running(&self) -> bool {
        self.inner.slot.lock().await.running
    }

    /// 确保循环在运行；返回是否新启动了循环
    pub async fn ensure_running(&self) -> bool {
        let mut slot = self.inner.slot.lock().await;
        let alive = slot
            .handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        if slot.running && alive {
            return false;
        }

        let shutdown = CancellationToken::new();
        slot.shutdown = shutdown.clone();
        slot.running = true;
        slot.handle = Some(tokio::spawn(run_loop(Arc::clone(&self.inner), shutdown)));
        tracing::info!(
            poll_interval_ms = self.inner.poll_interval.as_millis() as u64,
            "Coordinator started"
        );
        true
    }

    /// 停止循环：仍活跃的研究周期会先保存检查点
    pub async fn stop(&self) {
        let handle = {
            let mut slot = self.inner.slot.lock().await;
            slot.shutdown.cancel();
            slot.handle.take()
        };
        if let Some(handle) = handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::info!("Coordinator stopped: {}", e),
                Err(e) => tracing::error!("Coordinator task panicked: {}", e),
            }
        }
        self.inner.slot.lock().await.running = false;
    }

    /// 单次 tick：推进所有活跃研究周期一步，返回本次处理的数量
    pub async fn tick(&self) -> Result<usize, ResearchError> {
        self.inner.tick().await
    }
}

async fn run_loop(inner: Arc<Inner>, shutdown: CancellationToken) -> Result<(), ResearchError> {
    loop {
        if shutdown.is_cancelled() {
            return inner.on_shutdown().await;
        }

        match inner.tick().await {
            Ok(0) => {
                // 持锁复查，避免与并发的 ensure_running 竞争
                let mut slot = inner.slot.lock().await;
                match inner.active_count().await {
                    Ok(0) => {
                        slot.running = false;
                        tracing::info!("No active research, coordinator stopping");
                        return Ok(());
                    }
                    Ok(_) => continue,
                    Err(e) => tracing::warn!("Failed to list active research: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Coordinator tick failed, retrying: {}", e),
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return inner.on_shutdown().await,
            _ = tokio::time::sleep(inner.poll_interval) => {}
        }
    }
}

impl Inner {
    async fn active_count(&self) -> Result<usize, ResearchError> {
        let active = self
            .store
            .list_operations(&OperationFilter::active_research())
            .await?;
        Ok(active.total)
    }

    async fn tick(&self) -> Result<usize, ResearchError> {
        let active = self
            .store
            .list_operations(&OperationFilter::active_research())
            .await?;
        let ids: Vec<String> = active.items.into_iter().map(|r| r.id).collect();

        join_all(ids.iter().map(|id| async move {
            let result = self.machine.advance(id).await;
            self.settle(id, result).await;
        }))
        .await;

        Ok(ids.len())
    }

    /// 把单个研究周期的推进结果转为终态与检查点；错误不会影响其他研究周期
    async fn settle(&self, id: &str, result: Result<AdvanceOutcome, ResearchError>) {
        let err = match result {
            Ok(outcome) => {
                tracing::debug!(operation_id = id, outcome = ?outcome, "Advanced");
                return;
            }
            Err(e) => e,
        };

        if err.is_cancellation() {
            match self.store.cancel_operation(id, &err.to_string()).await {
                Ok(true) => {
                    tracing::info!(operation_id = id, "Research cancelled: {}", err);
                    self.checkpoints
                        .save_checkpoint(id, CheckpointKind::Cancellation)
                        .await;
                }
                // 已终态（例如用户已取消），保留已有检查点
                Ok(false) => {
                    tracing::debug!(operation_id = id, "Research already finished: {}", err)
                }
                Err(e) => tracing::warn!(operation_id = id, "Failed to mark research cancelled: {}", e),
            }
        } else if err.is_failure() {
            match self.store.fail_operation(id, &err.to_string()).await {
                Ok(true) => {
                    tracing::warn!(operation_id = id, "Research failed: {}", err);
                    self.checkpoints
                        .save_checkpoint(id, CheckpointKind::Failure)
                        .await;
                }
                Ok(false) => {
                    tracing::debug!(operation_id = id, "Research already finished: {}", err)
                }
                Err(e) => tracing::warn!(operation_id = id, "Failed to mark research failed: {}", e),
            }
        } else {
            tracing::warn!(operation_id = id, "Advance step failed, will retry: {}", err);
        }
    }

    /// 协调器自身被取消：为每个活跃研究周期保存检查点后停止
    async fn on_shutdown(&self) -> Result<(), ResearchError> {
        match self
            .store
            .list_operations(&OperationFilter::active_research())
            .await
        {
            Ok(active) => {
                for record in &active.items {
                    self.checkpoints
                        .save_checkpoint(&record.id, CheckpointKind::Cancellation)
                        .await;
                }
                tracing::info!(
                    checkpointed = active.items.len(),
                    "Coordinator shutting down"
                );
            }
            Err(e) => tracing::warn!("Failed to checkpoint active research on shutdown: {}", e),
        }
        self.slot.lock().await.running = false;
        Err(ResearchError::Cancelled("coordinator shutdown".to_string()))
    }
}
