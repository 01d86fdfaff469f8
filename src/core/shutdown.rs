//! 优雅关闭
//!
//! 监听 Ctrl+C / SIGTERM，停止协调器；协调器在退出前为每个活跃研究周期保存检查点，
//! 下次启动时由 `ResearchService::start` 的扫描继续推进。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::ResearchService;

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 应用自身结束（所有研究周期已结束）
    Finished,
}

/// 关闭信号：第一次触发的原因生效，之后的触发被忽略
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(reason),
        }
    }

    /// 触发关闭；返回是否为首次触发
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        self.token.cancel();
        first
    }

    /// 已触发时返回关闭原因
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.borrow()
    }

    /// 等待关闭被触发，返回原因
    pub async fn wait(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Finished)
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.trigger(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.trigger(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行 `app` 直到其结束或收到关闭信号，然后在超时内停止研究服务
pub async fn run_with_graceful_shutdown<F>(
    manager: &ShutdownManager,
    service: Arc<ResearchService>,
    app: F,
    timeout: Duration,
) -> ShutdownReason
where
    F: Future<Output = ()>,
{
    let reason = tokio::select! {
        _ = app => {
            manager.trigger(ShutdownReason::Finished);
            manager.reason().unwrap_or(ShutdownReason::Finished)
        }
        reason = manager.wait() => reason,
    };
    tracing::info!(reason = ?reason, "Shutting down research service");

    if tokio::time::timeout(timeout, service.shutdown()).await.is_err() {
        tracing::warn!("Research service shutdown timed out after {:?}", timeout);
    }
    reason
}
