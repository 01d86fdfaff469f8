//! research-cycle - 本地运行研究周期
//!
//! 入口：初始化日志、加载配置、组装研究服务（模拟执行器），发起若干研究周期，
//! 等待全部结束或收到 Ctrl+C，然后打印状态。
//!
//! 用法：`research-cycle [cycles] [model]`，默认 1 个周期、配置中的默认模型。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use research_cycle::{
    config::load_config,
    core::{run_with_graceful_shutdown, ResearchServiceBuilder, ShutdownManager, TriggerOptions},
    executors::PhaseExecutors,
    observability,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let cycles: usize = match args.next() {
        Some(n) => n.parse().context("cycles must be a number")?,
        None => 1,
    };
    let model = args.next();

    let config = load_config(None).context("Failed to load config")?;
    let service = ResearchServiceBuilder::new(config)
        .with_executors(PhaseExecutors::simulated(Duration::from_millis(300)))
        .build()
        .await
        .context("Failed to build research service")?;
    let service = Arc::new(service);

    let resumed = service.start().await.context("Startup scan failed")?;
    if resumed > 0 {
        tracing::info!(resumed, "Continuing research cycles from previous run");
    }

    for _ in 0..cycles {
        let response = service
            .trigger(TriggerOptions {
                model: model.clone(),
                brief: None,
            })
            .await
            .context("Trigger failed")?;
        println!("{}", serde_json::to_string(&response)?);
    }

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let waiter = Arc::clone(&service);
    let app = async move {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            match waiter.status().await {
                Ok(status) if status.active.is_empty() => break,
                Ok(_) => {}
                Err(e) => tracing::warn!("Status query failed: {}", e),
            }
        }
    };
    let reason =
        run_with_graceful_shutdown(&shutdown, Arc::clone(&service), app, Duration::from_secs(5)).await;
    tracing::info!(reason = ?reason, "Research run finished");

    let status = service.status().await.context("Status query failed")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
