//! 可观测性：tracing 订阅器（默认 info，RUST_LOG 覆盖）
//!
//! 阶段耗时与研究周期耗时以结构化事件输出（字段 `operation_id`、`phase`、`duration_ms`）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 重复初始化（如测试中）忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
