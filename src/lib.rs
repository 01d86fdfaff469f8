//! research-cycle - 量化策略研究周期编排
//!
//! 每个研究周期依次经过 设计 → 训练 → 回测 → 评估 四个阶段，阶段之间由质量闸门把关。
//!
//! 模块划分：
//! - **admission**: 准入控制（预算、节点注册表、并发上限）
//! - **checkpoint**: 检查点类型与存储（内存 / SQLite）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 阶段状态机、协调器、服务门面、恢复、关闭
//! - **executors**: 阶段执行器抽象与模拟实现
//! - **gates**: 训练 / 回测质量闸门
//! - **observability**: tracing 初始化
//! - **operations**: 操作记录与操作存储

pub mod admission;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod executors;
pub mod gates;
pub mod observability;
pub mod operations;

pub use crate::core::{ResearchService, ResearchServiceBuilder, TriggerOptions};
