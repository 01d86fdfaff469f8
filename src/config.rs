//! 应用配置：从 config/research.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RESEARCH__*` 覆盖（双下划线表示嵌套，如 `RESEARCH__BUDGET__LIMIT_USD=25`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::admission::CapacityPolicy;
use crate::core::coordinator::clamp_poll_interval;
use crate::core::GateSettings;

/// 应用配置根（对应 config/research.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub coordinator: CoordinatorSection,
    pub admission: AdmissionSection,
    pub budget: BudgetSection,
    pub gates: GateSettings,
    pub research: ResearchSection,
    pub storage: StorageSection,
}

/// [coordinator] 段
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorSection {
    /// 两次 tick 之间的休眠（毫秒），限制在 [10, 60000]
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl CoordinatorSection {
    pub fn poll_interval(&self) -> Duration {
        clamp_poll_interval(self.poll_interval_ms)
    }
}

/// [admission] 段：并发上限与节点数
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionSection {
    /// 显式并发上限；未设置时按节点数 + 缓冲计算
    pub max_concurrent_researches: Option<usize>,
    #[serde(default = "default_capacity_buffer")]
    pub capacity_buffer: usize,
    /// 静态节点注册表中的训练节点数
    #[serde(default = "default_workers")]
    pub training_workers: usize,
    #[serde(default = "default_workers")]
    pub backtest_workers: usize,
}

fn default_capacity_buffer() -> usize {
    1
}

fn default_workers() -> usize {
    1
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            max_concurrent_researches: None,
            capacity_buffer: default_capacity_buffer(),
            training_workers: default_workers(),
            backtest_workers: default_workers(),
        }
    }
}

impl AdmissionSection {
    pub fn capacity_policy(&self) -> CapacityPolicy {
        CapacityPolicy {
            override_limit: self.max_concurrent_researches,
            buffer: self.capacity_buffer,
        }
    }
}

/// [budget] 段
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetSection {
    #[serde(default = "default_limit_usd")]
    pub limit_usd: f64,
}

fn default_limit_usd() -> f64 {
    10.0
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            limit_usd: default_limit_usd(),
        }
    }
}

/// [research] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ResearchSection {
    /// trigger 未指定模型时使用
    #[serde(default = "default_model")]
    pub default_model: String,
}

fn default_model() -> String {
    "mlp".to_string()
}

impl Default for ResearchSection {
    fn default() -> Self {
        Self {
            default_model: default_model(),
        }
    }
}

/// [storage] 段：未设置时使用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSection {
    /// SQLite 检查点库路径
    pub checkpoint_db: Option<PathBuf>,
    /// SQLite 操作库路径（需要 async-sqlite feature）
    pub operations_db: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 RESEARCH__* 可覆盖
///
/// 1. 按顺序查找 config/research.toml、../config/research.toml、research.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RESEARCH__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/research", "../config/research", "research"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RESEARCH")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
