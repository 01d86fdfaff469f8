//! 检查点：研究周期失败 / 取消时的阶段状态快照

pub mod sqlite;
pub mod store;
pub mod types;

pub use sqlite::SqliteCheckpointStore;
pub use store::{CheckpointError, CheckpointStore, InMemoryCheckpointStore};
pub use types::*;
