//! 操作记录：研究周期与阶段子任务的持久化状态

pub mod memory;
pub mod store;
pub mod types;

pub use memory::InMemoryOperationStore;
pub use store::{OperationStore, StoreError};
pub use types::*;
