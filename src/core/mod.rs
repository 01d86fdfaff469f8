//! 核心编排层：错误、研究状态、检查点适配、阶段状态机、协调器、服务门面、关闭处理

pub mod builder;
pub mod coordinator;
pub mod error;
pub mod machine;
pub mod recovery;
pub mod service;
pub mod shutdown;
pub mod state;

pub use builder::{BuildError, ResearchServiceBuilder};
pub use coordinator::Coordinator;
pub use error::ResearchError;
pub use machine::{AdvanceOutcome, GateSettings, PhaseMachine};
pub use recovery::CheckpointAdapter;
pub use service::{
    ActiveResearch, CancelResponse, LastCycle, ResearchService, ResumeResponse, StatusResponse,
    TriggerOptions, TriggerResponse,
};
pub use shutdown::{run_with_graceful_shutdown, ShutdownManager, ShutdownReason};
pub use state::{Phase, ResearchState};
