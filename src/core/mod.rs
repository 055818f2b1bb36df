//! 核心编排层：错误分类、状态投影、上下文、关闭协调、主控循环

pub mod context;
pub mod error;
pub mod orchestrator;
pub mod shutdown;
pub mod state;

pub use context::OrchestratorContext;
pub use error::OrchestratorError;
pub use orchestrator::{select_active, Orchestrator};
pub use shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::{ConnectionSummary, OrchestratorEvent, StreamStatus};
