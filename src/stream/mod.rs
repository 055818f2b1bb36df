//! 音频流：snapclient 进程监管与后端混音器

pub mod backend;
pub mod supervisor;

pub use backend::{clamp_volume, AudioBackend, StreamSettings};
pub use supervisor::{StreamSupervisor, SupervisorCommand, SupervisorHandle};
