//! 命令执行层：一次性命令（CommandRunner）与长驻子进程（ProcessLauncher）

pub mod mock;
pub mod process;
pub mod runner;

pub use mock::{LauncherEvent, MockLauncher, MockResponse, MockRunner};
pub use process::{stop_gracefully, ChildHandle, ProcessLauncher, ProcessSpec, SystemLauncher};
pub use runner::{args, CommandError, CommandOutput, CommandRunner, SystemRunner};
