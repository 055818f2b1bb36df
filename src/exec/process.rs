//! 长驻子进程：启动、信号、等待退出
//!
//! 监管器只通过 ProcessLauncher / ChildHandle 两个窄接口操作 snapclient，
//! 测试中以 MockLauncher 替换，无需真实硬件。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::exec::CommandError;

/// 要启动的进程：程序与参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// 用于日志的完整命令行
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// 已启动子进程的句柄
#[async_trait]
pub trait ChildHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// 等待进程退出；被信号终止时退出码为 None。须可安全取消（用于 select!）
    async fn wait(&mut self) -> Result<Option<i32>, CommandError>;

    /// 发送 SIGTERM
    fn terminate(&mut self) -> Result<(), CommandError>;

    /// 强制终止（SIGKILL）
    fn kill(&mut self) -> Result<(), CommandError>;
}

/// 启动长驻进程的能力接口
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn start(&self, spec: &ProcessSpec) -> Result<Box<dyn ChildHandle>, CommandError>;
}

/// 基于 tokio::process 的真实启动器
#[derive(Debug, Default, Clone)]
pub struct SystemLauncher;

impl SystemLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn start(&self, spec: &ProcessSpec) -> Result<Box<dyn ChildHandle>, CommandError> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        Ok(Box::new(SystemChild { child }))
    }
}

struct SystemChild {
    child: Child,
}

#[async_trait]
impl ChildHandle for SystemChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<Option<i32>, CommandError> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    fn terminate(&mut self) -> Result<(), CommandError> {
        // 已退出的进程没有 pid，无需发送信号
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if ret != 0 {
            return Err(CommandError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<(), CommandError> {
        self.child.start_kill()?;
        Ok(())
    }
}

/// 先 SIGTERM，宽限期内未退出则 SIGKILL；返回观察到的退出码
pub async fn stop_gracefully(
    child: &mut dyn ChildHandle,
    grace: Duration,
) -> Result<Option<i32>, CommandError> {
    if let Err(e) = child.terminate() {
        tracing::warn!("SIGTERM failed ({}), killing", e);
        child.kill()?;
        return child.wait().await;
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                "Process {:?} ignored SIGTERM for {:?}, sending SIGKILL",
                child.pid(),
                grace
            );
            child.kill()?;
            child.wait().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::args;

    #[test]
    fn test_process_spec_display() {
        let spec = ProcessSpec::new("snapclient", args(["--host", "nas"]));
        assert_eq!(spec.display(), "snapclient --host nas");
    }

    #[tokio::test]
    async fn test_stop_gracefully_terminates_sleep() {
        let launcher = SystemLauncher::new();
        let mut child = launcher
            .start(&ProcessSpec::new("sleep", args(["30"])))
            .await
            .unwrap();
        assert!(child.pid().is_some());
        let code = stop_gracefully(child.as_mut(), Duration::from_secs(2))
            .await
            .unwrap();
        // 被 SIGTERM 终止，没有退出码
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn test_stop_gracefully_kills_after_grace() {
        let launcher = SystemLauncher::new();
        let mut child = launcher
            .start(&ProcessSpec::new(
                "sh",
                args(["-c", "trap '' TERM; sleep 30"]),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let code = stop_gracefully(child.as_mut(), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(code, None);
    }
}
