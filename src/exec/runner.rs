//! 外部命令执行器
//!
//! CommandRunner::run(program, args, timeout) 返回退出码、stdout、stderr 与耗时；
//! 不持有任何状态。超时的子进程随 future 一起被丢弃（kill_on_drop），每次调用输出结构化审计日志（JSON）。

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// 执行器层错误：无法启动、超时、I/O
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{program}' timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("Command '{program}' exited with {exit_code:?}: {stderr}")]
    Exit {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// 一次命令调用的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// 被信号终止时为 None
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout 与 stderr 合并后的小写文本，用于模式分类
    pub fn combined_lower(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr).to_lowercase()
    }

    /// 非零退出转为 CommandError::Exit
    pub fn checked(self, program: &str) -> Result<CommandOutput, CommandError> {
        if self.success() {
            Ok(self)
        } else {
            Err(CommandError::Exit {
                program: program.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// 运行一次性外部命令（bluetoothctl、pactl、systemctl 等）的能力接口
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError>;

    /// 把 input 写入 stdin 后关闭，再收集输出（bluetoothctl 会话）
    async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError>;
}

/// 基于 tokio::process 的真实执行器
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl SystemRunner {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        input: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let start = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;
        let stdin = child.stdin.take();

        let result = tokio::time::timeout(timeout, async move {
            if let (Some(mut stdin), Some(input)) = (stdin, input) {
                stdin.write_all(input.as_bytes()).await?;
                // drop 关闭 stdin，交互程序读到 EOF
                drop(stdin);
            }
            child.wait_with_output().await
        })
        .await;
        let duration = start.elapsed();

        let outcome = match &result {
            Ok(Ok(o)) if o.status.success() => "ok",
            Ok(Ok(_)) => "nonzero",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "command_audit",
            "program": program,
            "args": args,
            "stdin_lines": input.map(|i| i.lines().count()).unwrap_or(0),
            "outcome": outcome,
            "duration_ms": duration.as_millis() as u64,
        });
        tracing::debug!(audit = %audit.to_string(), "command");

        let output = result
            .map_err(|_| CommandError::Timeout {
                program: program.to_string(),
                timeout,
            })??;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration,
        })
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.execute(program, args, None, timeout).await
    }

    async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.execute(program, args, Some(input), timeout).await
    }
}

/// 便于构造参数列表
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_runner_captures_stdout() {
        let runner = SystemRunner::new();
        let out = runner
            .run("sh", &args(["-c", "echo hello"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_system_runner_nonzero_exit() {
        let runner = SystemRunner::new();
        let out = runner
            .run("sh", &args(["-c", "echo oops >&2; exit 3"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(out.combined_lower().contains("oops"));
    }

    #[tokio::test]
    async fn test_system_runner_feeds_stdin() {
        let runner = SystemRunner::new();
        let out = runner
            .run_with_input("sh", &[], "echo first\necho second\n", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.lines().collect::<Vec<_>>(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_system_runner_timeout() {
        let runner = SystemRunner::new();
        let err = runner
            .run("sh", &args(["-c", "sleep 5"]), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let runner = SystemRunner::new();
        let err = runner
            .run("definitely-not-a-real-binary-xyz", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
