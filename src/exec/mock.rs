//! Mock 执行器（用于测试，无需 bluetoothctl / snapclient）
//!
//! MockRunner 按 (程序, 参数子串) 返回预设输出并记录调用；
//! MockLauncher 记录进程启动/退出顺序，可模拟崩溃与忽略 SIGTERM。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::exec::{
    ChildHandle, CommandError, CommandOutput, CommandRunner, ProcessLauncher, ProcessSpec,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 预设的命令结果
#[derive(Debug, Clone)]
pub enum MockResponse {
    Output(CommandOutput),
    /// 先等待再返回（模拟慢命令）
    Slow(Duration, CommandOutput),
    Timeout,
}

impl MockResponse {
    pub fn ok(stdout: &str) -> Self {
        Self::Output(CommandOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            ..Default::default()
        })
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self::Output(CommandOutput {
            exit_code: Some(exit_code),
            stderr: stderr.to_string(),
            ..Default::default()
        })
    }
}

struct MockRule {
    program: String,
    pattern: String,
    /// 依次返回，最后一个重复使用
    responses: VecDeque<MockResponse>,
}

/// 可编程的 CommandRunner
#[derive(Default)]
pub struct MockRunner {
    rules: Mutex<Vec<MockRule>>,
    calls: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 匹配的调用总是返回 response；后注册的规则优先
    pub fn on(&self, program: &str, pattern: &str, response: MockResponse) {
        self.on_sequence(program, pattern, vec![response]);
    }

    /// 匹配的调用依次返回 responses，用尽后重复最后一个
    pub fn on_sequence(&self, program: &str, pattern: &str, responses: Vec<MockResponse>) {
        lock(&self.rules).push(MockRule {
            program: program.to_string(),
            pattern: pattern.to_string(),
            responses: responses.into(),
        });
    }

    /// 所有调用（"program arg1 arg2 ..."），按发生顺序
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn calls_matching(&self, needle: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.contains(needle)).count()
    }

    fn next_response(&self, program: &str, line: &str) -> MockResponse {
        let mut rules = lock(&self.rules);
        let rule = rules
            .iter_mut()
            .rev()
            .find(|r| r.program == program && line.contains(&r.pattern));
        match rule {
            Some(rule) if rule.responses.len() > 1 => rule
                .responses
                .pop_front()
                .unwrap_or_else(|| MockResponse::ok("")),
            Some(rule) => rule
                .responses
                .front()
                .cloned()
                .unwrap_or_else(|| MockResponse::ok("")),
            None => MockResponse::ok(""),
        }
    }
}

impl MockRunner {
    async fn respond(
        &self,
        program: &str,
        line: String,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        lock(&self.calls).push(line.clone());

        match self.next_response(program, &line) {
            MockResponse::Output(out) => Ok(out),
            MockResponse::Slow(delay, out) => {
                if delay >= timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(CommandError::Timeout {
                        program: program.to_string(),
                        timeout,
                    });
                }
                tokio::time::sleep(delay).await;
                Ok(out)
            }
            MockResponse::Timeout => Err(CommandError::Timeout {
                program: program.to_string(),
                timeout,
            }),
        }
    }
}

fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.respond(program, command_line(program, args), timeout).await
    }

    /// 记录为 "program args <<< line1; line2"
    async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let script = input
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        let line = format!("{} <<< {}", command_line(program, args), script);
        self.respond(program, line, timeout).await
    }
}

/// MockLauncher 记录的生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LauncherEvent {
    Started { pid: u32, spec: ProcessSpec },
    Exited { pid: u32, code: Option<i32> },
}

/// 可编程的 ProcessLauncher：pid 从 1000 递增
#[derive(Clone)]
pub struct MockLauncher {
    inner: Arc<LauncherInner>,
}

struct LauncherInner {
    next_pid: AtomicU32,
    events: Mutex<Vec<LauncherEvent>>,
    exits: Mutex<HashMap<u32, watch::Sender<Option<Option<i32>>>>>,
    ignore_term: AtomicBool,
    fail_start: AtomicBool,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LauncherInner {
                next_pid: AtomicU32::new(1000),
                events: Mutex::new(Vec::new()),
                exits: Mutex::new(HashMap::new()),
                ignore_term: AtomicBool::new(false),
                fail_start: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> Vec<LauncherEvent> {
        lock(&self.inner.events).clone()
    }

    pub fn started_pids(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LauncherEvent::Started { pid, .. } => Some(pid),
                _ => None,
            })
            .collect()
    }

    /// 当前仍在运行的进程数
    pub fn running(&self) -> usize {
        lock(&self.inner.exits)
            .values()
            .filter(|tx| tx.borrow().is_none())
            .count()
    }

    /// 模拟进程意外退出
    pub fn crash(&self, pid: u32, code: i32) {
        if let Some(tx) = lock(&self.inner.exits).get(&pid) {
            let _ = tx.send(Some(Some(code)));
        }
    }

    /// 进程忽略 SIGTERM，只能被 SIGKILL 终止
    pub fn set_ignore_term(&self, ignore: bool) {
        self.inner.ignore_term.store(ignore, Ordering::SeqCst);
    }

    /// 后续 start 调用返回 Spawn 错误
    pub fn set_fail_start(&self, fail: bool) {
        self.inner.fail_start.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessLauncher for MockLauncher {
    async fn start(&self, spec: &ProcessSpec) -> Result<Box<dyn ChildHandle>, CommandError> {
        if self.inner.fail_start.load(Ordering::SeqCst) {
            return Err(CommandError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "mock spawn failure"),
            });
        }
        let pid = self.inner.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(None);
        lock(&self.inner.exits).insert(pid, tx);
        lock(&self.inner.events).push(LauncherEvent::Started {
            pid,
            spec: spec.clone(),
        });
        Ok(Box::new(MockChild {
            pid,
            rx,
            inner: Arc::clone(&self.inner),
            reported: false,
        }))
    }
}

struct MockChild {
    pid: u32,
    rx: watch::Receiver<Option<Option<i32>>>,
    inner: Arc<LauncherInner>,
    reported: bool,
}

impl MockChild {
    fn signal_exit(&self, code: Option<i32>) {
        if let Some(tx) = lock(&self.inner.exits).get(&self.pid) {
            tx.send_if_modified(|state| {
                if state.is_none() {
                    *state = Some(code);
                    true
                } else {
                    false
                }
            });
        }
    }
}

#[async_trait]
impl ChildHandle for MockChild {
    fn pid(&self) -> Option<u32> {
        if self.rx.borrow().is_none() {
            Some(self.pid)
        } else {
            None
        }
    }

    async fn wait(&mut self) -> Result<Option<i32>, CommandError> {
        let code = loop {
            let current = *self.rx.borrow_and_update();
            if let Some(code) = current {
                break code;
            }
            if self.rx.changed().await.is_err() {
                break None;
            }
        };
        if !self.reported {
            self.reported = true;
            lock(&self.inner.events).push(LauncherEvent::Exited {
                pid: self.pid,
                code,
            });
        }
        Ok(code)
    }

    fn terminate(&mut self) -> Result<(), CommandError> {
        if !self.inner.ignore_term.load(Ordering::SeqCst) {
            self.signal_exit(None);
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<(), CommandError> {
        self.signal_exit(None);
        Ok(())
    }
}
