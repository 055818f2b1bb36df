//! snapclient 监管器（actor）
//!
//! 独占唯一的 snapclient 子进程，通过命令通道串行处理 ensure/音量/静音/重启/停止，
//! 状态经 watch 通道发布。崩溃计入 stream 预算并按 `restart_backoff × 连续崩溃次数` 退避重启；
//! 进程连续运行 stable_after 后上报成功。

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use crate::bluetooth::SinkTarget;
use crate::core::{OrchestratorError, OrchestratorEvent, StreamStatus};
use crate::escalation::{Component, Escalator, Outcome, Tier};
use crate::exec::{
    stop_gracefully, ChildHandle, CommandError, CommandRunner, ProcessLauncher, ProcessSpec,
};
use crate::stream::{clamp_volume, AudioBackend, StreamSettings};

/// 发往监管器的命令
#[derive(Debug)]
pub enum SupervisorCommand {
    /// 保证有且仅有一个绑定到 target 的进程
    Ensure {
        target: SinkTarget,
        reply: oneshot::Sender<()>,
    },
    SetVolume {
        percent: i64,
        reply: oneshot::Sender<Result<u8, OrchestratorError>>,
    },
    SetMute {
        muted: bool,
        reply: oneshot::Sender<Result<bool, OrchestratorError>>,
    },
    /// Tier-1：强制终止并立即重启
    Restart { reply: oneshot::Sender<()> },
    /// 停止进程并结束 actor
    Stop { reply: oneshot::Sender<()> },
}

/// 监管器的调用端（可克隆）
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| OrchestratorError::SupervisorUnavailable)?;
        rx.await.map_err(|_| OrchestratorError::SupervisorUnavailable)
    }

    pub async fn ensure_running(&self, target: SinkTarget) -> Result<(), OrchestratorError> {
        self.request(|reply| SupervisorCommand::Ensure { target, reply }).await
    }

    /// 返回后端确认的音量（百分比）
    pub async fn set_volume(&self, percent: i64) -> Result<u8, OrchestratorError> {
        self.request(|reply| SupervisorCommand::SetVolume { percent, reply })
            .await?
    }

    pub async fn set_mute(&self, muted: bool) -> Result<bool, OrchestratorError> {
        self.request(|reply| SupervisorCommand::SetMute { muted, reply })
            .await?
    }

    pub async fn restart(&self) -> Result<(), OrchestratorError> {
        self.request(|reply| SupervisorCommand::Restart { reply }).await
    }

    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        self.request(|reply| SupervisorCommand::Stop { reply }).await
    }
}

pub struct StreamSupervisor {
    settings: StreamSettings,
    launcher: Arc<dyn ProcessLauncher>,
    runner: Arc<dyn CommandRunner>,
    escalator: Arc<Escalator>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    status_tx: watch::Sender<StreamStatus>,
    commands: mpsc::Receiver<SupervisorCommand>,

    target: Option<SinkTarget>,
    child: Option<Box<dyn ChildHandle>>,
    started_at: Option<Instant>,
    stable_reported: bool,
    consecutive_crashes: u32,
    restart_at: Option<Instant>,
}

async fn wait_child(child: &mut Option<Box<dyn ChildHandle>>) -> Result<Option<i32>, CommandError> {
    match child {
        Some(c) => c.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(t) => sleep_until(t).await,
        None => std::future::pending().await,
    }
}

impl StreamSupervisor {
    pub fn new(
        settings: StreamSettings,
        launcher: Arc<dyn ProcessLauncher>,
        runner: Arc<dyn CommandRunner>,
        escalator: Arc<Escalator>,
        events: mpsc::UnboundedSender<OrchestratorEvent>,
    ) -> (Self, SupervisorHandle, watch::Receiver<StreamStatus>) {
        let (tx, commands) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(StreamStatus {
            backend: settings.backend,
            ..Default::default()
        });
        let supervisor = Self {
            settings,
            launcher,
            runner,
            escalator,
            events,
            status_tx,
            commands,
            target: None,
            child: None,
            started_at: None,
            stable_reported: false,
            consecutive_crashes: 0,
            restart_at: None,
        };
        (supervisor, SupervisorHandle { tx }, status_rx)
    }

    /// actor 主循环：命令、子进程退出、重启定时、稳定定时四路复用
    pub async fn run(mut self) {
        loop {
            let stable_at = self
                .started_at
                .filter(|_| !self.stable_reported)
                .map(|t| t + self.settings.stable_after);

            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        self.stop_child(false).await;
                        break;
                    };
                    if !self.handle(cmd).await {
                        break;
                    }
                }
                exit = wait_child(&mut self.child) => {
                    let code = exit.unwrap_or_else(|e| {
                        tracing::warn!("Waiting for snapclient failed: {}", e);
                        None
                    });
                    self.child = None;
                    self.on_crash(code).await;
                }
                _ = sleep_until_opt(self.restart_at) => {
                    self.restart_at = None;
                    self.spawn().await;
                }
                _ = sleep_until_opt(stable_at) => {
                    self.stable_reported = true;
                    self.consecutive_crashes = 0;
                    tracing::debug!("snapclient stable for {:?}", self.settings.stable_after);
                    self.escalator.observe(Component::Stream, Outcome::Success).await;
                }
            }
        }
        tracing::info!("Stream supervisor stopped");
    }

    /// 处理一条命令；返回 false 表示 actor 应结束
    async fn handle(&mut self, cmd: SupervisorCommand) -> bool {
        match cmd {
            SupervisorCommand::Ensure { target, reply } => {
                self.ensure(target).await;
                let _ = reply.send(());
            }
            SupervisorCommand::SetVolume { percent, reply } => {
                let _ = reply.send(self.set_volume(percent).await);
            }
            SupervisorCommand::SetMute { muted, reply } => {
                let _ = reply.send(self.set_mute(muted).await);
            }
            SupervisorCommand::Restart { reply } => {
                self.restart().await;
                let _ = reply.send(());
            }
            SupervisorCommand::Stop { reply } => {
                self.stop_child(false).await;
                self.target = None;
                self.restart_at = None;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn ensure(&mut self, target: SinkTarget) {
        let same = self.target.as_ref().map(|t| t.address == target.address) == Some(true);
        if same && (self.child.is_some() || self.restart_at.is_some()) {
            return;
        }
        if !same && self.child.is_some() {
            tracing::info!(
                "Retargeting snapclient to {} ({})",
                target.name,
                target.address
            );
            // 旧进程退出被观察到之后才启动新进程
            self.stop_child(false).await;
        }
        self.target = Some(target);
        self.consecutive_crashes = 0;
        self.restart_at = None;
        self.spawn().await;
    }

    async fn restart(&mut self) {
        tracing::warn!("Stream component restart: killing snapclient");
        self.stop_child(true).await;
        self.consecutive_crashes = 0;
        self.restart_at = None;
        self.spawn().await;
    }

    async fn spawn(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };
        let spec = self.settings.snapclient_spec(&target);
        tracing::info!("Starting snapclient: {}", spec.display());
        match self.launcher.start(&spec).await {
            Ok(child) => {
                let pid = child.pid();
                self.child = Some(child);
                self.started_at = Some(Instant::now());
                self.stable_reported = false;
                self.status_tx.send_modify(|s| {
                    s.running = true;
                    s.pid = pid;
                    s.target = Some(target.address.clone());
                });
                let _ = self.events.send(OrchestratorEvent::StreamStarted {
                    address: target.address,
                    pid,
                });
            }
            Err(e) => {
                tracing::error!("Failed to start snapclient: {}", e);
                self.on_crash(None).await;
            }
        }
    }

    /// 停止当前进程并等待其退出；force 时直接 SIGKILL
    async fn stop_child(&mut self, force: bool) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.pid();
        let result = if force {
            match child.kill() {
                Ok(()) => child.wait().await,
                Err(e) => Err(e),
            }
        } else {
            stop_gracefully(child.as_mut(), self.settings.stop_grace).await
        };
        let code = result.unwrap_or_else(|e| {
            tracing::warn!("Stopping snapclient {:?} failed: {}", pid, e);
            None
        });
        tracing::info!("snapclient {:?} stopped (exit code {:?})", pid, code);
        self.started_at = None;
        self.status_tx.send_modify(|s| {
            s.running = false;
            s.pid = None;
            s.last_exit_code = code;
        });
        let _ = self.events.send(OrchestratorEvent::StreamStopped {
            address: self.target_address(),
            exit_code: code,
            crashed: false,
        });
    }

    async fn on_crash(&mut self, exit_code: Option<i32>) {
        let address = self.target_address();
        self.started_at = None;
        self.consecutive_crashes += 1;
        self.status_tx.send_modify(|s| {
            s.running = false;
            s.pid = None;
            s.last_exit_code = exit_code;
            s.restart_count += 1;
        });
        let err = OrchestratorError::ProcessCrash {
            address: address.clone(),
            exit_code,
        };
        tracing::warn!(crashes = self.consecutive_crashes, "{}", err);
        let _ = self.events.send(OrchestratorEvent::StreamStopped {
            address,
            exit_code,
            crashed: true,
        });

        match self.escalator.observe(Component::Stream, Outcome::Failure).await {
            Some(Tier::Component) => {
                tracing::warn!("Stream component restart: respawning immediately");
                self.consecutive_crashes = 0;
                self.restart_at = Some(Instant::now());
            }
            Some(Tier::Service) | Some(Tier::Host) => {
                self.restart_at = None;
            }
            None => {
                let delay = self
                    .settings
                    .restart_backoff
                    .saturating_mul(self.consecutive_crashes)
                    .min(self.settings.restart_backoff_max);
                tracing::info!("Restarting snapclient in {:?}", delay);
                self.restart_at = Some(Instant::now() + delay);
            }
        }
    }

    fn target_address(&self) -> String {
        self.target
            .as_ref()
            .map(|t| t.address.clone())
            .unwrap_or_default()
    }

    /// 混音器命令需要的目标；bluealsa 没有绑定音箱时没有可用的 PCM
    fn mixer_target(&self) -> Result<Option<SinkTarget>, OrchestratorError> {
        match (&self.target, self.settings.backend) {
            (None, AudioBackend::Bluealsa) => Err(OrchestratorError::NoActiveSink),
            (target, _) => Ok(target.clone()),
        }
    }

    async fn set_volume(&mut self, percent: i64) -> Result<u8, OrchestratorError> {
        let level = clamp_volume(percent);
        let target = self.mixer_target()?;
        let runner = Arc::clone(&self.runner);
        let timeout = self.settings.mixer_timeout;
        run_mixer(
            runner.as_ref(),
            self.settings.set_volume_command(target.as_ref(), level),
            timeout,
        )
        .await?;
        let readback = run_mixer(
            runner.as_ref(),
            self.settings.get_volume_command(target.as_ref()),
            timeout,
        )
        .await;
        let confirmed = match readback {
            Ok(stdout) => self.settings.parse_volume(&stdout),
            Err(e) => {
                tracing::debug!("Volume read-back failed: {}", e);
                None
            }
        }
        .unwrap_or(level);
        tracing::info!("Volume set to {}% (requested {})", confirmed, percent);
        self.status_tx.send_modify(|s| s.volume = Some(confirmed));
        Ok(confirmed)
    }

    async fn set_mute(&mut self, muted: bool) -> Result<bool, OrchestratorError> {
        let target = self.mixer_target()?;
        let runner = Arc::clone(&self.runner);
        run_mixer(
            runner.as_ref(),
            self.settings.set_mute_command(target.as_ref(), muted),
            self.settings.mixer_timeout,
        )
        .await?;
        tracing::info!("Mute {}", if muted { "on" } else { "off" });
        self.status_tx.send_modify(|s| s.muted = muted);
        Ok(muted)
    }
}

/// 运行一次混音器命令，返回 stdout
async fn run_mixer(
    runner: &dyn CommandRunner,
    spec: ProcessSpec,
    timeout: std::time::Duration,
) -> Result<String, OrchestratorError> {
    let out = runner
        .run(&spec.program, &spec.args, timeout)
        .await?
        .checked(&spec.program)?;
    Ok(out.stdout)
}
