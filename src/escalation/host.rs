//! 主机控制：服务重启与整机重启
//!
//! 只在 Tier-2 / Tier-3 升级时调用，发出即忘：不等待也不期待确认，失败只记日志。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::exec::{args, CommandRunner};

#[async_trait]
pub trait HostControl: Send + Sync {
    async fn request_reboot(&self);

    async fn restart_self(&self);
}

/// 通过 systemctl 执行
pub struct SystemHostControl {
    runner: Arc<dyn CommandRunner>,
    service_unit: String,
    timeout: Duration,
}

impl SystemHostControl {
    pub fn new(runner: Arc<dyn CommandRunner>, service_unit: impl Into<String>) -> Self {
        Self {
            runner,
            service_unit: service_unit.into(),
            timeout: Duration::from_secs(10),
        }
    }

    async fn systemctl(&self, argv: Vec<String>) {
        match self.runner.run("systemctl", &argv, self.timeout).await {
            Ok(out) if out.success() => {
                tracing::info!("systemctl {} issued", argv.join(" "));
            }
            Ok(out) => {
                tracing::warn!(
                    "systemctl {} exited with {:?}: {}",
                    argv.join(" "),
                    out.exit_code,
                    out.stderr.trim()
                );
            }
            Err(e) => tracing::warn!("systemctl {} failed: {}", argv.join(" "), e),
        }
    }
}

#[async_trait]
impl HostControl for SystemHostControl {
    async fn request_reboot(&self) {
        self.systemctl(args(["reboot"])).await;
    }

    async fn restart_self(&self) {
        // --no-block：systemd 会先停掉本进程，不能同步等待
        self.systemctl(args(["--no-block", "restart", self.service_unit.as_str()]))
            .await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    Reboot,
    RestartSelf,
}

/// 只记录调用的 HostControl（测试用）
#[derive(Debug, Default)]
pub struct RecordingHost {
    actions: Mutex<Vec<HostAction>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<HostAction> {
        self.actions
            .lock()
            .map(|a| a.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn push(&self, action: HostAction) {
        match self.actions.lock() {
            Ok(mut a) => a.push(action),
            Err(e) => e.into_inner().push(action),
        }
    }
}

#[async_trait]
impl HostControl for RecordingHost {
    async fn request_reboot(&self) {
        self.push(HostAction::Reboot);
    }

    async fn restart_self(&self) {
        self.push(HostAction::RestartSelf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{MockResponse, MockRunner};

    #[tokio::test]
    async fn test_system_host_control_commands() {
        let runner = Arc::new(MockRunner::new());
        runner.on("systemctl", "reboot", MockResponse::fail(1, "Access denied"));
        let host = SystemHostControl::new(runner.clone(), "bluesnap.service");
        host.restart_self().await;
        host.request_reboot().await;
        assert_eq!(
            runner.calls(),
            vec![
                "systemctl --no-block restart bluesnap.service".to_string(),
                "systemctl reboot".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_recording_host() {
        let host = RecordingHost::new();
        host.restart_self().await;
        host.request_reboot().await;
        assert_eq!(host.actions(), vec![HostAction::RestartSelf, HostAction::Reboot]);
    }
}
