//! bluetoothctl 封装：会话脚本与输出分类
//!
//! 每次操作都是一个 bluetoothctl 会话：命令经 stdin 写入，以 `select <controller>` 开头、
//! `quit` 结尾，因此控制器选择对会话内的每条命令生效。会话经由 CommandRunner 执行，
//! 测试中可以用 MockRunner 按输出模式驱动看门狗。
//!
//! 交互模式下 bluetoothctl 几乎总以 0 退出，失败只能从输出文本识别。

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;

use crate::bluetooth::normalize_address;
use crate::core::OrchestratorError;
use crate::exec::{args, CommandError, CommandOutput, CommandRunner};

/// 配对代理能力：无输入无输出（音箱无需 PIN）
pub const AGENT_CAPABILITY: &str = "NoInputNoOutput";

/// `bluetoothctl info` 的解析结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: Option<String>,
    pub connected: bool,
    pub paired: bool,
    pub trusted: bool,
    /// 适配器是否认识该设备（"Device ... not available" 时为 false）
    pub available: bool,
}

/// 连接命令的结果分类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
    /// 退出码 0 但输出里没有成功提示，需要 info 确认
    Unconfirmed,
    /// 设备不在范围内或未配对
    NotAvailable,
    Failed(String),
    Timeout,
}

impl ConnectOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectOutcome::Connected | ConnectOutcome::AlreadyConnected)
    }

    pub fn describe(&self) -> String {
        match self {
            ConnectOutcome::Connected => "connection successful".to_string(),
            ConnectOutcome::AlreadyConnected => "already connected".to_string(),
            ConnectOutcome::Unconfirmed => "connect not confirmed".to_string(),
            ConnectOutcome::NotAvailable => "device not available".to_string(),
            ConnectOutcome::Failed(reason) => reason.clone(),
            ConnectOutcome::Timeout => "command timed out".to_string(),
        }
    }
}

/// "Device <mac> not available"：适配器不认识该设备
fn device_unavailable(text_lower: &str) -> bool {
    text_lower
        .lines()
        .any(|l| l.contains("device") && l.contains("not available"))
}

/// 选择控制器失败或没有可用控制器
fn controller_unavailable(text_lower: &str) -> bool {
    text_lower.lines().any(|l| {
        l.contains("no default controller")
            || (l.contains("controller") && l.contains("not available"))
    })
}

/// 会话输出中的第一条失败行；非零退出时取 stderr
pub fn session_failure(output: &CommandOutput) -> Option<String> {
    if !output.success() {
        let stderr = output.stderr.trim();
        return Some(if stderr.is_empty() {
            format!("exited with {:?}", output.exit_code)
        } else {
            stderr.to_string()
        });
    }
    output
        .stdout
        .lines()
        .chain(output.stderr.lines())
        .map(str::trim)
        .find(|l| {
            let lower = l.to_lowercase();
            lower.contains("failed")
                || lower.contains("not available")
                || lower.contains("no default controller")
                || lower.contains("org.bluez.error")
        })
        .map(str::to_string)
}

/// 解析 `bluetoothctl info <addr>` 输出
pub fn parse_info(stdout: &str) -> DeviceInfo {
    let mut info = DeviceInfo {
        available: !device_unavailable(&stdout.to_lowercase()),
        ..Default::default()
    };
    for line in stdout.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim();
        let yes = value.eq_ignore_ascii_case("yes");
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => info.name = Some(value.to_string()),
            "connected" => info.connected = yes,
            "paired" => info.paired = yes,
            "trusted" => info.trusted = yes,
            _ => {}
        }
    }
    info
}

/// 按输出模式分类连接结果
pub fn classify_connect(output: &CommandOutput) -> ConnectOutcome {
    let text = output.combined_lower();
    if text.contains("connection successful") {
        ConnectOutcome::Connected
    } else if text.contains("already connected") {
        ConnectOutcome::AlreadyConnected
    } else if text.contains("not available") {
        ConnectOutcome::NotAvailable
    } else if text.contains("failed to connect") || !output.success() {
        let reason = output
            .stderr
            .lines()
            .chain(output.stdout.lines())
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("connect failed")
            .to_string();
        ConnectOutcome::Failed(reason)
    } else {
        ConnectOutcome::Unconfirmed
    }
}

fn device_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)Device ((?:[0-9A-F]{2}:){5}[0-9A-F]{2}) (.+)").unwrap()
    })
}

/// 解析 `bluetoothctl devices` / 扫描输出中的 "Device <mac> <name>" 行
pub fn parse_devices(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| device_line_regex().captures(line))
        .map(|c| (c[1].to_ascii_uppercase(), c[2].trim().to_string()))
        .collect()
}

/// 解析 `hciconfig <adapter>` 中的 "BD Address: XX:..."
pub fn parse_controller_address(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        line.split("BD Address:")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .map(str::to_string)
    })
}

/// 通过 CommandRunner 调用 bluetoothctl
#[derive(Clone)]
pub struct BluetoothCtl {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timeout: Duration,
    /// 每个会话开头 `select` 的控制器
    controller: Option<String>,
}

impl BluetoothCtl {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            program: "bluetoothctl".to_string(),
            timeout,
            controller: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn controller(&self) -> Option<&str> {
        self.controller.as_deref()
    }

    /// 会话脚本：select（如已解析控制器）+ 命令，quit 时追加 quit
    fn script(&self, commands: &[&[&str]], quit: bool) -> String {
        let mut lines: Vec<String> = Vec::with_capacity(commands.len() + 2);
        if let Some(ref controller) = self.controller {
            lines.push(format!("select {controller}"));
        }
        lines.extend(commands.iter().map(|c| c.join(" ")));
        if quit {
            lines.push("quit".to_string());
        }
        let mut script = lines.join("\n");
        script.push('\n');
        script
    }

    async fn session(&self, commands: &[&[&str]]) -> Result<CommandOutput, CommandError> {
        let script = self.script(commands, true);
        tracing::trace!("bluetoothctl <<< {}", script.replace('\n', "; "));
        self.runner
            .run_with_input(&self.program, &[], &script, self.timeout)
            .await
    }

    /// 输出含失败行视为失败；subject 是错误中报告的设备或适配器
    async fn session_checked(
        &self,
        subject: &str,
        commands: &[&[&str]],
    ) -> Result<CommandOutput, OrchestratorError> {
        let out = self.session(commands).await?;
        match session_failure(&out) {
            None => Ok(out),
            Some(reason) => Err(OrchestratorError::ReconcileFailure {
                address: subject.to_string(),
                reason,
            }),
        }
    }

    /// 查询设备状态；命令本身失败、超时或控制器不可用返回 ReconcileFailure
    pub async fn info(&self, address: &str) -> Result<DeviceInfo, OrchestratorError> {
        let out = self
            .session(&[&["info", address]])
            .await
            .map_err(|e| OrchestratorError::ReconcileFailure {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        let text = out.combined_lower();
        let mut info = parse_info(&out.stdout);
        // "not available" 可能出现在 stderr
        info.available = !device_unavailable(&text);
        // 设备未知是“未连接”而不是命令失败
        if info.available && (!out.success() || controller_unavailable(&text)) {
            return Err(OrchestratorError::ReconcileFailure {
                address: address.to_string(),
                reason: session_failure(&out).unwrap_or_else(|| "info failed".to_string()),
            });
        }
        Ok(info)
    }

    pub async fn connect(&self, address: &str) -> ConnectOutcome {
        match self.session(&[&["connect", address]]).await {
            Ok(out) => classify_connect(&out),
            Err(CommandError::Timeout { .. }) => ConnectOutcome::Timeout,
            Err(e) => ConnectOutcome::Failed(e.to_string()),
        }
    }

    /// connect 后对无明确结果的情况用 info 确认
    pub async fn connect_verified(&self, address: &str) -> ConnectOutcome {
        match self.connect(address).await {
            ConnectOutcome::Unconfirmed => match self.info(address).await {
                Ok(info) if info.connected => ConnectOutcome::Connected,
                Ok(_) => ConnectOutcome::Failed("connect not confirmed by info".to_string()),
                Err(e) => ConnectOutcome::Failed(e.to_string()),
            },
            outcome => outcome,
        }
    }

    pub async fn trust(&self, address: &str) -> Result<CommandOutput, OrchestratorError> {
        self.session_checked(address, &[&["trust", address]]).await
    }

    /// 配对在注册了无输入输出代理的同一会话中进行
    pub async fn pair(&self, address: &str) -> Result<CommandOutput, OrchestratorError> {
        let out = self
            .session(&[
                &["agent", AGENT_CAPABILITY],
                &["default-agent"],
                &["pair", address],
            ])
            .await?;
        if out.combined_lower().contains("already exists") {
            return Ok(out);
        }
        match session_failure(&out) {
            None => Ok(out),
            Some(reason) => Err(OrchestratorError::ReconcileFailure {
                address: address.to_string(),
                reason: format!("pair failed: {reason}"),
            }),
        }
    }

    pub async fn remove(&self, address: &str) -> Result<CommandOutput, OrchestratorError> {
        self.session_checked(address, &[&["remove", address]]).await
    }

    /// 解析适配器名（hci0）到控制器地址；hciconfig 不可用时沿用原名
    pub async fn resolve_controller(&self, adapter: &str) -> String {
        match self
            .runner
            .run("hciconfig", &args([adapter]), self.timeout)
            .await
        {
            Ok(out) if out.success() => {
                parse_controller_address(&out.stdout).unwrap_or_else(|| adapter.to_string())
            }
            Ok(out) => {
                tracing::debug!("hciconfig {} failed: {}", adapter, out.stderr.trim());
                adapter.to_string()
            }
            Err(e) => {
                tracing::debug!("hciconfig unavailable: {}", e);
                adapter.to_string()
            }
        }
    }

    /// 解析并记住控制器，之后的每个会话都先 select 它。
    /// 无法解析出控制器地址时沿用 bluetoothctl 的默认控制器
    pub async fn select_controller(&mut self, adapter: &str) -> Option<&str> {
        let resolved = self.resolve_controller(adapter).await;
        self.controller = normalize_address(&resolved);
        match self.controller {
            Some(ref controller) => {
                tracing::debug!("Using controller {} for adapter {}", controller, adapter);
            }
            None => tracing::warn!(
                "Could not resolve controller address for {}, using the default controller",
                adapter
            ),
        }
        self.controller.as_deref()
    }

    /// 适配器初始化：power on / pairable on / agent / default-agent。
    /// 返回失败的步骤（只记录，不中断）
    pub async fn prepare_adapter(&mut self, adapter: &str) -> Vec<OrchestratorError> {
        self.select_controller(adapter).await;
        let out = match self
            .session(&[
                &["power", "on"],
                &["pairable", "on"],
                &["agent", AGENT_CAPABILITY],
                &["default-agent"],
            ])
            .await
        {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!("Adapter preparation failed: {}", e);
                return vec![e.into()];
            }
        };

        let mut failures = Vec::new();
        if !out.success() {
            failures.push(OrchestratorError::ReconcileFailure {
                address: adapter.to_string(),
                reason: session_failure(&out).unwrap_or_default(),
            });
        }
        for line in out.stdout.lines().chain(out.stderr.lines()).map(str::trim) {
            let lower = line.to_lowercase();
            if lower.contains("failed")
                || lower.contains("not available")
                || lower.contains("no default controller")
            {
                tracing::warn!("Adapter preparation step failed: {}", line);
                failures.push(OrchestratorError::ReconcileFailure {
                    address: adapter.to_string(),
                    reason: line.to_string(),
                });
            }
        }
        failures
    }

    /// 扫描 duration 秒后列出已发现设备
    pub async fn scan(&self, duration: Duration) -> Result<BTreeMap<String, String>, OrchestratorError> {
        let secs = duration.as_secs().max(5).to_string();
        let scan_timeout = duration.max(Duration::from_secs(5)) + self.timeout;
        // 不发送 quit，由 --timeout 结束会话
        let script = self.script(&[&["scan", "on"]], false);
        let out = self
            .runner
            .run_with_input(
                &self.program,
                &args(["--timeout", secs.as_str()]),
                &script,
                scan_timeout,
            )
            .await?;
        let mut found = parse_devices(&out.stdout);
        let listed = self.session_checked("adapter", &[&["devices"]]).await?;
        found.extend(parse_devices(&listed.stdout));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{MockResponse, MockRunner};

    const INFO_CONNECTED: &str = "Device AA:BB:CC:DD:EE:01 (public)\n\tName: Kitchen\n\tPaired: yes\n\tTrusted: yes\n\tConnected: yes\n";

    #[test]
    fn test_parse_info() {
        let info = parse_info(INFO_CONNECTED);
        assert!(info.connected && info.paired && info.trusted && info.available);
        assert_eq!(info.name.as_deref(), Some("Kitchen"));

        let missing = parse_info("Device AA:BB:CC:DD:EE:01 not available\n");
        assert!(!missing.available);
        assert!(!missing.connected);
    }

    #[test]
    fn test_classify_connect() {
        let ok = |s: &str| CommandOutput {
            exit_code: Some(0),
            stdout: s.to_string(),
            ..Default::default()
        };
        let fail = |s: &str| CommandOutput {
            exit_code: Some(1),
            stderr: s.to_string(),
            ..Default::default()
        };
        assert_eq!(
            classify_connect(&ok("Attempting to connect\nConnection successful")),
            ConnectOutcome::Connected
        );
        assert_eq!(
            classify_connect(&ok("Device already connected")),
            ConnectOutcome::AlreadyConnected
        );
        assert_eq!(
            classify_connect(&fail("Device AA:BB:CC:DD:EE:01 not available")),
            ConnectOutcome::NotAvailable
        );
        assert!(matches!(
            classify_connect(&fail("Failed to connect: org.bluez.Error.Failed")),
            ConnectOutcome::Failed(_)
        ));
        assert_eq!(
            classify_connect(&ok("Attempting to connect to AA:BB:CC:DD:EE:01")),
            ConnectOutcome::Unconfirmed
        );
        assert!(!ConnectOutcome::Unconfirmed.is_connected());
    }

    #[test]
    fn test_parse_devices_and_controller() {
        let devices = parse_devices(
            "[NEW] Device aa:bb:cc:dd:ee:01 H6020 Speaker\nnoise\nDevice AA:BB:CC:DD:EE:02 Patio\n",
        );
        assert_eq!(devices.len(), 2);
        assert_eq!(devices["AA:BB:CC:DD:EE:01"], "H6020 Speaker");
        assert_eq!(
            parse_controller_address("hci0:\tType: Primary  Bus: UART\n\tBD Address: E4:5F:01:AA:BB:CC  ACL MTU: 1021:8\n")
                .as_deref(),
            Some("E4:5F:01:AA:BB:CC")
        );
    }

    #[tokio::test]
    async fn test_connect_timeout_is_classified() {
        let runner = Arc::new(MockRunner::new());
        runner.on("bluetoothctl", "connect", MockResponse::Timeout);
        let ctl = BluetoothCtl::new(runner, Duration::from_secs(1));
        assert_eq!(ctl.connect("AA:BB:CC:DD:EE:01").await, ConnectOutcome::Timeout);
    }

    #[tokio::test]
    async fn test_info_unknown_device_is_not_an_error() {
        let runner = Arc::new(MockRunner::new());
        runner.on(
            "bluetoothctl",
            "info",
            MockResponse::fail(1, "Device AA:BB:CC:DD:EE:01 not available"),
        );
        let ctl = BluetoothCtl::new(runner.clone(), Duration::from_secs(1));
        let info = ctl.info("AA:BB:CC:DD:EE:01").await.unwrap();
        assert!(!info.connected);
        assert!(!info.available);

        // 交互会话退出码为 0，提示只出现在 stderr
        runner.on(
            "bluetoothctl",
            "info",
            MockResponse::Output(CommandOutput {
                exit_code: Some(0),
                stdout: "[bluetooth]# info AA:BB:CC:DD:EE:01\n".into(),
                stderr: "Device AA:BB:CC:DD:EE:01 not available\n".into(),
                ..Default::default()
            }),
        );
        let info = ctl.info("AA:BB:CC:DD:EE:01").await.unwrap();
        assert!(!info.available);

        runner.on("bluetoothctl", "info", MockResponse::fail(1, "org.bluez.Error"));
        assert!(matches!(
            ctl.info("AA:BB:CC:DD:EE:01").await,
            Err(OrchestratorError::ReconcileFailure { .. })
        ));

        runner.on(
            "bluetoothctl",
            "info",
            MockResponse::ok("Controller E4:5F:01:AA:BB:CC not available\n"),
        );
        assert!(ctl.info("AA:BB:CC:DD:EE:01").await.is_err());
    }

    #[tokio::test]
    async fn test_sessions_select_controller_first() {
        let runner = Arc::new(MockRunner::new());
        runner.on("hciconfig", "hci1", MockResponse::ok("\tBD Address: E4:5F:01:AA:BB:CC  ACL MTU"));
        runner.on("bluetoothctl", "info", MockResponse::ok(INFO_CONNECTED));
        let mut ctl = BluetoothCtl::new(runner.clone(), Duration::from_secs(1));
        assert_eq!(ctl.select_controller("hci1").await, Some("E4:5F:01:AA:BB:CC"));

        assert!(ctl.info("AA:BB:CC:DD:EE:01").await.unwrap().connected);
        let calls = runner.calls();
        assert_eq!(
            calls.last().unwrap(),
            "bluetoothctl <<< select E4:5F:01:AA:BB:CC; info AA:BB:CC:DD:EE:01; quit"
        );
    }

    #[tokio::test]
    async fn test_unresolved_adapter_uses_default_controller() {
        let runner = Arc::new(MockRunner::new());
        runner.on("hciconfig", "hci0", MockResponse::fail(127, "hciconfig: not found"));
        let mut ctl = BluetoothCtl::new(runner.clone(), Duration::from_secs(1));
        assert_eq!(ctl.select_controller("hci0").await, None);

        ctl.trust("AA:BB:CC:DD:EE:01").await.unwrap();
        assert_eq!(runner.calls_matching("select"), 0);
    }

    #[tokio::test]
    async fn test_unconfirmed_connect_checks_info() {
        let runner = Arc::new(MockRunner::new());
        runner.on("bluetoothctl", "connect", MockResponse::ok("Attempting to connect"));
        runner.on(
            "bluetoothctl",
            "info",
            MockResponse::ok("Device AA:BB:CC:DD:EE:01\n\tConnected: no\n"),
        );
        let ctl = BluetoothCtl::new(runner.clone(), Duration::from_secs(1));
        assert!(matches!(
            ctl.connect_verified("AA:BB:CC:DD:EE:01").await,
            ConnectOutcome::Failed(_)
        ));

        runner.on("bluetoothctl", "info", MockResponse::ok(INFO_CONNECTED));
        assert_eq!(
            ctl.connect_verified("AA:BB:CC:DD:EE:01").await,
            ConnectOutcome::Connected
        );
        assert_eq!(runner.calls_matching("info AA:BB:CC:DD:EE:01"), 2);
    }

    #[tokio::test]
    async fn test_prepare_adapter_reports_failed_steps() {
        let runner = Arc::new(MockRunner::new());
        runner.on("hciconfig", "hci0", MockResponse::ok("\tBD Address: E4:5F:01:AA:BB:CC  ACL MTU"));
        runner.on(
            "bluetoothctl",
            "pairable",
            MockResponse::ok("Changing power on succeeded\nFailed to set pairable on: org.bluez.Error.Failed\n"),
        );
        let mut ctl = BluetoothCtl::new(runner.clone(), Duration::from_secs(1));
        let failures = ctl.prepare_adapter("hci0").await;
        assert_eq!(failures.len(), 1);
        assert_eq!(ctl.controller(), Some("E4:5F:01:AA:BB:CC"));
        assert_eq!(runner.calls_matching("<<< select E4:5F:01:AA:BB:CC; power on"), 1);
        assert_eq!(runner.calls_matching("default-agent"), 1);
    }

    #[tokio::test]
    async fn test_trust_failure_detected_from_output() {
        let runner = Arc::new(MockRunner::new());
        runner.on(
            "bluetoothctl",
            "trust",
            MockResponse::ok("Device AA:BB:CC:DD:EE:09 not available\n"),
        );
        let ctl = BluetoothCtl::new(runner, Duration::from_secs(1));
        assert!(matches!(
            ctl.trust("AA:BB:CC:DD:EE:09").await,
            Err(OrchestratorError::ReconcileFailure { .. })
        ));
    }
}
