//! 应用配置：从 TOML 文件与环境变量加载
//!
//! 加载顺序：先读 `--config` 指定的 TOML 文件，再用环境变量 `BLUESNAP__*` 覆盖
//! （双下划线表示嵌套，如 `BLUESNAP__MQTT__HOST=broker.lan`）。
//! 配置只在启动时读取一次；任何缺失或非法值都是 FatalConfig，进程在进入调度前退出。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::bluetooth::{BackoffPolicy, SinkTarget};
use crate::core::OrchestratorError;
use crate::escalation::Component;
use crate::stream::AudioBackend;

/// 应用配置根（对应 bluesnap.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub identity: IdentitySection,
    pub bluetooth: BluetoothSection,
    pub stream: StreamSection,
    pub escalation: EscalationSection,
    pub telemetry: TelemetrySection,
    pub mqtt: MqttSection,
    pub logging: LoggingSection,
}

/// [identity] 段：实例标识，用于 MQTT 主题与发现元数据
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IdentitySection {
    /// 系统标识，如 bluesnap-livingroom
    #[serde(default)]
    pub instance_name: String,
    /// 展示名，如 Living Room Bridge
    #[serde(default)]
    pub friendly_name: String,
    /// 主题/ID 用的短后缀（1-8 字符）
    #[serde(default)]
    pub unique_suffix: String,
}

/// [bluetooth] 段：适配器、看门狗节奏与音箱列表
#[derive(Debug, Clone, Deserialize)]
pub struct BluetoothSection {
    #[serde(default = "default_adapter")]
    pub adapter: String,
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,
    /// 单条 bluetoothctl 命令超时（秒）
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// 连续失败超过该值进入 Failed，停止重连
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub backoff: BackoffSection,
    #[serde(default)]
    pub sinks: Vec<SinkSection>,
}

fn default_adapter() -> String {
    "hci0".to_string()
}

fn default_watchdog_interval() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    5
}

impl Default for BluetoothSection {
    fn default() -> Self {
        Self {
            adapter: default_adapter(),
            watchdog_interval_secs: default_watchdog_interval(),
            command_timeout_secs: default_command_timeout(),
            failure_threshold: default_failure_threshold(),
            backoff: BackoffSection::default(),
            sinks: Vec::new(),
        }
    }
}

/// [bluetooth.backoff] 段：重连指数退避
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffSection {
    #[serde(default = "default_backoff_initial")]
    pub initial_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub max_secs: u64,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
}

fn default_backoff_initial() -> u64 {
    10
}

fn default_backoff_max() -> u64 {
    300
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            initial_secs: default_backoff_initial(),
            max_secs: default_backoff_max(),
            factor: default_backoff_factor(),
        }
    }
}

/// [[bluetooth.sinks]]：单个音箱
#[derive(Debug, Clone, Deserialize)]
pub struct SinkSection {
    pub name: String,
    /// AA:BB:CC:DD:EE:FF，大小写均可
    pub address: String,
    #[serde(default = "default_true")]
    pub keepalive: bool,
    #[serde(default)]
    pub default: bool,
}

fn default_true() -> bool {
    true
}

/// [stream] 段：snapclient 与音频后端
#[derive(Debug, Clone, Deserialize)]
pub struct StreamSection {
    #[serde(default)]
    pub backend: AudioBackend,
    #[serde(default = "default_snapclient")]
    pub snapclient_path: String,
    #[serde(default)]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_latency")]
    pub latency_ms: u32,
    /// 未设置时用 identity.instance_name
    pub client_name: Option<String>,
    /// 覆盖由后端与音箱地址推导出的设备标识
    pub audio_device: Option<String>,
    /// alsa 后端使用的 amixer 控件
    #[serde(default = "default_mixer_control")]
    pub mixer_control: String,
    /// SIGTERM 后等待退出的宽限期（秒）
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_secs: u64,
    #[serde(default = "default_restart_backoff_max")]
    pub restart_backoff_max_secs: u64,
    /// 进程持续运行该时长后视为稳定，上报成功
    #[serde(default = "default_stable_after")]
    pub stable_after_secs: u64,
    #[serde(default = "default_mixer_timeout")]
    pub mixer_timeout_secs: u64,
}

fn default_snapclient() -> String {
    "snapclient".to_string()
}

fn default_server_port() -> u16 {
    1704
}

fn default_latency() -> u32 {
    80
}

fn default_mixer_control() -> String {
    "Master".to_string()
}

fn default_stop_grace() -> u64 {
    5
}

fn default_restart_backoff() -> u64 {
    5
}

fn default_restart_backoff_max() -> u64 {
    60
}

fn default_stable_after() -> u64 {
    30
}

fn default_mixer_timeout() -> u64 {
    5
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            backend: AudioBackend::default(),
            snapclient_path: default_snapclient(),
            server_host: String::new(),
            server_port: default_server_port(),
            latency_ms: default_latency(),
            client_name: None,
            audio_device: None,
            mixer_control: default_mixer_control(),
            stop_grace_secs: default_stop_grace(),
            restart_backoff_secs: default_restart_backoff(),
            restart_backoff_max_secs: default_restart_backoff_max(),
            stable_after_secs: default_stable_after(),
            mixer_timeout_secs: default_mixer_timeout(),
        }
    }
}

/// 单个预算：阈值与窗口
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct BudgetSpec {
    pub threshold: u32,
    pub window_secs: u64,
}

/// [escalation] 段：各组件预算与 Tier-2/3 阈值
#[derive(Debug, Clone, Deserialize)]
pub struct EscalationSection {
    #[serde(default = "default_bluetooth_budget")]
    pub bluetooth: BudgetSpec,
    #[serde(default = "default_stream_budget")]
    pub stream: BudgetSpec,
    #[serde(default = "default_bridge_budget")]
    pub bridge: BudgetSpec,
    /// Tier-2：窗口内 Tier-1 次数
    #[serde(default = "default_service_budget")]
    pub service: BudgetSpec,
    /// Tier-3：窗口内 Tier-2 次数
    #[serde(default = "default_host_budget")]
    pub host: BudgetSpec,
    /// false 时 Tier-3 只重启服务
    #[serde(default = "default_true")]
    pub reboot_enabled: bool,
    #[serde(default = "default_service_unit")]
    pub service_unit: String,
    /// Tier-3 台账文件；未设置时不跨重启计数
    pub ledger_path: Option<PathBuf>,
}

fn default_bluetooth_budget() -> BudgetSpec {
    BudgetSpec {
        threshold: 3,
        window_secs: 60,
    }
}

fn default_stream_budget() -> BudgetSpec {
    BudgetSpec {
        threshold: 3,
        window_secs: 300,
    }
}

fn default_bridge_budget() -> BudgetSpec {
    BudgetSpec {
        threshold: 5,
        window_secs: 300,
    }
}

fn default_service_budget() -> BudgetSpec {
    BudgetSpec {
        threshold: 3,
        window_secs: 600,
    }
}

fn default_host_budget() -> BudgetSpec {
    BudgetSpec {
        threshold: 3,
        window_secs: 86_400,
    }
}

fn default_service_unit() -> String {
    "bluesnap.service".to_string()
}

impl Default for EscalationSection {
    fn default() -> Self {
        Self {
            bluetooth: default_bluetooth_budget(),
            stream: default_stream_budget(),
            bridge: default_bridge_budget(),
            service: default_service_budget(),
            host: default_host_budget(),
            reboot_enabled: true,
            service_unit: default_service_unit(),
            ledger_path: None,
        }
    }
}

impl EscalationSection {
    pub fn budget_for(&self, component: Component) -> BudgetSpec {
        match component {
            Component::Bluetooth => self.bluetooth,
            Component::Stream => self.stream,
            Component::Bridge => self.bridge,
        }
    }
}

/// 可选的系统指标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cpu,
    Memory,
    Load,
    Temperature,
    Bluetooth,
}

/// [telemetry] 段
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySection {
    #[serde(default = "default_telemetry_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_metrics")]
    pub metrics: Vec<Metric>,
}

fn default_telemetry_interval() -> u64 {
    15
}

fn default_metrics() -> Vec<Metric> {
    vec![Metric::Cpu, Metric::Memory, Metric::Load, Metric::Temperature]
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_secs: default_telemetry_interval(),
            metrics: default_metrics(),
        }
    }
}

/// [mqtt] 段
#[derive(Debug, Clone, Deserialize)]
pub struct MqttSection {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    /// 未设置时为 bluesnap/<unique_suffix>
    pub base_topic: Option<String>,
    /// 未设置时为 bluesnap-<unique_suffix>
    pub client_id: Option<String>,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// 单次发布的超时（秒）
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
    #[serde(default)]
    pub tls: MqttTlsSection,
}

/// [mqtt.tls] 段：启用时三个证书文件都必须存在
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MqttTlsSection {
    #[serde(default)]
    pub enabled: bool,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl MqttTlsSection {
    fn validate(&self) -> Result<(), OrchestratorError> {
        if !self.enabled {
            return Ok(());
        }
        let fields = [
            ("ca_cert", &self.ca_cert),
            ("client_cert", &self.client_cert),
            ("client_key", &self.client_key),
        ];
        let missing: Vec<&str> = fields
            .iter()
            .filter(|(_, path)| path.is_none())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(OrchestratorError::FatalConfig(format!(
                "mqtt.tls enabled but missing fields: {}",
                missing.join(", ")
            )));
        }
        for (name, path) in fields {
            if let Some(path) = path {
                if !path.is_file() {
                    return Err(OrchestratorError::FatalConfig(format!(
                        "mqtt.tls.{name} not found: {}",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_keepalive() -> u64 {
    60
}

fn default_publish_timeout() -> u64 {
    5
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            discovery_prefix: default_discovery_prefix(),
            base_topic: None,
            client_id: None,
            keepalive_secs: default_keepalive(),
            publish_timeout_secs: default_publish_timeout(),
            tls: MqttTlsSection::default(),
        }
    }
}

/// [logging] 段
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 输出 JSON 行（便于 journald / 日志采集）
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl MqttSection {
    pub fn resolved_base_topic(&self, identity: &IdentitySection) -> String {
        match self.base_topic {
            Some(ref t) if !t.trim().is_empty() => t.trim_end_matches('/').to_string(),
            _ => format!("bluesnap/{}", identity.unique_suffix.replace(' ', "_")),
        }
    }

    pub fn resolved_client_id(&self, identity: &IdentitySection) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("bluesnap-{}", identity.unique_suffix))
    }
}

impl StreamSection {
    pub fn resolved_client_name(&self, identity: &IdentitySection) -> String {
        self.client_name
            .clone()
            .unwrap_or_else(|| identity.instance_name.clone())
    }
}

impl AppConfig {
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.bluetooth.watchdog_interval_secs.max(1))
    }

    /// 与原有行为一致：遥测间隔至少 5 秒
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.interval_secs.max(5))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt.publish_timeout_secs.max(1))
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_secs(self.bluetooth.backoff.initial_secs),
            max: Duration::from_secs(self.bluetooth.backoff.max_secs),
            factor: self.bluetooth.backoff.factor,
        }
    }

    /// 校验并构造音箱列表（配置顺序即 tick 内的调和顺序）
    pub fn validate(&self) -> Result<Vec<SinkTarget>, OrchestratorError> {
        let fatal = |msg: String| OrchestratorError::FatalConfig(msg);

        if self.identity.instance_name.trim().is_empty() {
            return Err(fatal("identity.instance_name is required".into()));
        }
        if self.identity.friendly_name.trim().is_empty() {
            return Err(fatal("identity.friendly_name is required".into()));
        }
        let suffix_len = self.identity.unique_suffix.chars().count();
        if !(1..=8).contains(&suffix_len) {
            return Err(fatal("identity.unique_suffix must be 1-8 characters".into()));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(fatal("mqtt.host is required".into()));
        }
        self.mqtt.tls.validate()?;
        if self.stream.server_host.trim().is_empty() {
            return Err(fatal("stream.server_host is required".into()));
        }
        if self.bluetooth.sinks.is_empty() {
            return Err(fatal("at least one [[bluetooth.sinks]] entry is required".into()));
        }
        if self.bluetooth.backoff.factor < 1.0 || !self.bluetooth.backoff.factor.is_finite() {
            return Err(fatal("bluetooth.backoff.factor must be >= 1.0".into()));
        }
        if self.bluetooth.backoff.initial_secs > self.bluetooth.backoff.max_secs {
            return Err(fatal("bluetooth.backoff.initial_secs exceeds max_secs".into()));
        }

        let defaults = self.bluetooth.sinks.iter().filter(|s| s.default).count();
        if defaults > 1 {
            return Err(fatal(format!(
                "exactly one sink may be marked default, found {defaults}"
            )));
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(self.bluetooth.sinks.len());
        for (i, sink) in self.bluetooth.sinks.iter().enumerate() {
            let is_default = if defaults == 0 { i == 0 } else { sink.default };
            let target = SinkTarget::new(&sink.name, &sink.address, sink.keepalive, is_default)
                .map_err(|e| fatal(format!("bluetooth.sinks[{i}]: {e}")))?;
            if !seen.insert(target.address.clone()) {
                return Err(fatal(format!("duplicate sink address {}", target.address)));
            }
            targets.push(target);
        }
        Ok(targets)
    }
}

/// 加载配置文件，环境变量 BLUESNAP__* 可覆盖
pub fn load_config(path: &Path) -> Result<AppConfig, OrchestratorError> {
    if !path.exists() {
        return Err(OrchestratorError::FatalConfig(format!(
            "configuration file not found: {}",
            path.display()
        )));
    }

    let c = config::Config::builder()
        .add_source(config::File::from(path.to_path_buf()).required(true))
        .add_source(
            config::Environment::with_prefix("BLUESNAP")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| OrchestratorError::FatalConfig(e.to_string()))?;

    c.try_deserialize()
        .map_err(|e| OrchestratorError::FatalConfig(format!("invalid configuration: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[identity]
instance_name = "bluesnap-livingroom"
friendly_name = "Living Room Bridge"
unique_suffix = "lr01"

[bluetooth]
adapter = "hci0"

[[bluetooth.sinks]]
name = "Kitchen"
address = "aa:bb:cc:dd:ee:01"

[[bluetooth.sinks]]
name = "Patio"
address = "AA:BB:CC:DD:EE:02"
keepalive = false
default = true

[stream]
backend = "pulse"
server_host = "nas.lan"

[escalation.stream]
threshold = 4
window_secs = 120

[telemetry]
metrics = ["cpu", "bluetooth"]

[mqtt]
host = "broker.lan"
"#;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_sample_config() {
        let f = write_config(SAMPLE);
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.stream.backend, AudioBackend::Pulse);
        assert_eq!(cfg.escalation.stream.threshold, 4);
        assert_eq!(cfg.escalation.bluetooth, default_bluetooth_budget());
        assert_eq!(cfg.telemetry.metrics, vec![Metric::Cpu, Metric::Bluetooth]);
        assert_eq!(cfg.mqtt.resolved_base_topic(&cfg.identity), "bluesnap/lr01");
        assert_eq!(cfg.stream.resolved_client_name(&cfg.identity), "bluesnap-livingroom");

        let targets = cfg.validate().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].address, "AA:BB:CC:DD:EE:01");
        assert!(!targets[0].is_default);
        assert!(targets[1].is_default);
        assert!(!targets[1].keepalive);
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let err = load_config(Path::new("/nonexistent/bluesnap.toml")).unwrap_err();
        assert!(matches!(err, OrchestratorError::FatalConfig(_)));
    }

    #[test]
    fn test_unknown_metric_is_fatal() {
        let f = write_config(&SAMPLE.replace("\"bluetooth\"]", "\"gpu\"]"));
        assert!(matches!(load_config(f.path()), Err(OrchestratorError::FatalConfig(_))));
    }

    #[test]
    fn test_first_sink_is_default_when_none_marked() {
        let f = write_config(&SAMPLE.replace("default = true", ""));
        let targets = load_config(f.path()).unwrap().validate().unwrap();
        assert!(targets[0].is_default);
        assert!(!targets[1].is_default);
    }

    #[test]
    fn test_validation_errors() {
        let f = write_config(SAMPLE);
        let base = load_config(f.path()).unwrap();

        let mut cfg = base.clone();
        cfg.bluetooth.sinks[0].default = true;
        assert!(matches!(cfg.validate(), Err(OrchestratorError::FatalConfig(m)) if m.contains("default")));

        let mut cfg = base.clone();
        cfg.bluetooth.sinks[1].address = "aa:bb:cc:dd:ee:01".into();
        assert!(matches!(cfg.validate(), Err(OrchestratorError::FatalConfig(m)) if m.contains("duplicate")));

        let mut cfg = base.clone();
        cfg.bluetooth.sinks[0].address = "not-a-mac".into();
        assert!(cfg.validate().is_err());

        let mut cfg = base.clone();
        cfg.bluetooth.sinks.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = base;
        cfg.identity.unique_suffix = "waytoolongsuffix".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_mqtt_tls_validation() {
        let ca = tempfile::NamedTempFile::new().unwrap();
        let cert = tempfile::NamedTempFile::new().unwrap();
        let body = format!(
            "{SAMPLE}\n[mqtt.tls]\nenabled = true\nca_cert = \"{}\"\nclient_cert = \"{}\"\n",
            ca.path().display(),
            cert.path().display()
        );
        let f = write_config(&body);
        let cfg = load_config(f.path()).unwrap();
        assert!(cfg.mqtt.tls.enabled);
        assert!(matches!(
            cfg.validate(),
            Err(OrchestratorError::FatalConfig(m)) if m.contains("client_key")
        ));

        let mut cfg = cfg;
        cfg.mqtt.tls.client_key = Some(PathBuf::from("/nonexistent/client.key"));
        assert!(matches!(
            cfg.validate(),
            Err(OrchestratorError::FatalConfig(m)) if m.contains("not found")
        ));

        let key = tempfile::NamedTempFile::new().unwrap();
        cfg.mqtt.tls.client_key = Some(key.path().to_path_buf());
        assert!(cfg.validate().is_ok());

        cfg.mqtt.tls.enabled = false;
        cfg.mqtt.tls.ca_cert = None;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.watchdog_interval(), Duration::from_secs(10));
        assert_eq!(cfg.telemetry_interval(), Duration::from_secs(15));
        assert_eq!(cfg.backoff_policy().max, Duration::from_secs(300));
        assert!(cfg.escalation.reboot_enabled);
    }
}
