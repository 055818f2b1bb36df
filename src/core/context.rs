//! 编排上下文：启动时构造一次，显式传给各组件
//!
//! 持有配置、已校验的音箱列表、外部能力（命令执行、进程启动、主机控制）、
//! 关闭管理器与共享的 Escalator。没有全局单例。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::bluetooth::{BluetoothCtl, SinkTarget, WatchdogSettings};
use crate::bridge::{DiscoveryContext, MqttSettings, MqttTls, Topics};
use crate::config::AppConfig;
use crate::core::{OrchestratorEvent, ShutdownManager, ShutdownReason};
use crate::escalation::{EscalationLedger, EscalationPolicy, Escalator, HostControl};
use crate::exec::{CommandRunner, ProcessLauncher};
use crate::stream::StreamSettings;

/// 关闭时允许看门狗进行中的 tick 完成的时长
const WATCHDOG_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct OrchestratorContext {
    pub config: AppConfig,
    pub targets: Vec<SinkTarget>,
    pub runner: Arc<dyn CommandRunner>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub shutdown: Arc<ShutdownManager>,
    pub escalator: Arc<Escalator>,
    pub events: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl OrchestratorContext {
    /// 构造上下文；返回组件事件的接收端
    pub fn init(
        config: AppConfig,
        targets: Vec<SinkTarget>,
        runner: Arc<dyn CommandRunner>,
        launcher: Arc<dyn ProcessLauncher>,
        host: Arc<dyn HostControl>,
    ) -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(ShutdownManager::new());
        let ledger = config
            .escalation
            .ledger_path
            .as_ref()
            .map(EscalationLedger::new);
        let escalator = Arc::new(Escalator::new(
            EscalationPolicy::from_config(&config.escalation),
            ledger,
            host,
            Arc::clone(&shutdown),
            events.clone(),
            config.escalation.reboot_enabled,
        ));

        tracing::info!(
            "Orchestrator context ready: instance={}, {} sink(s), backend={}",
            config.identity.instance_name,
            targets.len(),
            config.stream.backend.as_str()
        );

        (
            Self {
                config,
                targets,
                runner,
                launcher,
                shutdown,
                escalator,
                events,
            },
            events_rx,
        )
    }

    /// 触发关闭（信号或致命错误）
    pub fn shutdown(&self, reason: ShutdownReason) {
        self.shutdown.shutdown(reason);
    }

    pub fn bluetooth_ctl(&self) -> BluetoothCtl {
        BluetoothCtl::new(
            Arc::clone(&self.runner),
            Duration::from_secs(self.config.bluetooth.command_timeout_secs),
        )
    }

    pub fn watchdog_settings(&self) -> WatchdogSettings {
        WatchdogSettings {
            adapter: self.config.bluetooth.adapter.clone(),
            interval: self.config.watchdog_interval(),
            failure_threshold: self.config.bluetooth.failure_threshold,
            backoff: self.config.backoff_policy(),
            shutdown_grace: WATCHDOG_SHUTDOWN_GRACE,
        }
    }

    pub fn stream_settings(&self) -> StreamSettings {
        let s = &self.config.stream;
        StreamSettings {
            backend: s.backend,
            snapclient_path: s.snapclient_path.clone(),
            server_host: s.server_host.clone(),
            server_port: s.server_port,
            latency_ms: s.latency_ms,
            client_name: s.resolved_client_name(&self.config.identity),
            audio_device: s.audio_device.clone(),
            adapter: self.config.bluetooth.adapter.clone(),
            mixer_control: s.mixer_control.clone(),
            stop_grace: Duration::from_secs(s.stop_grace_secs),
            restart_backoff: Duration::from_secs(s.restart_backoff_secs),
            restart_backoff_max: Duration::from_secs(s.restart_backoff_max_secs),
            stable_after: Duration::from_secs(s.stable_after_secs),
            mixer_timeout: Duration::from_secs(s.mixer_timeout_secs),
        }
    }

    pub fn topics(&self) -> Topics {
        Topics::new(
            self.config.mqtt.resolved_base_topic(&self.config.identity),
            self.config.mqtt.discovery_prefix.clone(),
        )
    }

    pub fn discovery(&self) -> DiscoveryContext {
        DiscoveryContext {
            instance_name: self.config.identity.instance_name.clone(),
            friendly_name: self.config.identity.friendly_name.clone(),
            metrics: self.config.telemetry.metrics.clone(),
            sinks: self.targets.clone(),
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        let m = &self.config.mqtt;
        MqttSettings {
            host: m.host.clone(),
            port: m.port,
            client_id: m.resolved_client_id(&self.config.identity),
            username: m.username.clone(),
            password: m.password.clone(),
            keep_alive: Duration::from_secs(m.keepalive_secs.max(5)),
            availability_topic: self.topics().availability(),
            tls: match (m.tls.enabled, &m.tls.ca_cert, &m.tls.client_cert, &m.tls.client_key) {
                (true, Some(ca), Some(cert), Some(key)) => Some(MqttTls {
                    ca_cert: ca.clone(),
                    client_cert: cert.clone(),
                    client_key: key.clone(),
                }),
                _ => None,
            },
        }
    }
}
