//! rumqttc 实现的 MQTT 传输
//!
//! 事件循环在独立任务里轮询；断线后 rumqttc 下次 poll 自动重连，这里只负责节流与事件转换。
//! 遗嘱消息保证进程异常消失时 `<base>/status` 变为 offline。
//! 配置了证书时走 TLS（rustls），同时出示客户端证书。

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport as WireTransport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::transport::{Transport, TransportEvent};
use crate::core::OrchestratorError;

/// 断线后再次 poll 前的等待
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// 遗嘱主题，负载固定为 offline
    pub availability_topic: String,
    pub tls: Option<MqttTls>,
}

/// TLS 证书文件（PEM）
#[derive(Debug, Clone)]
pub struct MqttTls {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl MqttTls {
    fn configuration(&self) -> Result<TlsConfiguration, OrchestratorError> {
        let read = |path: &PathBuf| {
            std::fs::read(path).map_err(|e| {
                OrchestratorError::FatalConfig(format!("cannot read {}: {e}", path.display()))
            })
        };
        Ok(TlsConfiguration::Simple {
            ca: read(&self.ca_cert)?,
            alpn: None,
            client_auth: Some((read(&self.client_cert)?, read(&self.client_key)?)),
        })
    }
}

/// 由设置构造客户端选项；证书不可读是 FatalConfig
pub fn mqtt_options(settings: &MqttSettings) -> Result<MqttOptions, OrchestratorError> {
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(settings.keep_alive);
    options.set_last_will(LastWill::new(
        &settings.availability_topic,
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    if let Some(ref username) = settings.username {
        options.set_credentials(username, settings.password.clone().unwrap_or_default());
    }
    if let Some(ref tls) = settings.tls {
        options.set_transport(WireTransport::tls_with_config(tls.configuration()?));
    }
    Ok(options)
}

#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    /// 建立客户端并启动事件循环任务。
    /// 事件循环在发出 DISCONNECT 或 stop 取消后退出，因此关闭期间的 offline 仍能送达
    pub fn connect(
        settings: &MqttSettings,
        stop: CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>, JoinHandle<()>), OrchestratorError>
    {
        let options = mqtt_options(settings)?;
        let (client, eventloop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::unbounded_channel();
        tracing::info!(
            "Connecting to MQTT broker {}:{} as {} (tls={})",
            settings.host,
            settings.port,
            settings.client_id,
            settings.tls.is_some()
        );
        let task = tokio::spawn(drive_eventloop(eventloop, tx, stop));

        Ok((Self { client }, rx, task))
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!("MQTT disconnect: {}", e);
        }
    }
}

async fn drive_eventloop(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    stop: CancellationToken,
) {
    let mut connected = false;
    loop {
        let polled = tokio::select! {
            _ = stop.cancelled() => break,
            polled = eventloop.poll() => polled,
        };
        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected = true;
                tracing::info!("MQTT session established");
                let _ = events.send(TransportEvent::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let _ = events.send(TransportEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if connected {
                    tracing::warn!("MQTT connection lost: {}", e);
                    let _ = events.send(TransportEvent::Disconnected);
                    connected = false;
                } else {
                    tracing::debug!("MQTT connect attempt failed: {}", e);
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    tracing::debug!("MQTT event loop stopped");
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), OrchestratorError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| OrchestratorError::TransportFailure(format!("publish {topic}: {e}")))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), OrchestratorError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| OrchestratorError::TransportFailure(format!("subscribe {topic}: {e}")))
    }
}
