//! 控制与遥测桥接：唯一接触消息总线的组件
//!
//! 每个会话（含重连）先订阅命令主题、发布发现元数据与 online，之后才发布状态消息。
//! 每次发布都受 publish_timeout 约束；失败计入 bridge 预算，不阻塞编排循环。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::bridge::command::{parse_command, ControlCommand};
use crate::bridge::discovery::{sink_entity, DiscoveryContext, Topics};
use crate::bridge::telemetry::TelemetrySample;
use crate::bridge::transport::Transport;
use crate::core::OrchestratorError;
use crate::escalation::{Component, Escalator, Outcome, Tier};

pub struct ControlBridge {
    transport: Arc<dyn Transport>,
    topics: Topics,
    discovery: DiscoveryContext,
    escalator: Arc<Escalator>,
    publish_timeout: Duration,
    connected: bool,
    /// 本会话已完成订阅 + 发现 + online
    announced: bool,
}

/// 单条状态消息负载
pub fn state_payload(entity: &str, value: &Value, timestamp: DateTime<Utc>) -> Vec<u8> {
    json!({
        "entity": entity,
        "value": value,
        "timestamp": timestamp.to_rfc3339(),
    })
    .to_string()
    .into_bytes()
}

impl ControlBridge {
    pub fn new(
        transport: Arc<dyn Transport>,
        topics: Topics,
        discovery: DiscoveryContext,
        escalator: Arc<Escalator>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            topics,
            discovery,
            escalator,
            publish_timeout,
            connected: false,
            announced: false,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn is_announced(&self) -> bool {
        self.announced
    }

    /// 传输层会话建立
    pub async fn on_connected(&mut self) {
        self.connected = true;
        self.announced = false;
        if let Err(e) = self.announce().await {
            tracing::warn!("Failed to announce on bus: {}", e);
            self.report(Outcome::Failure).await;
        }
    }

    pub fn on_disconnected(&mut self) {
        if self.connected {
            tracing::warn!("Bus session lost, state publishing paused");
        }
        self.connected = false;
        self.announced = false;
    }

    /// 订阅命令主题，发布全部发现消息，最后发布 online
    async fn announce(&mut self) -> Result<(), OrchestratorError> {
        let filter = self.topics.command_filter();
        self.bounded(&filter, self.transport.subscribe(&filter)).await?;

        let messages = self.discovery.messages(&self.topics);
        for message in &messages {
            self.publish(&message.topic, message.payload.to_string().into_bytes(), true)
                .await?;
        }
        self.publish(&self.topics.availability(), b"online".to_vec(), true)
            .await?;

        self.announced = true;
        tracing::info!(
            "Announced {} discovery entities, availability online",
            messages.len()
        );
        Ok(())
    }

    /// 发布一个遥测样本：样本中的实体加上每个音箱的连接状态
    pub async fn publish_telemetry(&mut self, sample: &TelemetrySample) {
        if !self.connected {
            tracing::debug!("Bus not connected, dropping telemetry sample");
            return;
        }
        if !self.announced {
            if let Err(e) = self.announce().await {
                tracing::warn!("Failed to announce on bus: {}", e);
                self.report(Outcome::Failure).await;
                return;
            }
        }

        let mut entities: Vec<(String, Value)> = sample
            .metrics
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for c in &sample.connections {
            entities.push((sink_entity(&c.address), Value::from(c.status.as_str())));
        }

        for (entity, value) in &entities {
            let payload = state_payload(entity, value, sample.timestamp);
            if let Err(e) = self.publish(&self.topics.state(entity), payload, false).await {
                tracing::warn!("Telemetry publish aborted at '{}': {}", entity, e);
                self.report(Outcome::Failure).await;
                return;
            }
        }
        tracing::debug!("Published {} telemetry entities", entities.len());
        self.report(Outcome::Success).await;
    }

    /// 单个实体的即时状态（音量确认等），会话未就绪时丢弃
    pub async fn publish_entity(&mut self, entity: &str, value: Value) {
        if !self.announced {
            tracing::debug!("Bus session not ready, dropping '{}' update", entity);
            return;
        }
        let payload = state_payload(entity, &value, Utc::now());
        if let Err(e) = self.publish(&self.topics.state(entity), payload, false).await {
            tracing::warn!("Failed to publish '{}': {}", entity, e);
            self.report(Outcome::Failure).await;
        }
    }

    /// 解析入站消息；被拒绝的消息记录后丢弃
    pub fn handle_command(&self, topic: &str, payload: &[u8]) -> Option<ControlCommand> {
        match parse_command(&self.topics.base, topic, payload) {
            Ok(command) => {
                tracing::info!("Received command {:?}", command);
                Some(command)
            }
            Err(rejected) => {
                tracing::warn!("Rejected inbound message on {}: {}", topic, rejected);
                None
            }
        }
    }

    /// 关闭时的 offline 发布
    pub fn availability_publisher(&self) -> AvailabilityPublisher {
        AvailabilityPublisher {
            transport: Arc::clone(&self.transport),
            topic: self.topics.availability(),
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), OrchestratorError> {
        self.bounded(topic, self.transport.publish(topic, payload, retain))
            .await
    }

    async fn bounded<F>(&self, topic: &str, fut: F) -> Result<(), OrchestratorError>
    where
        F: std::future::Future<Output = Result<(), OrchestratorError>>,
    {
        match tokio::time::timeout(self.publish_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::TransportFailure(format!(
                "{} timed out after {:?}",
                topic, self.publish_timeout
            ))),
        }
    }

    async fn report(&mut self, outcome: Outcome) {
        if let Some(Tier::Component) = self.escalator.observe(Component::Bridge, outcome).await {
            // 组件级重启：下次发布前重新宣告
            tracing::warn!("Restarting bridge session state");
            self.announced = false;
        }
    }
}

/// 发布 offline 可用性
#[derive(Clone)]
pub struct AvailabilityPublisher {
    transport: Arc<dyn Transport>,
    topic: String,
}

impl AvailabilityPublisher {
    pub async fn offline(&self) -> Result<(), OrchestratorError> {
        self.transport
            .publish(&self.topic, b"offline".to_vec(), true)
            .await
    }
}
