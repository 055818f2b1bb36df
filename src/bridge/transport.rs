//! 消息总线传输抽象
//!
//! 桥接层只依赖 Transport trait；连接状态与入站消息统一以 TransportEvent 推给编排循环。
//! MemoryTransport 在进程内记录所有发布，供测试断言顺序与内容。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::OrchestratorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 会话建立（含重连）
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), OrchestratorError>;

    async fn subscribe(&self, topic: &str) -> Result<(), OrchestratorError>;
}

/// 已发布的一条消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Published {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Default)]
struct MemoryInner {
    published: Vec<Published>,
    subscriptions: Vec<String>,
    fail_next: u32,
    hang: bool,
}

/// 进程内传输，测试用
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(Mutex::new(MemoryInner::default())),
                events,
            },
            rx,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.lock()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock().published.clear();
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    /// 接下来 n 次发布返回错误
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// 发布永不返回，模拟断开的 broker
    pub fn set_hang(&self, hang: bool) {
        self.lock().hang = hang;
    }

    pub fn connect(&self) {
        let _ = self.events.send(TransportEvent::Connected);
    }

    pub fn disconnect(&self) {
        let _ = self.events.send(TransportEvent::Disconnected);
    }

    pub fn inject(&self, topic: &str, payload: &str) {
        let _ = self.events.send(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        });
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), OrchestratorError> {
        let hang = {
            let mut inner = self.lock();
            if inner.fail_next > 0 {
                inner.fail_next -= 1;
                return Err(OrchestratorError::TransportFailure(format!(
                    "publish to {topic} rejected"
                )));
            }
            inner.hang
        };
        if hang {
            std::future::pending::<()>().await;
        }
        self.lock().published.push(Published {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), OrchestratorError> {
        self.lock().subscriptions.push(topic.to_string());
        Ok(())
    }
}
