//! 状态投影与事件
//!
//! 看门狗与监管器各自独占内部状态，只通过 watch 通道发布轻量快照（ConnectionSummary / StreamStatus），
//! 状态变化另以 OrchestratorEvent 推送给编排循环与桥接层。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bluetooth::ConnectionStatus;
use crate::escalation::{Component, Tier};
use crate::stream::AudioBackend;

/// 单个音箱的连接状态投影
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionSummary {
    pub name: String,
    pub address: String,
    pub status: ConnectionStatus,
    pub consecutive_failures: u32,
    pub drops: u32,
    pub last_transition: DateTime<Utc>,
}

/// snapclient 进程状态投影
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StreamStatus {
    pub running: bool,
    pub pid: Option<u32>,
    /// 当前绑定的音箱地址
    pub target: Option<String>,
    pub backend: AudioBackend,
    pub restart_count: u32,
    pub last_exit_code: Option<i32>,
    pub volume: Option<u8>,
    pub muted: bool,
}

/// 组件向编排循环推送的事件
#[derive(Clone, Debug, PartialEq)]
pub enum OrchestratorEvent {
    SinkTransition {
        address: String,
        from: ConnectionStatus,
        to: ConnectionStatus,
        at: DateTime<Utc>,
    },
    StreamStarted {
        address: String,
        pid: Option<u32>,
    },
    StreamStopped {
        address: String,
        exit_code: Option<i32>,
        crashed: bool,
    },
    Escalated {
        component: Component,
        tier: Tier,
    },
}
