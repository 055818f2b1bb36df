//! 单个音箱的连接状态机
//!
//! 合法迁移：
//! - Unknown / Disconnected → Connecting（发起调和）
//! - Connecting → Connected（成功，失败计数清零）
//! - Connected → Disconnected（掉线）
//! - 任意 → Failed（连续失败超过阈值）
//! - 外部重置 → Unknown
//!
//! 不存在 Disconnected → Connected 的直接迁移：观察到已连接时也先经过 Connecting。

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Unknown,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Unknown => "unknown",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Failed => "failed",
        }
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (a, b) if *a == b => false,
            (_, Unknown) | (_, Failed) => true,
            (Unknown | Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Disconnected) => true,
            (Connecting, Disconnected) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次状态迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
    pub at: DateTime<Utc>,
}

/// 看门狗独占的每音箱状态
#[derive(Debug, Clone)]
pub struct ConnectionState {
    status: ConnectionStatus,
    consecutive_failures: u32,
    drops: u32,
    last_transition: DateTime<Utc>,
    /// 退避：已失败的重连次数（用于计算下一次延迟）
    attempt: u32,
    next_attempt_at: Option<Instant>,
}

impl ConnectionState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: ConnectionStatus::Unknown,
            consecutive_failures: 0,
            drops: 0,
            last_transition: now,
            attempt: 0,
            next_attempt_at: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn drops(&self) -> u32 {
        self.drops
    }

    pub fn last_transition(&self) -> DateTime<Utc> {
        self.last_transition
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    /// 退避期内不应发起重连
    pub fn in_backoff(&self, now: Instant) -> bool {
        self.next_attempt_at.map(|t| now < t).unwrap_or(false)
    }

    /// 迁移到 next；非法迁移被拒绝并返回 None
    pub fn transition(&mut self, next: ConnectionStatus, now: DateTime<Utc>) -> Option<Transition> {
        if !self.status.can_transition_to(next) {
            if self.status != next {
                tracing::warn!("Rejected illegal transition {} -> {}", self.status, next);
            }
            return None;
        }
        let from = self.status;
        self.status = next;
        self.last_transition = now;
        match next {
            ConnectionStatus::Connected => {
                self.consecutive_failures = 0;
                self.attempt = 0;
                self.next_attempt_at = None;
            }
            ConnectionStatus::Disconnected if from == ConnectionStatus::Connected => {
                self.drops += 1;
            }
            _ => {}
        }
        Some(Transition { from, to: next, at: now })
    }

    /// 记录一次失败并安排下一次尝试时间
    pub fn record_failure(&mut self, retry_at: Instant) {
        self.consecutive_failures += 1;
        self.attempt = self.attempt.saturating_add(1);
        self.next_attempt_at = Some(retry_at);
    }

    /// 外部重置：回到 Unknown，清空失败与退避
    pub fn reset(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        self.consecutive_failures = 0;
        self.attempt = 0;
        self.next_attempt_at = None;
        self.transition(ConnectionStatus::Unknown, now)
    }
}
