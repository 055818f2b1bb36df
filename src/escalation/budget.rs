//! 失败预算：窗口内计数
//!
//! 第一次失败开启窗口；窗口过期（自 window_start 起超过 window 且未触发）时计数清零；
//! 达到阈值时触发并重置。

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct FailureBudget {
    count: u32,
    window_start: Option<DateTime<Utc>>,
    threshold: u32,
    window: Duration,
}

impl FailureBudget {
    /// threshold 为 0 时按 1 处理
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            count: 0,
            window_start: None,
            threshold: threshold.max(1),
            window,
        }
    }

    /// 记录一次失败；达到阈值时重置并返回 true
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        self.expire(now);
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.count += 1;
        if self.count >= self.threshold {
            self.reset();
            true
        } else {
            false
        }
    }

    /// 窗口已过期则清零
    pub fn expire(&mut self, now: DateTime<Utc>) {
        if let Some(start) = self.window_start {
            if now - start >= self.window {
                self.reset();
            }
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.window_start = None;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_start(&self) -> Option<DateTime<Utc>> {
        self.window_start
    }

    /// 从持久化状态恢复
    pub fn restore(&mut self, count: u32, window_start: Option<DateTime<Utc>>) {
        self.count = count.min(self.threshold.saturating_sub(1));
        self.window_start = if self.count == 0 { None } else { window_start };
    }
}
