//! 升级台账持久化
//!
//! Tier-2 会重启整个服务进程，Tier-3 需要跨重启统计 Tier-2 次数，
//! 因此把 Tier-3 的计数与冷却写入单个 JSON 文件。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 跨进程保留的 Tier-3 状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub host_count: u32,
    pub host_window_start: Option<DateTime<Utc>>,
    pub host_cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct EscalationLedger {
    path: PathBuf,
}

impl EscalationLedger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件不存在时返回默认状态
    pub fn load(&self) -> anyhow::Result<LedgerState> {
        if !self.path.exists() {
            return Ok(LedgerState::default());
        }
        let data = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// 父目录不存在时自动创建
    pub fn save(&self, state: &LedgerState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(state)?)?;
        Ok(())
    }
}
