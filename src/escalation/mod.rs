//! 失败升级：预算、分级策略、台账、主机控制
//!
//! 组件重启 < 服务重启 < 主机重启：代价逐级上升，只有低级补救持续无效时才升级。

pub mod budget;
pub mod escalator;
pub mod host;
pub mod ledger;
pub mod policy;

use serde::{Deserialize, Serialize};

pub use budget::FailureBudget;
pub use escalator::Escalator;
pub use host::{HostAction, HostControl, RecordingHost, SystemHostControl};
pub use ledger::{EscalationLedger, LedgerState};
pub use policy::{Escalation, EscalationPolicy, TierGate};

/// 拥有独立失败预算的逻辑组件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Bluetooth,
    Stream,
    Bridge,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Bluetooth, Component::Stream, Component::Bridge];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Bluetooth => "bluetooth",
            Component::Stream => "stream",
            Component::Bridge => "bridge",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// 升级层级，按代价递增排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// 只重启失败的子系统
    Component,
    /// 重启整个编排服务
    Service,
    /// 重启主机
    Host,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Component => "component",
            Tier::Service => "service",
            Tier::Host => "host",
        }
    }
}
