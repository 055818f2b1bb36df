//! 编排器错误分类
//!
//! 每个 tick 内的失败都在本地分类并计入对应组件的失败预算，不会向上传播导致主循环崩溃；
//! 只有 FatalConfig 会终止进程，且只发生在任何组件创建之前。

use thiserror::Error;

use crate::escalation::{Component, Tier};
use crate::exec::CommandError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 适配器命令失败或超时（可恢复，计入 bluetooth 预算）
    #[error("Reconcile failed for {address}: {reason}")]
    ReconcileFailure { address: String, reason: String },

    /// 受监管子进程意外退出（可恢复，计入 stream 预算并退避重启）
    #[error("Stream process for {address} crashed (exit code {exit_code:?})")]
    ProcessCrash {
        address: String,
        exit_code: Option<i32>,
    },

    /// 发布/订阅失败（可恢复，计入 bridge 预算，不阻塞主循环）
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// 预算耗尽触发补救，本身不继续传播
    #[error("Escalation fired: tier {} for component {component}", .tier.as_str())]
    EscalationFired { component: Component, tier: Tier },

    /// 启动时配置缺失或非法，进程立即退出
    #[error("Fatal config error: {0}")]
    FatalConfig(String),

    /// 混音器命令需要已绑定的音箱
    #[error("No active sink is bound to the stream")]
    NoActiveSink,

    /// 监管器任务已退出（关闭进行中）
    #[error("Stream supervisor is not running")]
    SupervisorUnavailable,

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_display_names_tier() {
        let e = OrchestratorError::EscalationFired {
            component: Component::Stream,
            tier: Tier::Service,
        };
        assert_eq!(e.to_string(), "Escalation fired: tier service for component stream");
    }
}
