//! 升级执行者：把策略决定变成动作
//!
//! 看门狗、监管器、桥接层共享同一个 Escalator，按事件发生顺序调用 observe。
//! Tier-1 只返回给调用方自行重启；Tier-2/3 先记录决定、写台账，再调用 HostControl 并触发关闭。

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};

use crate::core::{OrchestratorError, OrchestratorEvent, ShutdownManager, ShutdownReason};
use crate::escalation::{
    Component, Escalation, EscalationLedger, EscalationPolicy, HostControl, Outcome, Tier,
};

pub struct Escalator {
    policy: Mutex<EscalationPolicy>,
    ledger: Option<EscalationLedger>,
    host: Arc<dyn HostControl>,
    shutdown: Arc<ShutdownManager>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    reboot_enabled: bool,
}

impl Escalator {
    /// 台账存在时恢复 Tier-3 进度；读取失败只告警，从零开始
    pub fn new(
        mut policy: EscalationPolicy,
        ledger: Option<EscalationLedger>,
        host: Arc<dyn HostControl>,
        shutdown: Arc<ShutdownManager>,
        events: mpsc::UnboundedSender<OrchestratorEvent>,
        reboot_enabled: bool,
    ) -> Self {
        if let Some(ref ledger) = ledger {
            match ledger.load() {
                Ok(state) => {
                    if state.host_count > 0 {
                        tracing::info!(
                            "Restored escalation ledger: {} service restart(s) in current window",
                            state.host_count
                        );
                    }
                    policy.restore(&state);
                }
                Err(e) => tracing::warn!(
                    "Escalation ledger {} unreadable ({}), starting fresh",
                    ledger.path().display(),
                    e
                ),
            }
        }
        Self {
            policy: Mutex::new(policy),
            ledger,
            host,
            shutdown,
            events,
            reboot_enabled,
        }
    }

    /// 记录组件结果；返回本次触发的最高层级。关闭开始后不再升级
    pub async fn observe(&self, component: Component, outcome: Outcome) -> Option<Tier> {
        if self.shutdown.is_shutdown() {
            return None;
        }

        let (escalation, ledger_state) = {
            let mut policy = self.policy.lock().await;
            let escalation = policy.observe(component, outcome, Utc::now())?;
            (escalation, policy.ledger_state())
        };

        self.log_decision(&escalation);
        let _ = self.events.send(OrchestratorEvent::Escalated {
            component,
            tier: escalation.tier,
        });

        match escalation.tier {
            Tier::Component => {}
            Tier::Service => {
                self.persist(&ledger_state);
                self.host.restart_self().await;
                self.shutdown.shutdown(ShutdownReason::Escalation(format!(
                    "service restart after repeated {component} failures"
                )));
            }
            Tier::Host => {
                self.persist(&Default::default());
                if self.reboot_enabled {
                    tracing::error!("Requesting host reboot");
                    self.host.request_reboot().await;
                } else {
                    tracing::warn!("Host reboot disabled by configuration, restarting service instead");
                    self.host.restart_self().await;
                }
                self.shutdown.shutdown(ShutdownReason::Escalation(format!(
                    "host reboot after repeated {component} failures"
                )));
            }
        }

        Some(escalation.tier)
    }

    /// 当前策略快照（测试与遥测用）
    pub async fn policy(&self) -> EscalationPolicy {
        self.policy.lock().await.clone()
    }

    fn log_decision(&self, e: &Escalation) {
        let err = OrchestratorError::EscalationFired {
            component: e.component,
            tier: e.tier,
        };
        let fields = serde_json::json!({
            "event": "escalation",
            "component": e.component.as_str(),
            "tier": e.tier.as_str(),
            "outcome": "failure",
            "component_escalations": e.component_escalations,
            "service_escalations": e.service_escalations,
            "host_escalations": e.host_escalations,
            "service_window_count": e.service_window_count,
            "host_window_count": e.host_window_count,
        });
        match e.tier {
            Tier::Component => tracing::warn!(escalation = %fields.to_string(), "{}", err),
            Tier::Service | Tier::Host => {
                tracing::error!(escalation = %fields.to_string(), "{}", err)
            }
        }
    }

    fn persist(&self, state: &crate::escalation::LedgerState) {
        if let Some(ref ledger) = self.ledger {
            if let Err(e) = ledger.save(state) {
                tracing::warn!("Failed to write escalation ledger: {}", e);
            }
        }
    }
}
