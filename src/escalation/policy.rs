//! 分级升级策略（纯逻辑，不做任何副作用）
//!
//! - Tier 1：组件预算（bluetooth / stream / bridge）耗尽
//! - Tier 2：Tier-1 升级在更长窗口内累计达到阈值
//! - Tier 3：Tier-2 升级累计达到阈值
//!
//! Tier 2/3 各自是一个带冷却期的小状态机（TierGate）：触发后在自己的窗口内不再计数。

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::config::EscalationSection;
use crate::escalation::{Component, FailureBudget, LedgerState, Outcome, Tier};

/// 一个升级层级：预算 + 冷却
#[derive(Debug, Clone)]
pub struct TierGate {
    budget: FailureBudget,
    cooldown_until: Option<DateTime<Utc>>,
}

impl TierGate {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            budget: FailureBudget::new(threshold, window),
            cooldown_until: None,
        }
    }

    /// 记录一次下级升级；冷却期内不计数。触发时进入冷却并返回 true
    pub fn record(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return false;
            }
            self.cooldown_until = None;
        }
        if self.budget.record_failure(now) {
            self.cooldown_until = Some(now + self.budget.window());
            true
        } else {
            false
        }
    }

    pub fn is_cooling(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|u| now < u).unwrap_or(false)
    }

    pub fn count(&self) -> u32 {
        self.budget.count()
    }

    pub fn budget(&self) -> &FailureBudget {
        &self.budget
    }
}

/// 一次升级决定，附带决定时刻的计数（用于日志与事后追溯）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub component: Component,
    pub tier: Tier,
    /// 各层级累计触发次数（含本次）
    pub component_escalations: u64,
    pub service_escalations: u64,
    pub host_escalations: u64,
    /// 本次触发后 Tier-2 / Tier-3 窗口内的计数
    pub service_window_count: u32,
    pub host_window_count: u32,
}

#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    components: HashMap<Component, FailureBudget>,
    service: TierGate,
    host: TierGate,
    totals: [u64; 3],
}

impl EscalationPolicy {
    pub fn new(
        components: HashMap<Component, FailureBudget>,
        service: TierGate,
        host: TierGate,
    ) -> Self {
        Self {
            components,
            service,
            host,
            totals: [0; 3],
        }
    }

    pub fn from_config(cfg: &EscalationSection) -> Self {
        let components = Component::ALL
            .into_iter()
            .map(|c| {
                let b = cfg.budget_for(c);
                (c, FailureBudget::new(b.threshold, Duration::seconds(b.window_secs as i64)))
            })
            .collect();
        Self::new(
            components,
            TierGate::new(
                cfg.service.threshold,
                Duration::seconds(cfg.service.window_secs as i64),
            ),
            TierGate::new(
                cfg.host.threshold,
                Duration::seconds(cfg.host.window_secs as i64),
            ),
        )
    }

    /// 记录一次组件结果；成功清零该组件预算，失败可能触发升级（返回最高层级）
    pub fn observe(
        &mut self,
        component: Component,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Option<Escalation> {
        let budget = self
            .components
            .entry(component)
            .or_insert_with(|| FailureBudget::new(3, Duration::seconds(60)));

        match outcome {
            Outcome::Success => {
                budget.reset();
                None
            }
            Outcome::Failure => {
                if !budget.record_failure(now) {
                    return None;
                }
                self.totals[0] += 1;
                let mut tier = Tier::Component;
                if self.service.record(now) {
                    self.totals[1] += 1;
                    tier = Tier::Service;
                    if self.host.record(now) {
                        self.totals[2] += 1;
                        tier = Tier::Host;
                    }
                }
                Some(Escalation {
                    component,
                    tier,
                    component_escalations: self.totals[0],
                    service_escalations: self.totals[1],
                    host_escalations: self.totals[2],
                    service_window_count: self.service.count(),
                    host_window_count: self.host.count(),
                })
            }
        }
    }

    pub fn budget(&self, component: Component) -> Option<&FailureBudget> {
        self.components.get(&component)
    }

    pub fn service_gate(&self) -> &TierGate {
        &self.service
    }

    pub fn host_gate(&self) -> &TierGate {
        &self.host
    }

    /// Tier-3 状态（跨进程重启保留）
    pub fn ledger_state(&self) -> LedgerState {
        LedgerState {
            host_count: self.host.budget.count(),
            host_window_start: self.host.budget.window_start(),
            host_cooldown_until: self.host.cooldown_until,
        }
    }

    pub fn restore(&mut self, state: &LedgerState) {
        self.host
            .budget
            .restore(state.host_count, state.host_window_start);
        self.host.cooldown_until = state.host_cooldown_until;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn policy(tier1: u32, tier2: u32, tier3: u32) -> EscalationPolicy {
        let components = Component::ALL
            .into_iter()
            .map(|c| (c, FailureBudget::new(tier1, Duration::seconds(60))))
            .collect();
        EscalationPolicy::new(
            components,
            TierGate::new(tier2, Duration::minutes(10)),
            TierGate::new(tier3, Duration::hours(24)),
        )
    }

    #[test]
    fn test_three_failures_fire_exactly_one_tier1() {
        let mut p = policy(3, 3, 2);
        let now = t0();
        assert!(p.observe(Component::Bluetooth, Outcome::Failure, now).is_none());
        assert!(p
            .observe(Component::Bluetooth, Outcome::Failure, now + Duration::seconds(5))
            .is_none());
        let e = p
            .observe(Component::Bluetooth, Outcome::Failure, now + Duration::seconds(10))
            .unwrap();
        assert_eq!(e.tier, Tier::Component);
        assert_eq!(e.component, Component::Bluetooth);
        assert_eq!(e.component_escalations, 1);
        assert_eq!(p.budget(Component::Bluetooth).unwrap().count(), 0);
        // 再来一次失败不会立刻再次触发
        assert!(p
            .observe(Component::Bluetooth, Outcome::Failure, now + Duration::seconds(11))
            .is_none());
    }

    #[test]
    fn test_success_resets_component_budget() {
        let mut p = policy(3, 3, 2);
        let now = t0();
        p.observe(Component::Stream, Outcome::Failure, now);
        p.observe(Component::Stream, Outcome::Failure, now);
        p.observe(Component::Stream, Outcome::Success, now);
        assert_eq!(p.budget(Component::Stream).unwrap().count(), 0);
        assert!(p.observe(Component::Stream, Outcome::Failure, now).is_none());
    }

    #[test]
    fn test_budgets_are_independent_per_component() {
        let mut p = policy(2, 3, 2);
        let now = t0();
        assert!(p.observe(Component::Bluetooth, Outcome::Failure, now).is_none());
        assert!(p.observe(Component::Bridge, Outcome::Failure, now).is_none());
        assert!(p.observe(Component::Bluetooth, Outcome::Failure, now).is_some());
    }

    #[test]
    fn test_tier2_fires_once_then_cools_down() {
        // Tier-1 阈值 1：每次失败都是一次 Tier-1 升级
        let mut p = policy(1, 3, 5);
        let now = t0();
        let tiers: Vec<Tier> = (0..3)
            .map(|i| {
                p.observe(Component::Stream, Outcome::Failure, now + Duration::minutes(i))
                    .unwrap()
                    .tier
            })
            .collect();
        assert_eq!(tiers, vec![Tier::Component, Tier::Component, Tier::Service]);

        // 冷却期内更多的 Tier-1 不计入 Tier-2
        for i in 3..9 {
            let e = p
                .observe(Component::Stream, Outcome::Failure, now + Duration::minutes(i))
                .unwrap();
            assert_eq!(e.tier, Tier::Component);
        }
        assert!(p.service_gate().is_cooling(now + Duration::minutes(9)));
        assert_eq!(p.service_gate().count(), 0);

        // 窗口结束后重新计数
        let later = now + Duration::minutes(2) + Duration::minutes(10);
        assert_eq!(p.observe(Component::Stream, Outcome::Failure, later).unwrap().tier, Tier::Component);
        assert_eq!(p.service_gate().count(), 1);
    }

    #[test]
    fn test_tier3_after_repeated_tier2() {
        let mut p = policy(1, 1, 2);
        let now = t0();
        let first = p.observe(Component::Bridge, Outcome::Failure, now).unwrap();
        assert_eq!(first.tier, Tier::Service);
        // Tier-2 冷却 10 分钟后再次触发
        let second = p
            .observe(Component::Bridge, Outcome::Failure, now + Duration::minutes(11))
            .unwrap();
        assert_eq!(second.tier, Tier::Host);
        assert_eq!(second.service_escalations, 2);
        assert_eq!(second.host_escalations, 1);
    }

    #[test]
    fn test_ledger_roundtrip_preserves_tier3_progress() {
        let mut p = policy(1, 1, 3);
        let now = t0();
        p.observe(Component::Stream, Outcome::Failure, now).unwrap();
        let state = p.ledger_state();
        assert_eq!(state.host_count, 1);

        let mut restarted = policy(1, 1, 3);
        restarted.restore(&state);
        assert_eq!(restarted.host_gate().count(), 1);
    }
}
