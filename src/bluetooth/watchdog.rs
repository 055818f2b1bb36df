//! 连接看门狗：按固定间隔调和期望状态与实际连接状态
//!
//! 每个 tick 按配置顺序处理 keepalive 音箱：查询 `bluetoothctl info`，
//! 根据结果推进状态机，必要时发起 `connect`。每次迁移推送 SinkTransition 事件，
//! 每次失败/成功上报 Escalator（bluetooth 组件）。
//!
//! 看门狗是唯一发出适配器命令的任务，因此适配器命令天然串行。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bluetooth::{
    BackoffPolicy, BluetoothCtl, ConnectionState, ConnectionStatus, SinkTarget, Transition,
};
use crate::core::{ConnectionSummary, OrchestratorEvent};
use crate::escalation::{Component, Escalator, Outcome, Tier};

/// 看门狗运行参数
#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub adapter: String,
    pub interval: Duration,
    /// 连续失败超过该值进入 Failed
    pub failure_threshold: u32,
    pub backoff: BackoffPolicy,
    /// 关闭时允许进行中的 tick 完成的时长
    pub shutdown_grace: Duration,
}

/// 看门狗接受的外部指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogCommand {
    /// 重置指定音箱（空表示所有未连接的音箱）并立即调和
    Reconnect(Vec<String>),
}

/// tick 的提前终止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickFlow {
    Continue,
    /// Tier-2/3 已触发，关闭进行中
    Halt,
}

pub struct ConnectionWatchdog {
    targets: Vec<SinkTarget>,
    states: HashMap<String, ConnectionState>,
    ctl: BluetoothCtl,
    escalator: Arc<Escalator>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    snapshot_tx: watch::Sender<Vec<ConnectionSummary>>,
    settings: WatchdogSettings,
}

impl ConnectionWatchdog {
    pub fn new(
        targets: Vec<SinkTarget>,
        ctl: BluetoothCtl,
        escalator: Arc<Escalator>,
        events: mpsc::UnboundedSender<OrchestratorEvent>,
        settings: WatchdogSettings,
    ) -> (Self, watch::Receiver<Vec<ConnectionSummary>>) {
        let now = Utc::now();
        let states = targets
            .iter()
            .map(|t| (t.address.clone(), ConnectionState::new(now)))
            .collect();
        let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());
        let watchdog = Self {
            targets,
            states,
            ctl,
            escalator,
            events,
            snapshot_tx,
            settings,
        };
        watchdog.publish_snapshot();
        (watchdog, snapshot_rx)
    }

    pub fn targets(&self) -> &[SinkTarget] {
        &self.targets
    }

    pub fn state(&self, address: &str) -> Option<&ConnectionState> {
        self.states.get(address)
    }

    pub fn summaries(&self) -> Vec<ConnectionSummary> {
        self.targets
            .iter()
            .filter_map(|t| {
                self.states.get(&t.address).map(|s| ConnectionSummary {
                    name: t.name.clone(),
                    address: t.address.clone(),
                    status: s.status(),
                    consecutive_failures: s.consecutive_failures(),
                    drops: s.drops(),
                    last_transition: s.last_transition(),
                })
            })
            .collect()
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.summaries());
    }

    /// 启动时初始化适配器并信任所有音箱；失败只记录
    pub async fn prepare(&mut self) {
        tracing::info!(
            "Preparing adapter {} for {} sink(s)",
            self.settings.adapter,
            self.targets.len()
        );
        let failures = self.ctl.prepare_adapter(&self.settings.adapter).await;
        if !failures.is_empty() {
            // 整个准备阶段只计一次失败
            self.escalator
                .observe(Component::Bluetooth, Outcome::Failure)
                .await;
        }
        for target in &self.targets {
            if let Err(e) = self.ctl.trust(&target.address).await {
                tracing::warn!("Could not trust {} ({}): {}", target.name, target.address, e);
            }
        }
    }

    pub async fn tick(&mut self) {
        self.tick_at(Instant::now()).await;
    }

    /// 以给定时刻执行一次调和（测试可注入时间以驱动退避）
    pub async fn tick_at(&mut self, now: Instant) {
        let addresses: Vec<String> = self
            .targets
            .iter()
            .filter(|t| t.keepalive)
            .map(|t| t.address.clone())
            .collect();

        for address in addresses {
            if self.reconcile(&address, now).await == TickFlow::Halt {
                break;
            }
        }
        self.publish_snapshot();
    }

    async fn reconcile(&mut self, address: &str, now: Instant) -> TickFlow {
        let Some(state) = self.states.get(address) else {
            return TickFlow::Continue;
        };
        let status = state.status();
        if status == ConnectionStatus::Failed {
            return TickFlow::Continue;
        }
        if state.in_backoff(now) {
            tracing::trace!("{} in backoff, skipping", address);
            return TickFlow::Continue;
        }

        let info = match self.ctl.info(address).await {
            Ok(info) => info,
            Err(e) => return self.on_failure(address, &e.to_string(), now).await,
        };

        if info.connected {
            if status != ConnectionStatus::Connected {
                self.transition(address, ConnectionStatus::Connecting);
                self.transition(address, ConnectionStatus::Connected);
                tracing::info!("{} reported connected", address);
                return self.report(Outcome::Success).await;
            }
            return TickFlow::Continue;
        }

        if status == ConnectionStatus::Connected {
            tracing::warn!("{} dropped its connection", address);
            self.transition(address, ConnectionStatus::Disconnected);
            if self.report(Outcome::Failure).await == TickFlow::Halt {
                return TickFlow::Halt;
            }
        }

        self.transition(address, ConnectionStatus::Connecting);
        let outcome = self.ctl.connect_verified(address).await;
        if outcome.is_connected() {
            tracing::info!("{} connected ({})", address, outcome.describe());
            self.transition(address, ConnectionStatus::Connected);
            self.report(Outcome::Success).await
        } else {
            self.on_failure(address, &outcome.describe(), now).await
        }
    }

    async fn on_failure(&mut self, address: &str, reason: &str, now: Instant) -> TickFlow {
        let threshold = self.settings.failure_threshold;
        let backoff = self.settings.backoff;
        let mut give_up = false;
        if let Some(state) = self.states.get_mut(address) {
            let delay = backoff.next(state.attempt());
            state.record_failure(now + delay);
            tracing::warn!(
                "Reconcile failed for {}: {} (failures={}, retry in {:?})",
                address,
                reason,
                state.consecutive_failures(),
                delay
            );
            give_up = state.consecutive_failures() > threshold;
        }
        if give_up {
            tracing::error!("{} exceeded {} consecutive failures, marking failed", address, threshold);
            self.transition(address, ConnectionStatus::Failed);
        }
        self.report(Outcome::Failure).await
    }

    async fn report(&mut self, outcome: Outcome) -> TickFlow {
        match self.escalator.observe(Component::Bluetooth, outcome).await {
            Some(Tier::Component) => {
                tracing::warn!("Bluetooth component restart: resetting unconnected sinks");
                self.reset_unconnected();
                TickFlow::Continue
            }
            Some(Tier::Service) | Some(Tier::Host) => TickFlow::Halt,
            None => TickFlow::Continue,
        }
    }

    fn transition(&mut self, address: &str, to: ConnectionStatus) -> Option<Transition> {
        let t = self.states.get_mut(address)?.transition(to, Utc::now())?;
        tracing::debug!("{}: {} -> {}", address, t.from, t.to);
        // 事件接收方读取快照时必须已能看到这次迁移
        self.publish_snapshot();
        let _ = self.events.send(OrchestratorEvent::SinkTransition {
            address: address.to_string(),
            from: t.from,
            to: t.to,
            at: t.at,
        });
        Some(t)
    }

    /// Tier-1：所有未连接的音箱回到 Unknown，清空失败与退避
    fn reset_unconnected(&mut self) {
        let addresses: Vec<String> = self
            .targets
            .iter()
            .filter(|t| {
                self.states
                    .get(&t.address)
                    .map(|s| s.status() != ConnectionStatus::Connected)
                    .unwrap_or(false)
            })
            .map(|t| t.address.clone())
            .collect();
        self.reset(&addresses);
    }

    /// 外部重置指定音箱（未知地址忽略）
    pub fn reset(&mut self, addresses: &[String]) {
        let now = Utc::now();
        let mut transitions = Vec::new();
        for address in addresses {
            let Some(state) = self.states.get_mut(address) else {
                tracing::debug!("Ignoring reset for unknown sink {}", address);
                continue;
            };
            if let Some(t) = state.reset(now) {
                transitions.push((address.clone(), t));
            }
        }
        self.publish_snapshot();
        for (address, t) in transitions {
            let _ = self.events.send(OrchestratorEvent::SinkTransition {
                address,
                from: t.from,
                to: t.to,
                at: t.at,
            });
        }
    }

    async fn handle_command(&mut self, cmd: WatchdogCommand) {
        match cmd {
            WatchdogCommand::Reconnect(addresses) if addresses.is_empty() => {
                tracing::info!("Reconnect requested for all unconnected sinks");
                self.reset_unconnected();
            }
            WatchdogCommand::Reconnect(addresses) => {
                tracing::info!("Reconnect requested for {:?}", addresses);
                self.reset(&addresses);
            }
        }
        self.tick().await;
    }

    /// 看门狗任务：准备适配器后按间隔 tick，直到关闭。
    /// 关闭时进行中的 tick 有 shutdown_grace 完成，超时则直接丢弃（子进程 kill_on_drop）
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<WatchdogCommand>,
        shutdown: CancellationToken,
    ) {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = self.prepare() => {}
        }

        let grace = self.settings.shutdown_grace;
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(cmd) = commands.recv() => {
                    if Self::bounded(self.handle_command(cmd), &shutdown, grace).await {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if Self::bounded(self.tick(), &shutdown, grace).await {
                        break;
                    }
                }
            }
        }
        tracing::info!("Connection watchdog stopped");
    }

    /// 运行一次调和；期间收到关闭则给予宽限期。返回是否已关闭
    async fn bounded<F>(work: F, shutdown: &CancellationToken, grace: Duration) -> bool
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(work);
        tokio::select! {
            _ = &mut work => shutdown.is_cancelled(),
            _ = shutdown.cancelled() => {
                if tokio::time::timeout(grace, &mut work).await.is_err() {
                    tracing::warn!("Watchdog tick did not finish within {:?}, abandoning it", grace);
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ShutdownManager;
    use crate::escalation::{EscalationPolicy, FailureBudget, RecordingHost, TierGate};
    use crate::exec::{CommandOutput, MockResponse, MockRunner};
    use ConnectionStatus::*;

    const A: &str = "AA:BB:CC:DD:EE:01";
    const B: &str = "AA:BB:CC:DD:EE:02";

    struct Harness {
        watchdog: ConnectionWatchdog,
        runner: Arc<MockRunner>,
        snapshot: watch::Receiver<Vec<ConnectionSummary>>,
        events: mpsc::UnboundedReceiver<OrchestratorEvent>,
        shutdown: Arc<ShutdownManager>,
    }

    impl Harness {
        fn transitions(&mut self) -> Vec<(String, ConnectionStatus, ConnectionStatus)> {
            let mut out = Vec::new();
            while let Ok(ev) = self.events.try_recv() {
                if let OrchestratorEvent::SinkTransition { address, from, to, .. } = ev {
                    out.push((address, from, to));
                }
            }
            out
        }

        fn escalations(&mut self) -> Vec<Tier> {
            let mut out = Vec::new();
            while let Ok(ev) = self.events.try_recv() {
                if let OrchestratorEvent::Escalated { tier, .. } = ev {
                    out.push(tier);
                }
            }
            out
        }
    }

    fn harness(targets: Vec<SinkTarget>, budget: u32, failure_threshold: u32) -> Harness {
        let runner = Arc::new(MockRunner::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(ShutdownManager::new());
        let components = Component::ALL
            .into_iter()
            .map(|c| (c, FailureBudget::new(budget, chrono::Duration::seconds(60))))
            .collect();
        let policy = EscalationPolicy::new(
            components,
            TierGate::new(10, chrono::Duration::minutes(10)),
            TierGate::new(10, chrono::Duration::hours(24)),
        );
        let escalator = Arc::new(Escalator::new(
            policy,
            None,
            Arc::new(RecordingHost::new()),
            shutdown.clone(),
            tx.clone(),
            true,
        ));
        let settings = WatchdogSettings {
            adapter: "hci0".into(),
            interval: Duration::from_secs(10),
            failure_threshold,
            backoff: BackoffPolicy {
                first: Duration::from_secs(10),
                max: Duration::from_secs(40),
                factor: 2.0,
            },
            shutdown_grace: Duration::from_secs(2),
        };
        let ctl = BluetoothCtl::new(runner.clone(), Duration::from_secs(5));
        let (watchdog, snapshot) = ConnectionWatchdog::new(targets, ctl, escalator, tx, settings);
        Harness {
            watchdog,
            runner,
            snapshot,
            events: rx,
            shutdown,
        }
    }

    fn sink(addr: &str, keepalive: bool) -> SinkTarget {
        SinkTarget::new("speaker", addr, keepalive, false).unwrap()
    }

    fn info(connected: bool) -> MockResponse {
        let flag = if connected { "yes" } else { "no" };
        MockResponse::ok(&format!("Device {A}\n\tPaired: yes\n\tConnected: {flag}\n"))
    }

    #[tokio::test]
    async fn test_connects_unknown_target() {
        let mut h = harness(vec![sink(A, true)], 3, 5);
        h.runner.on("bluetoothctl", "info", info(false));
        h.runner.on("bluetoothctl", "connect", MockResponse::ok("Connection successful"));

        h.watchdog.tick().await;

        assert_eq!(
            h.transitions(),
            vec![(A.into(), Unknown, Connecting), (A.into(), Connecting, Connected)]
        );
        assert_eq!(h.snapshot.borrow()[0].status, Connected);
    }

    #[tokio::test]
    async fn test_observed_connected_passes_through_connecting() {
        let mut h = harness(vec![sink(A, true)], 3, 5);
        h.runner.on("bluetoothctl", "info", info(true));

        h.watchdog.tick().await;

        assert_eq!(
            h.transitions(),
            vec![(A.into(), Unknown, Connecting), (A.into(), Connecting, Connected)]
        );
        assert_eq!(h.runner.calls_matching("connect"), 0);
    }

    #[tokio::test]
    async fn test_unconfirmed_connect_counts_as_failure() {
        let mut h = harness(vec![sink(A, true)], 10, 5);
        h.runner.on("bluetoothctl", "info", info(false));
        h.runner.on("bluetoothctl", "connect", MockResponse::ok("Attempting to connect"));

        h.watchdog.tick().await;

        assert_eq!(h.transitions(), vec![(A.into(), Unknown, Connecting)]);
        let state = h.watchdog.state(A).unwrap();
        assert_eq!(state.consecutive_failures(), 1);
        assert_eq!(state.drops(), 0);
        assert_eq!(h.runner.calls_matching(&format!("info {A}")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_current_when_transition_event_arrives() {
        let h = harness(vec![sink(A, true), sink(B, true)], 10, 5);
        h.runner.on("bluetoothctl", &format!("info {A}"), info(true));
        h.runner.on(
            "bluetoothctl",
            &format!("info {B}"),
            MockResponse::Slow(
                Duration::from_secs(3),
                CommandOutput {
                    exit_code: Some(0),
                    stdout: "\tConnected: no\n".into(),
                    ..Default::default()
                },
            ),
        );
        let Harness {
            mut watchdog,
            snapshot,
            mut events,
            ..
        } = h;
        let task = tokio::spawn(async move { watchdog.tick().await });

        // B 的 info 仍在进行，A 的 Connected 事件已经送达
        loop {
            match events.recv().await {
                Some(OrchestratorEvent::SinkTransition { address, to: Connected, .. })
                    if address == A =>
                {
                    break
                }
                Some(_) => continue,
                None => panic!("watchdog dropped its event sender"),
            }
        }
        assert_eq!(snapshot.borrow()[0].status, Connected);
        assert!(!task.is_finished());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_never_jumps_back_to_connected() {
        let mut h = harness(vec![sink(A, true)], 10, 5);
        h.runner.on("bluetoothctl", "info", info(true));
        h.watchdog.tick().await;
        h.transitions();

        h.runner.on("bluetoothctl", "info", info(false));
        h.runner.on("bluetoothctl", "connect", MockResponse::ok("Connection successful"));
        h.watchdog.tick().await;

        let seen = h.transitions();
        assert_eq!(
            seen,
            vec![
                (A.into(), Connected, Disconnected),
                (A.into(), Disconnected, Connecting),
                (A.into(), Connecting, Connected),
            ]
        );
        assert!(!seen.iter().any(|(_, f, t)| *f == Disconnected && *t == Connected));
        assert_eq!(h.watchdog.state(A).unwrap().drops(), 1);
    }

    #[tokio::test]
    async fn test_three_failures_fire_one_tier1_and_reset_target() {
        let mut h = harness(vec![sink(A, true)], 3, 5);
        h.runner.on("bluetoothctl", "info", info(false));
        h.runner.on("bluetoothctl", "connect", MockResponse::fail(1, "Failed to connect"));

        let t0 = Instant::now();
        h.watchdog.tick_at(t0).await;
        h.watchdog.tick_at(t0 + Duration::from_secs(15)).await;
        assert_eq!(h.watchdog.state(A).unwrap().consecutive_failures(), 2);

        h.watchdog.tick_at(t0 + Duration::from_secs(40)).await;

        assert_eq!(h.escalations(), vec![Tier::Component]);
        let state = h.watchdog.state(A).unwrap();
        assert_eq!(state.status(), Unknown);
        assert_eq!(state.consecutive_failures(), 0);
        assert!(state.next_attempt_at().is_none());
        assert!(!h.shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn test_backoff_skips_target_until_retry_time() {
        let mut h = harness(vec![sink(A, true)], 10, 5);
        h.runner.on("bluetoothctl", "info", info(false));
        h.runner.on("bluetoothctl", "connect", MockResponse::Timeout);

        let t0 = Instant::now();
        h.watchdog.tick_at(t0).await;
        let calls = h.runner.calls().len();

        h.watchdog.tick_at(t0 + Duration::from_secs(5)).await;
        assert_eq!(h.runner.calls().len(), calls);

        h.watchdog.tick_at(t0 + Duration::from_secs(10)).await;
        assert!(h.runner.calls().len() > calls);
    }

    #[tokio::test]
    async fn test_failed_target_stops_until_reconnect() {
        let mut h = harness(vec![sink(A, true)], 100, 2);
        h.runner.on("bluetoothctl", "info", info(false));
        h.runner.on("bluetoothctl", "connect", MockResponse::fail(1, "not available"));

        let mut now = Instant::now();
        for _ in 0..3 {
            h.watchdog.tick_at(now).await;
            now += Duration::from_secs(60);
        }
        assert_eq!(h.watchdog.state(A).unwrap().status(), Failed);

        let calls = h.runner.calls().len();
        h.watchdog.tick_at(now).await;
        assert_eq!(h.runner.calls().len(), calls);

        h.runner.on("bluetoothctl", "connect", MockResponse::ok("Connection successful"));
        h.watchdog
            .handle_command(WatchdogCommand::Reconnect(vec![A.to_string()]))
            .await;
        assert_eq!(h.watchdog.state(A).unwrap().status(), Connected);
    }

    #[tokio::test]
    async fn test_reconciles_in_config_order_and_skips_non_keepalive() {
        let mut h = harness(
            vec![sink(B, true), sink("AA:BB:CC:DD:EE:03", false), sink(A, true)],
            10,
            5,
        );
        h.runner.on("bluetoothctl", "info", info(true));

        h.watchdog.tick().await;

        let infos: Vec<String> = h
            .runner
            .calls()
            .into_iter()
            .filter(|c| c.contains(" info "))
            .collect();
        assert_eq!(
            infos,
            vec![
                format!("bluetoothctl <<< info {B}; quit"),
                format!("bluetoothctl <<< info {A}; quit")
            ]
        );
        assert_eq!(h.snapshot.borrow()[1].status, Unknown);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let h = harness(vec![sink(A, true)], 10, 5);
        h.runner.on("bluetoothctl", "info", info(true));
        let token = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(h.watchdog.run(rx, token.clone()));
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
