//! 编排器：主控循环
//!
//! 启动看门狗与监管器任务，随后在单个 select 循环里复用：关闭信号、组件事件、
//! 遥测定时、传输事件与监管器回复。活动音箱由连接快照决定，变化时让监管器重新绑定。
//!
//! 发往监管器的请求由转发任务按顺序执行，主循环只在回复到达时处理结果，
//! 停止旧进程或混音器命令再慢也不会挡住遥测与入站命令。

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bluetooth::{ConnectionStatus, ConnectionWatchdog, SinkTarget, WatchdogCommand};
use crate::bridge::{
    AvailabilityPublisher, ControlBridge, ControlCommand, SystemSampler, TelemetryCollector,
    Transport, TransportEvent,
};
use crate::core::{
    ConnectionSummary, OrchestratorContext, OrchestratorError, OrchestratorEvent,
    ShutdownCleanup, ShutdownCoordinator, StreamStatus,
};
use crate::stream::{StreamSupervisor, SupervisorHandle};

/// 选择活动音箱：显式选择优先；否则已连接的默认音箱；否则第一个已连接的；否则默认音箱
pub fn select_active<'a>(
    targets: &'a [SinkTarget],
    connections: &[ConnectionSummary],
    requested: Option<&str>,
) -> Option<&'a SinkTarget> {
    if let Some(req) = requested {
        if let Some(t) = targets.iter().find(|t| t.address == req) {
            return Some(t);
        }
    }
    let connected = |t: &SinkTarget| {
        connections
            .iter()
            .any(|c| c.address == t.address && c.status == ConnectionStatus::Connected)
    };
    let default = targets.iter().find(|t| t.is_default);
    default
        .filter(|t| connected(t))
        .or_else(|| targets.iter().find(|t| connected(t)))
        .or(default)
}

/// 按地址或名称（忽略大小写）查找音箱
fn find_target<'a>(targets: &'a [SinkTarget], key: &str) -> Option<&'a SinkTarget> {
    targets
        .iter()
        .find(|t| t.address == key)
        .or_else(|| targets.iter().find(|t| t.name.eq_ignore_ascii_case(key)))
}

/// 排队交给监管器的请求
#[derive(Debug)]
enum StreamRequest {
    Ensure(SinkTarget),
    Volume(i64),
    Mute(bool),
}

#[derive(Debug)]
enum StreamReply {
    Ensured {
        address: String,
        result: Result<(), OrchestratorError>,
    },
    Volume(Result<u8, OrchestratorError>),
    Mute(Result<bool, OrchestratorError>),
}

/// 按到达顺序把请求交给监管器，结果送回主循环
async fn forward_requests(
    supervisor: SupervisorHandle,
    mut requests: mpsc::UnboundedReceiver<StreamRequest>,
    replies: mpsc::UnboundedSender<StreamReply>,
) {
    while let Some(request) = requests.recv().await {
        let reply = match request {
            StreamRequest::Ensure(target) => {
                let address = target.address.clone();
                StreamReply::Ensured {
                    address,
                    result: supervisor.ensure_running(target).await,
                }
            }
            StreamRequest::Volume(percent) => StreamReply::Volume(supervisor.set_volume(percent).await),
            StreamRequest::Mute(muted) => StreamReply::Mute(supervisor.set_mute(muted).await),
        };
        if replies.send(reply).is_err() {
            break;
        }
    }
}

pub struct Orchestrator {
    ctx: OrchestratorContext,
    bridge: ControlBridge,
    collector: TelemetryCollector,
    supervisor: SupervisorHandle,
    stream_status: watch::Receiver<StreamStatus>,
    connections: watch::Receiver<Vec<ConnectionSummary>>,
    watchdog_tx: mpsc::Sender<WatchdogCommand>,
    events: mpsc::UnboundedReceiver<OrchestratorEvent>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    requests: mpsc::UnboundedSender<StreamRequest>,
    replies: mpsc::UnboundedReceiver<StreamReply>,
    /// 入站 select 命令选择的地址
    requested: Option<String>,
    /// 最近一次要求监管器绑定的地址
    active: Option<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// 创建组件并启动看门狗、监管器任务
    pub fn start(
        ctx: OrchestratorContext,
        events: mpsc::UnboundedReceiver<OrchestratorEvent>,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        sampler: SystemSampler,
    ) -> Self {
        let (watchdog, connections) = ConnectionWatchdog::new(
            ctx.targets.clone(),
            ctx.bluetooth_ctl(),
            Arc::clone(&ctx.escalator),
            ctx.events.clone(),
            ctx.watchdog_settings(),
        );
        let (supervisor, handle, stream_status) = StreamSupervisor::new(
            ctx.stream_settings(),
            Arc::clone(&ctx.launcher),
            Arc::clone(&ctx.runner),
            Arc::clone(&ctx.escalator),
            ctx.events.clone(),
        );
        let bridge = ControlBridge::new(
            transport,
            ctx.topics(),
            ctx.discovery(),
            Arc::clone(&ctx.escalator),
            ctx.config.publish_timeout(),
        );
        let collector = TelemetryCollector::new(ctx.config.telemetry.metrics.clone(), sampler);

        let (watchdog_tx, watchdog_rx) = mpsc::channel(8);
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(watchdog.run(watchdog_rx, ctx.shutdown.token())),
            tokio::spawn(supervisor.run()),
            tokio::spawn(forward_requests(handle.clone(), requests_rx, replies_tx)),
        ];

        Self {
            ctx,
            bridge,
            collector,
            supervisor: handle,
            stream_status,
            connections,
            watchdog_tx,
            events,
            transport_events,
            requests,
            replies,
            requested: None,
            active: None,
            tasks,
        }
    }

    /// 主循环，直到关闭；返回前完成清理
    pub async fn run(mut self) {
        let shutdown = self.ctx.shutdown.token();
        let mut telemetry = tokio::time::interval(self.ctx.config.telemetry_interval());
        telemetry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.retarget();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(event) = self.events.recv() => self.on_event(event),
                Some(reply) = self.replies.recv() => self.on_reply(reply).await,
                Some(event) = self.transport_events.recv() => self.on_transport(event).await,
                _ = telemetry.tick() => self.publish_telemetry().await,
            }
        }

        self.finish().await;
    }

    fn on_event(&mut self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::SinkTransition { address, from, to, .. } => {
                tracing::info!("Sink {} {} -> {}", address, from, to);
                self.retarget();
            }
            OrchestratorEvent::StreamStarted { address, pid } => {
                tracing::info!("Stream started for {} (pid {:?})", address, pid);
            }
            OrchestratorEvent::StreamStopped {
                address,
                exit_code,
                crashed,
            } => {
                if crashed {
                    tracing::warn!("Stream for {} crashed (exit code {:?})", address, exit_code);
                } else {
                    tracing::info!("Stream for {} stopped", address);
                }
            }
            OrchestratorEvent::Escalated { component, tier } => {
                // 组件自行补救；这里只留痕
                tracing::info!("Escalation observed: {} at tier {}", component, tier.as_str());
            }
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.bridge.on_connected().await,
            TransportEvent::Disconnected => self.bridge.on_disconnected(),
            TransportEvent::Message { topic, payload } => {
                if let Some(command) = self.bridge.handle_command(&topic, &payload) {
                    self.dispatch(command).await;
                }
            }
        }
    }

    async fn on_reply(&mut self, reply: StreamReply) {
        match reply {
            StreamReply::Ensured { address, result: Ok(()) } => {
                tracing::debug!("Stream bound to {}", address);
            }
            StreamReply::Ensured {
                address,
                result: Err(e),
            } => {
                tracing::warn!("Failed to retarget stream to {}: {}", address, e);
                // 下一次重新计算时再试
                if self.active.as_deref() == Some(address.as_str()) {
                    self.active = None;
                }
            }
            StreamReply::Volume(Ok(level)) => {
                self.bridge.publish_entity("volume", Value::from(level)).await;
            }
            StreamReply::Volume(Err(e)) => tracing::warn!("Volume change failed: {}", e),
            StreamReply::Mute(Ok(muted)) => {
                self.bridge.publish_entity("muted", Value::from(muted)).await;
            }
            StreamReply::Mute(Err(e)) => tracing::warn!("Mute change failed: {}", e),
        }
    }

    async fn dispatch(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::SetVolume(percent) => self.request(StreamRequest::Volume(percent)),
            ControlCommand::SetMute(muted) => self.request(StreamRequest::Mute(muted)),
            ControlCommand::Reconnect => {
                if self
                    .watchdog_tx
                    .send(WatchdogCommand::Reconnect(Vec::new()))
                    .await
                    .is_err()
                {
                    tracing::warn!("Connection watchdog is not running, reconnect ignored");
                }
            }
            ControlCommand::SelectSink(key) => {
                match find_target(&self.ctx.targets, &key) {
                    Some(target) => {
                        tracing::info!("Sink {} ({}) selected", target.name, target.address);
                        self.requested = Some(target.address.clone());
                        self.retarget();
                    }
                    None => tracing::warn!("Select ignored, unknown sink '{}'", key),
                }
            }
        }
    }

    fn request(&self, request: StreamRequest) {
        if self.requests.send(request).is_err() {
            tracing::warn!("Stream supervisor is not running, request dropped");
        }
    }

    /// 重新计算活动音箱，变化时让监管器重新绑定
    fn retarget(&mut self) {
        let connections = self.connections.borrow().clone();
        let Some(target) =
            select_active(&self.ctx.targets, &connections, self.requested.as_deref()).cloned()
        else {
            return;
        };
        if self.active.as_deref() == Some(target.address.as_str()) {
            return;
        }
        tracing::info!("Active sink is now {} ({})", target.name, target.address);
        self.active = Some(target.address.clone());
        self.request(StreamRequest::Ensure(target));
    }

    async fn publish_telemetry(&mut self) {
        let connections = self.connections.borrow().clone();
        let stream = self.stream_status.borrow().clone();
        let sample = self
            .collector
            .collect(&connections, &stream, self.active.as_deref());
        self.bridge.publish_telemetry(&sample).await;
    }

    /// 停止 snapclient、发布 offline，再等待后台任务退出
    async fn finish(self) {
        let Self {
            ctx,
            bridge,
            supervisor,
            requests,
            replies,
            tasks,
            ..
        } = self;
        // 转发任务在请求通道关闭后退出
        drop(requests);
        drop(replies);

        let mut coordinator =
            ShutdownCoordinator::new().with_timeout(ctx.config.stream.stop_grace_secs + 2);
        coordinator.register(StopStream(supervisor));
        coordinator.register(PublishOffline(bridge.availability_publisher()));
        coordinator.run_cleanup().await;

        let grace = ctx.watchdog_settings().shutdown_grace;
        for task in tasks {
            if tokio::time::timeout(grace, task).await.is_err() {
                tracing::warn!("Background task did not stop within {:?}", grace);
            }
        }
        tracing::info!("Orchestrator stopped");
    }
}

struct StopStream(SupervisorHandle);

#[async_trait::async_trait]
impl ShutdownCleanup for StopStream {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.0.stop().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stop-stream"
    }
}

struct PublishOffline(AvailabilityPublisher);

#[async_trait::async_trait]
impl ShutdownCleanup for PublishOffline {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.0.offline().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "publish-offline"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn target(name: &str, last: u8, is_default: bool) -> SinkTarget {
        SinkTarget::new(name, &format!("AA:BB:CC:DD:EE:{last:02X}"), true, is_default).unwrap()
    }

    fn summary(t: &SinkTarget, status: ConnectionStatus) -> ConnectionSummary {
        ConnectionSummary {
            name: t.name.clone(),
            address: t.address.clone(),
            status,
            consecutive_failures: 0,
            drops: 0,
            last_transition: Utc::now(),
        }
    }

    #[test]
    fn test_select_active_precedence() {
        let targets = vec![target("A", 1, false), target("B", 2, true), target("C", 3, false)];
        use ConnectionStatus::*;

        // 默认音箱已连接
        let conns = vec![
            summary(&targets[0], Connected),
            summary(&targets[1], Connected),
            summary(&targets[2], Unknown),
        ];
        assert_eq!(select_active(&targets, &conns, None).unwrap().name, "B");

        // 默认未连接：第一个已连接的
        let conns = vec![
            summary(&targets[0], Disconnected),
            summary(&targets[1], Connecting),
            summary(&targets[2], Connected),
        ];
        assert_eq!(select_active(&targets, &conns, None).unwrap().name, "C");

        // 都未连接：默认
        let conns = vec![summary(&targets[0], Failed)];
        assert_eq!(select_active(&targets, &conns, None).unwrap().name, "B");

        // 显式选择优先，即使未连接
        assert_eq!(
            select_active(&targets, &conns, Some("AA:BB:CC:DD:EE:01")).unwrap().name,
            "A"
        );
    }

    #[test]
    fn test_find_target_by_name_or_address() {
        let targets = vec![target("Kitchen", 1, true), target("Patio", 2, false)];
        assert_eq!(find_target(&targets, "patio").unwrap().name, "Patio");
        assert_eq!(find_target(&targets, "AA:BB:CC:DD:EE:01").unwrap().name, "Kitchen");
        assert!(find_target(&targets, "Garage").is_none());
    }
}
