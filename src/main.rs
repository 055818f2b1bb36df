//! Bluesnap - Bluetooth 音箱健康编排器
//!
//! 入口：加载并校验配置、初始化日志、构造上下文，运行编排循环直到收到信号或升级关闭。
//!
//! 启动: bluesnap --config /etc/bluesnap/config.toml [--log-level debug]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use bluesnap::bridge::{MqttTransport, SystemSampler, Transport};
use bluesnap::config::load_config;
use bluesnap::core::{Orchestrator, OrchestratorContext};
use bluesnap::escalation::SystemHostControl;
use bluesnap::exec::{CommandRunner, SystemLauncher, SystemRunner};
use bluesnap::observability;

const MQTT_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "bluesnap", version, about = "Bluetooth speaker health orchestrator")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, env = "BLUESNAP_CONFIG", default_value = "/etc/bluesnap/config.toml")]
    config: PathBuf,

    /// 覆盖配置中的日志级别
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 配置错误在任何组件创建之前终止进程，并先写入日志
    let bootstrap = observability::bootstrap(cli.log_level.as_deref().unwrap_or("info"));
    let loaded = load_config(&cli.config).and_then(|config| {
        let targets = config.validate()?;
        Ok((config, targets))
    });
    let (config, targets) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!("Cannot start with {}: {}", cli.config.display(), e);
            return Err(e.into());
        }
    };
    drop(bootstrap);

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    observability::init(&level, config.logging.json);
    tracing::info!("Loaded configuration from {}", cli.config.display());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async move {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
        let host = Arc::new(SystemHostControl::new(
            Arc::clone(&runner),
            config.escalation.service_unit.clone(),
        ));
        let (ctx, events) = OrchestratorContext::init(
            config,
            targets,
            runner,
            Arc::new(SystemLauncher::new()),
            host,
        );
        ctx.shutdown.install_signal_handlers();

        // MQTT 事件循环独立于关闭信号，清理阶段的 offline 需要它继续运行
        let mqtt_stop = CancellationToken::new();
        let (mqtt, transport_events, mqtt_task) =
            MqttTransport::connect(&ctx.mqtt_settings(), mqtt_stop.clone()).map_err(|e| {
                tracing::error!("Cannot start MQTT transport: {}", e);
                e
            })?;
        let transport: Arc<dyn Transport> = Arc::new(mqtt.clone());

        let mut reasons = ctx.shutdown.subscribe();
        Orchestrator::start(ctx, events, transport, transport_events, SystemSampler::new())
            .run()
            .await;
        mqtt.disconnect().await;
        if tokio::time::timeout(MQTT_FLUSH_TIMEOUT, mqtt_task).await.is_err() {
            mqtt_stop.cancel();
        }

        if let Ok(reason) = reasons.try_recv() {
            tracing::info!("Exiting after shutdown: {:?}", reason);
        }
        Ok::<(), anyhow::Error>(())
    })
}
