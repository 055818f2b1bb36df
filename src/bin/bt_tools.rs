//! Bluesnap 蓝牙配网工具
//!
//! 首次部署时扫描、配对、信任音箱；与主服务共用同一套 bluetoothctl 封装。
//!
//! 启动: bluesnap-bt scan --duration 15
//!       bluesnap-bt setup --mac AA:BB:CC:DD:EE:FF

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use bluesnap::bluetooth::{normalize_address, BluetoothCtl, ConnectOutcome};
use bluesnap::exec::SystemRunner;
use bluesnap::observability;

#[derive(Parser, Debug)]
#[command(name = "bluesnap-bt", version, about = "Bluetooth provisioning helper for bluesnap")]
struct Cli {
    /// 适配器名称或地址
    #[arg(long, global = true, default_value = "hci0")]
    adapter: String,

    /// 单条 bluetoothctl 命令的超时（秒）
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// 扫描附近设备
    Scan {
        #[arg(long, default_value_t = 10)]
        duration: u64,
        /// 只显示名称包含该字符串的设备（忽略大小写）
        #[arg(long)]
        filter: Option<String>,
    },
    Pair {
        #[arg(long)]
        mac: String,
    },
    Trust {
        #[arg(long)]
        mac: String,
    },
    Connect {
        #[arg(long)]
        mac: String,
    },
    Remove {
        #[arg(long)]
        mac: String,
    },
    /// 准备适配器，然后配对、信任并连接
    Setup {
        #[arg(long)]
        mac: String,
    },
}

fn mac(raw: &str) -> anyhow::Result<String> {
    normalize_address(raw).with_context(|| format!("invalid MAC address '{raw}'"))
}

async fn connect(ctl: &BluetoothCtl, address: &str) -> anyhow::Result<()> {
    match ctl.connect_verified(address).await {
        outcome @ (ConnectOutcome::Connected | ConnectOutcome::AlreadyConnected) => {
            println!("{address}: {}", outcome.describe());
            Ok(())
        }
        outcome => bail!("{address}: {}", outcome.describe()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::init("warn", false);

    let mut ctl = BluetoothCtl::new(
        Arc::new(SystemRunner::new()),
        Duration::from_secs(cli.timeout.max(1)),
    );
    // setup 在 prepare_adapter 中选择控制器
    if !matches!(cli.command, Action::Setup { .. }) {
        ctl.select_controller(&cli.adapter).await;
    }

    match cli.command {
        Action::Scan { duration, filter } => {
            let devices = ctl.scan(Duration::from_secs(duration)).await?;
            let filter = filter.map(|f| f.to_lowercase());
            let mut shown = 0;
            for (address, name) in &devices {
                if let Some(ref f) = filter {
                    if !name.to_lowercase().contains(f) {
                        continue;
                    }
                }
                println!("{address}  {name}");
                shown += 1;
            }
            if shown == 0 {
                println!("No devices found");
            }
        }
        Action::Pair { mac: raw } => {
            let address = mac(&raw)?;
            ctl.pair(&address).await?;
            println!("{address}: paired");
        }
        Action::Trust { mac: raw } => {
            let address = mac(&raw)?;
            ctl.trust(&address).await?;
            println!("{address}: trusted");
        }
        Action::Connect { mac: raw } => {
            let address = mac(&raw)?;
            connect(&ctl, &address).await?;
        }
        Action::Remove { mac: raw } => {
            let address = mac(&raw)?;
            ctl.remove(&address).await?;
            println!("{address}: removed");
        }
        Action::Setup { mac: raw } => {
            let address = mac(&raw)?;
            for e in ctl.prepare_adapter(&cli.adapter).await {
                eprintln!("warning: {e}");
            }
            ctl.pair(&address).await?;
            ctl.trust(&address).await?;
            connect(&ctl, &address).await?;
            let info = ctl.info(&address).await?;
            println!(
                "{address}: paired={} trusted={} connected={}",
                info.paired, info.trusted, info.connected
            );
        }
    }
    Ok(())
}
