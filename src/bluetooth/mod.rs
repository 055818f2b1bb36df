//! 蓝牙音箱连接管理：目标、状态机、退避、bluetoothctl 与看门狗

pub mod backoff;
pub mod ctl;
pub mod state;
pub mod target;
pub mod watchdog;

pub use backoff::BackoffPolicy;
pub use ctl::{BluetoothCtl, ConnectOutcome, DeviceInfo};
pub use state::{ConnectionState, ConnectionStatus, Transition};
pub use target::{normalize_address, SinkTarget};
pub use watchdog::{ConnectionWatchdog, WatchdogCommand, WatchdogSettings};
