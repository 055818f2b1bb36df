//! 控制与遥测桥接：遥测采样、发现元数据、入站命令、MQTT 传输

#[allow(clippy::module_inception)]
pub mod bridge;
pub mod command;
pub mod discovery;
pub mod mqtt;
pub mod telemetry;
pub mod transport;

pub use bridge::{AvailabilityPublisher, ControlBridge};
pub use command::{parse_command, ControlCommand, RejectedCommand};
pub use discovery::{DiscoveryContext, Topics};
pub use mqtt::{mqtt_options, MqttSettings, MqttTls, MqttTransport};
pub use telemetry::{SystemSampler, TelemetryCollector, TelemetrySample};
pub use transport::{MemoryTransport, Published, Transport, TransportEvent};
