//! Home Assistant MQTT 发现元数据
//!
//! 每个实体一条保留消息：`<discovery_prefix>/<component>/<instance>_<object_id>/config`。
//! 状态统一发布在 `<base>/state/<entity>`，负载为 `{entity, value, timestamp}`，
//! 因此所有实体的 value_template 都是 `{{ value_json.value }}`。

use serde_json::{json, Map, Value};

use crate::bluetooth::SinkTarget;
use crate::config::Metric;

const MANUFACTURER: &str = "Bluesnap";
const MODEL: &str = "Bluetooth Snapcast Bridge";
const VALUE_TEMPLATE: &str = "{{ value_json.value }}";

/// 主题布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub base: String,
    pub discovery_prefix: String,
}

impl Topics {
    pub fn new(base: impl Into<String>, discovery_prefix: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            discovery_prefix: discovery_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn availability(&self) -> String {
        format!("{}/status", self.base)
    }

    pub fn state(&self, entity: &str) -> String {
        format!("{}/state/{}", self.base, entity)
    }

    pub fn command(&self, name: &str) -> String {
        format!("{}/command/{}", self.base, name)
    }

    pub fn command_filter(&self) -> String {
        format!("{}/command/+", self.base)
    }
}

/// 音箱连接状态实体名：sink_aa_bb_cc_dd_ee_ff
pub fn sink_entity(target_address: &str) -> String {
    format!("sink_{}", target_address.replace(':', "_").to_ascii_lowercase())
}

/// 一条待发布的发现消息
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub payload: Value,
}

/// 生成发现消息所需的静态信息
#[derive(Debug, Clone)]
pub struct DiscoveryContext {
    pub instance_name: String,
    pub friendly_name: String,
    pub metrics: Vec<Metric>,
    pub sinks: Vec<SinkTarget>,
}

impl DiscoveryContext {
    fn device(&self) -> Value {
        json!({
            "identifiers": [self.instance_name],
            "name": self.friendly_name,
            "manufacturer": MANUFACTURER,
            "model": MODEL,
        })
    }

    /// 全部实体的发现消息
    pub fn messages(&self, topics: &Topics) -> Vec<DiscoveryMessage> {
        let mut out = Vec::new();
        let mut push = |component: &str, object_id: &str, mut payload: Map<String, Value>| {
            let unique = format!("{}_{}", self.instance_name, object_id);
            payload.insert("unique_id".into(), Value::from(unique.clone()));
            payload.insert("device".into(), self.device());
            payload.insert(
                "availability".into(),
                json!([{ "topic": topics.availability() }]),
            );
            out.push(DiscoveryMessage {
                topic: format!("{}/{}/{}/config", topics.discovery_prefix, component, unique),
                payload: Value::Object(payload),
            });
        };

        let sensor = |entity: &str, name: &str, extra: Value| {
            let mut m = Map::new();
            m.insert("name".into(), Value::from(format!("{} {}", self.friendly_name, name)));
            m.insert("state_topic".into(), Value::from(topics.state(entity)));
            m.insert("value_template".into(), Value::from(VALUE_TEMPLATE));
            if let Value::Object(extra) = extra {
                m.extend(extra);
            }
            m
        };

        push("sensor", "stream_state", sensor("stream_state", "Stream", json!({})));
        push(
            "sensor",
            "stream_restarts",
            sensor(
                "stream_restarts",
                "Stream Restart Count",
                json!({ "state_class": "total_increasing", "entity_category": "diagnostic" }),
            ),
        );

        let measurement = |unit: &str| {
            json!({ "unit_of_measurement": unit, "state_class": "measurement", "entity_category": "diagnostic" })
        };
        if self.metrics.contains(&Metric::Cpu) {
            push("sensor", "cpu_percent", sensor("cpu_percent", "CPU Percent", measurement("%")));
        }
        if self.metrics.contains(&Metric::Memory) {
            push(
                "sensor",
                "memory_percent",
                sensor("memory_percent", "Memory Percent", measurement("%")),
            );
        }
        if self.metrics.contains(&Metric::Load) {
            for (entity, name) in [("load_1m", "Load 1m"), ("load_5m", "Load 5m"), ("load_15m", "Load 15m")] {
                push(
                    "sensor",
                    entity,
                    sensor(entity, name, json!({ "state_class": "measurement", "entity_category": "diagnostic" })),
                );
            }
        }
        if self.metrics.contains(&Metric::Temperature) {
            push(
                "sensor",
                "temperature_c",
                sensor(
                    "temperature_c",
                    "Temperature",
                    json!({
                        "unit_of_measurement": "°C",
                        "device_class": "temperature",
                        "state_class": "measurement",
                        "entity_category": "diagnostic",
                    }),
                ),
            );
        }
        if self.metrics.contains(&Metric::Bluetooth) {
            push(
                "sensor",
                "bluetooth_connected",
                sensor("bluetooth_connected", "Bluetooth Connected", json!({})),
            );
            push(
                "sensor",
                "bluetooth_speaker",
                sensor("bluetooth_speaker", "Bluetooth Speaker", json!({})),
            );
            push(
                "sensor",
                "bluetooth_mac",
                sensor("bluetooth_mac", "Bluetooth MAC", json!({ "entity_category": "diagnostic" })),
            );
        }
        for sink in &self.sinks {
            let entity = sink_entity(&sink.address);
            push(
                "sensor",
                &entity,
                sensor(&entity, &format!("{} Connection", sink.name), json!({})),
            );
        }

        let mut volume = sensor("volume", "Volume", json!({}));
        volume.insert("command_topic".into(), Value::from(topics.command("volume")));
        volume.insert("min".into(), Value::from(0));
        volume.insert("max".into(), Value::from(100));
        volume.insert("step".into(), Value::from(1));
        volume.insert("unit_of_measurement".into(), Value::from("%"));
        push("number", "volume", volume);

        let mut mute = sensor("muted", "Mute", json!({}));
        mute.insert("command_topic".into(), Value::from(topics.command("mute")));
        mute.insert("payload_on".into(), Value::from("ON"));
        mute.insert("payload_off".into(), Value::from("OFF"));
        mute.insert("state_on".into(), Value::from(true));
        mute.insert("state_off".into(), Value::from(false));
        push("switch", "mute", mute);

        let mut reconnect = Map::new();
        reconnect.insert(
            "name".into(),
            Value::from(format!("{} Reconnect", self.friendly_name)),
        );
        reconnect.insert("command_topic".into(), Value::from(topics.command("reconnect")));
        reconnect.insert("payload_press".into(), Value::from("PRESS"));
        push("button", "reconnect", reconnect);

        if self.sinks.len() > 1 {
            let mut select = sensor("active_sink", "Active Speaker", json!({}));
            select.insert("command_topic".into(), Value::from(topics.command("select_sink")));
            select.insert(
                "options".into(),
                Value::from(self.sinks.iter().map(|s| s.name.clone()).collect::<Vec<_>>()),
            );
            push("select", "active_sink", select);
        }

        out
    }
}
