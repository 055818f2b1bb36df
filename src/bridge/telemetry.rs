//! 遥测采样：系统指标 + 流状态 + 连接摘要
//!
//! 每个遥测 tick 生成一个不可变的 TelemetrySample，由桥接层消费一次，不落盘。
//! 系统指标直接读 /proc 与 /sys；读取失败的指标省略，不影响其余指标。

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::bluetooth::ConnectionStatus;
use crate::config::Metric;
use crate::core::{ConnectionSummary, StreamStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    /// 实体名 -> 值
    pub metrics: BTreeMap<String, Value>,
    pub connections: Vec<ConnectionSummary>,
}

impl TelemetrySample {
    pub fn get(&self, entity: &str) -> Option<&Value> {
        self.metrics.get(entity)
    }
}

/// /proc/stat 第一行的累计 CPU 时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// 解析 /proc/loadavg 的前三列
pub fn parse_loadavg(content: &str) -> Option<[f64; 3]> {
    let mut parts = content.split_whitespace();
    let load1 = parts.next()?.parse().ok()?;
    let load5 = parts.next()?.parse().ok()?;
    let load15 = parts.next()?.parse().ok()?;
    Some([load1, load5, load15])
}

/// 由 /proc/meminfo 计算已用内存百分比
pub fn parse_memory_percent(content: &str) -> Option<f64> {
    let mut total: u64 = 0;
    let mut available: u64 = 0;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.split_whitespace().next().and_then(|s| s.parse().ok()).unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.split_whitespace().next().and_then(|s| s.parse().ok()).unwrap_or(0);
        }
    }
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available) as f64 / total as f64 * 100.0;
    Some(round1(used))
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// 系统指标探针，根目录可替换以便测试
pub struct SystemSampler {
    proc_root: PathBuf,
    thermal_zone: PathBuf,
    last_cpu: Option<CpuTimes>,
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler {
    pub fn new() -> Self {
        Self::with_roots("/proc", "/sys/class/thermal/thermal_zone0")
    }

    pub fn with_roots(proc_root: impl Into<PathBuf>, thermal_zone: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            thermal_zone: thermal_zone.into(),
            last_cpu: None,
        }
    }

    fn read(&self, path: PathBuf) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }

    /// 自上次采样以来的 CPU 占用；首次调用以开机以来的累计值计算
    pub fn cpu_percent(&mut self) -> Option<f64> {
        let now = parse_cpu_times(&self.read(self.proc_root.join("stat"))?)?;
        let prev = self.last_cpu.replace(now).unwrap_or(CpuTimes { busy: 0, total: 0 });
        let total = now.total.saturating_sub(prev.total);
        if total == 0 {
            return Some(0.0);
        }
        let busy = now.busy.saturating_sub(prev.busy);
        Some(round1(busy as f64 / total as f64 * 100.0))
    }

    pub fn memory_percent(&self) -> Option<f64> {
        parse_memory_percent(&self.read(self.proc_root.join("meminfo"))?)
    }

    pub fn load(&self) -> Option<[f64; 3]> {
        parse_loadavg(&self.read(self.proc_root.join("loadavg"))?)
    }

    /// 毫摄氏度 -> 摄氏度
    pub fn temperature_c(&self) -> Option<f64> {
        let raw: f64 = self.read(self.thermal_zone.join("temp"))?.trim().parse().ok()?;
        Some(round1(raw / 1000.0))
    }
}

/// 按配置启用的指标生成样本
pub struct TelemetryCollector {
    metrics: Vec<Metric>,
    sampler: SystemSampler,
}

impl TelemetryCollector {
    pub fn new(metrics: Vec<Metric>, sampler: SystemSampler) -> Self {
        Self { metrics, sampler }
    }

    pub fn enabled(&self, metric: Metric) -> bool {
        self.metrics.contains(&metric)
    }

    /// active 为当前绑定的音箱地址
    pub fn collect(
        &mut self,
        connections: &[ConnectionSummary],
        stream: &StreamStatus,
        active: Option<&str>,
    ) -> TelemetrySample {
        let mut metrics = BTreeMap::new();

        // 流指标总是发布
        metrics.insert(
            "stream_state".to_string(),
            Value::from(if stream.running { "playing" } else { "stopped" }),
        );
        metrics.insert("stream_restarts".to_string(), Value::from(stream.restart_count));
        metrics.insert("muted".to_string(), Value::from(stream.muted));
        if let Some(volume) = stream.volume {
            metrics.insert("volume".to_string(), Value::from(volume));
        }

        if self.enabled(Metric::Cpu) {
            if let Some(v) = self.sampler.cpu_percent() {
                metrics.insert("cpu_percent".to_string(), Value::from(v));
            }
        }
        if self.enabled(Metric::Memory) {
            if let Some(v) = self.sampler.memory_percent() {
                metrics.insert("memory_percent".to_string(), Value::from(v));
            }
        }
        if self.enabled(Metric::Load) {
            if let Some([l1, l5, l15]) = self.sampler.load() {
                metrics.insert("load_1m".to_string(), Value::from(l1));
                metrics.insert("load_5m".to_string(), Value::from(l5));
                metrics.insert("load_15m".to_string(), Value::from(l15));
            }
        }
        if self.enabled(Metric::Temperature) {
            if let Some(v) = self.sampler.temperature_c() {
                metrics.insert("temperature_c".to_string(), Value::from(v));
            }
        }
        let active = active.and_then(|a| connections.iter().find(|c| c.address == a));
        if let Some(c) = active {
            metrics.insert("active_sink".to_string(), Value::from(c.name.clone()));
        }
        if self.enabled(Metric::Bluetooth) {
            let connected = active
                .map(|c| c.status == ConnectionStatus::Connected)
                .unwrap_or(false);
            metrics.insert(
                "bluetooth_connected".to_string(),
                Value::from(if connected { "connected" } else { "disconnected" }),
            );
            if let Some(c) = active {
                metrics.insert("bluetooth_speaker".to_string(), Value::from(c.name.clone()));
                metrics.insert("bluetooth_mac".to_string(), Value::from(c.address.clone()));
            }
        }

        TelemetrySample {
            timestamp: Utc::now(),
            metrics,
            connections: connections.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("loadavg"), "0.52 0.58 0.59 1/389 12345\n").unwrap();
        std::fs::write(
            dir.path().join("meminfo"),
            "MemTotal:        1000000 kB\nMemFree:          100000 kB\nMemAvailable:     250000 kB\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("stat"), "cpu  100 0 100 700 100 0 0 0 0 0\n").unwrap();
        std::fs::write(dir.path().join("temp"), "48312\n").unwrap();
        dir
    }

    #[test]
    fn test_sampler_reads_proc_files() {
        let dir = fake_root();
        let mut sampler = SystemSampler::with_roots(dir.path(), dir.path());
        assert_eq!(sampler.load(), Some([0.52, 0.58, 0.59]));
        assert_eq!(sampler.memory_percent(), Some(75.0));
        assert_eq!(sampler.temperature_c(), Some(48.3));
        assert_eq!(sampler.cpu_percent(), Some(20.0));

        std::fs::write(dir.path().join("stat"), "cpu  150 0 150 750 150 0 0 0 0 0\n").unwrap();
        assert_eq!(sampler.cpu_percent(), Some(50.0));
    }

    #[test]
    fn test_missing_files_are_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = TelemetryCollector::new(
            vec![Metric::Cpu, Metric::Memory, Metric::Load, Metric::Temperature],
            SystemSampler::with_roots(dir.path(), dir.path()),
        );
        let sample = collector.collect(&[], &StreamStatus::default(), None);
        assert_eq!(sample.get("stream_state"), Some(&Value::from("stopped")));
        assert!(sample.get("cpu_percent").is_none());
        assert!(sample.get("load_1m").is_none());
    }

    #[test]
    fn test_only_enabled_metrics_plus_stream() {
        let dir = fake_root();
        let mut collector = TelemetryCollector::new(
            vec![Metric::Load, Metric::Bluetooth],
            SystemSampler::with_roots(dir.path(), dir.path()),
        );
        let connections = vec![ConnectionSummary {
            name: "Kitchen".into(),
            address: "AA:BB:CC:DD:EE:01".into(),
            status: ConnectionStatus::Connected,
            consecutive_failures: 0,
            drops: 0,
            last_transition: Utc::now(),
        }];
        let stream = StreamStatus {
            running: true,
            volume: Some(40),
            ..Default::default()
        };
        let sample = collector.collect(&connections, &stream, Some("AA:BB:CC:DD:EE:01"));
        let keys: Vec<&str> = sample.metrics.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "active_sink",
                "bluetooth_connected",
                "bluetooth_mac",
                "bluetooth_speaker",
                "load_15m",
                "load_1m",
                "load_5m",
                "muted",
                "stream_restarts",
                "stream_state",
                "volume",
            ]
        );
        assert_eq!(sample.get("bluetooth_connected"), Some(&Value::from("connected")));
    }
}
