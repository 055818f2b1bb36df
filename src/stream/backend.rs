//! 音频后端：snapclient 命令行与混音器命令
//!
//! | 后端     | snapclient player | 设备标识                               | 混音器                 |
//! |----------|-------------------|----------------------------------------|------------------------|
//! | alsa     | alsa              | audio_device 或 default                | amixer（百分比）       |
//! | pulse    | pulse             | bluez_sink.<MAC_>.a2dp_sink            | pactl（百分比）        |
//! | pipewire | pulse             | bluez_output.<MAC_>.1                  | pactl（pipewire-pulse）|
//! | bluealsa | alsa              | bluealsa:DEV=<MAC>,PROFILE=a2dp        | bluealsa-cli（0-127）  |

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::bluetooth::SinkTarget;
use crate::exec::{args, ProcessSpec};

/// bluealsa 音量的满量程
pub const BLUEALSA_MAX: u32 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioBackend {
    Alsa,
    Pulse,
    Pipewire,
    #[default]
    Bluealsa,
}

impl AudioBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioBackend::Alsa => "alsa",
            AudioBackend::Pulse => "pulse",
            AudioBackend::Pipewire => "pipewire",
            AudioBackend::Bluealsa => "bluealsa",
        }
    }

    /// snapclient 的 --player 参数
    pub fn player(&self) -> &'static str {
        match self {
            AudioBackend::Alsa | AudioBackend::Bluealsa => "alsa",
            AudioBackend::Pulse | AudioBackend::Pipewire => "pulse",
        }
    }

    /// 音箱在该后端下的设备标识（snapclient --soundcard 与混音器共用）
    pub fn device_for(&self, target: &SinkTarget) -> String {
        match self {
            AudioBackend::Alsa => "default".to_string(),
            AudioBackend::Pulse => format!("bluez_sink.{}.a2dp_sink", target.address_underscored()),
            AudioBackend::Pipewire => format!("bluez_output.{}.1", target.address_underscored()),
            AudioBackend::Bluealsa => format!("bluealsa:DEV={},PROFILE=a2dp", target.address),
        }
    }
}

impl std::fmt::Display for AudioBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 把外部输入的音量限制到 [0, 100]
pub fn clamp_volume(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

/// 百分比到 bluealsa 0-127 刻度
pub fn percent_to_bluealsa(percent: u8) -> u32 {
    (u32::from(percent) * BLUEALSA_MAX + 50) / 100
}

/// bluealsa 刻度回到百分比
pub fn bluealsa_to_percent(raw: u32) -> u8 {
    ((raw.min(BLUEALSA_MAX) * 100 + BLUEALSA_MAX / 2) / BLUEALSA_MAX) as u8
}

/// 监管器与混音器所需的参数（由配置构造）
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub backend: AudioBackend,
    pub snapclient_path: String,
    pub server_host: String,
    pub server_port: u16,
    pub latency_ms: u32,
    pub client_name: String,
    /// 覆盖推导出的设备标识
    pub audio_device: Option<String>,
    pub adapter: String,
    pub mixer_control: String,
    pub stop_grace: Duration,
    pub restart_backoff: Duration,
    pub restart_backoff_max: Duration,
    pub stable_after: Duration,
    pub mixer_timeout: Duration,
}

impl StreamSettings {
    pub fn device_for(&self, target: &SinkTarget) -> String {
        self.audio_device
            .clone()
            .unwrap_or_else(|| self.backend.device_for(target))
    }

    /// 绑定到 target 的 snapclient 命令
    pub fn snapclient_spec(&self, target: &SinkTarget) -> ProcessSpec {
        let argv = args([
            "--host".to_string(),
            self.server_host.clone(),
            "--port".to_string(),
            self.server_port.to_string(),
            "--latency".to_string(),
            self.latency_ms.to_string(),
            "--hostID".to_string(),
            self.client_name.clone(),
            "--player".to_string(),
            self.backend.player().to_string(),
            "--soundcard".to_string(),
            self.device_for(target),
        ]);
        ProcessSpec::new(self.snapclient_path.clone(), argv)
    }

    /// bluealsa-cli 使用的 D-Bus PCM 路径
    fn bluealsa_pcm(&self, target: &SinkTarget) -> String {
        format!(
            "/org/bluealsa/{}/dev_{}/a2dpsrc/sink",
            self.adapter,
            target.address_underscored()
        )
    }

    /// 混音器设备：pactl 的 sink 名、amixer 的 -D 设备或 bluealsa 的 PCM 路径
    fn mixer_device(&self, target: Option<&SinkTarget>) -> String {
        match (self.backend, target) {
            (AudioBackend::Bluealsa, Some(t)) => self.bluealsa_pcm(t),
            (AudioBackend::Pulse | AudioBackend::Pipewire, Some(t)) => self.device_for(t),
            (AudioBackend::Pulse | AudioBackend::Pipewire, None) => "@DEFAULT_SINK@".to_string(),
            _ => self.audio_device.clone().unwrap_or_else(|| "default".to_string()),
        }
    }

    /// 设置音量的命令（percent 已限幅）
    pub fn set_volume_command(&self, target: Option<&SinkTarget>, percent: u8) -> ProcessSpec {
        let device = self.mixer_device(target);
        match self.backend {
            AudioBackend::Pulse | AudioBackend::Pipewire => ProcessSpec::new(
                "pactl",
                args(["set-sink-volume".to_string(), device, format!("{percent}%")]),
            ),
            AudioBackend::Alsa => ProcessSpec::new(
                "amixer",
                args([
                    "-D".to_string(),
                    device,
                    "sset".to_string(),
                    self.mixer_control.clone(),
                    format!("{percent}%"),
                ]),
            ),
            AudioBackend::Bluealsa => ProcessSpec::new(
                "bluealsa-cli",
                args([
                    "volume".to_string(),
                    device,
                    percent_to_bluealsa(percent).to_string(),
                ]),
            ),
        }
    }

    /// 读回当前音量的命令
    pub fn get_volume_command(&self, target: Option<&SinkTarget>) -> ProcessSpec {
        let device = self.mixer_device(target);
        match self.backend {
            AudioBackend::Pulse | AudioBackend::Pipewire => {
                ProcessSpec::new("pactl", args(["get-sink-volume".to_string(), device]))
            }
            AudioBackend::Alsa => ProcessSpec::new(
                "amixer",
                args([
                    "-D".to_string(),
                    device,
                    "sget".to_string(),
                    self.mixer_control.clone(),
                ]),
            ),
            AudioBackend::Bluealsa => {
                ProcessSpec::new("bluealsa-cli", args(["volume".to_string(), device]))
            }
        }
    }

    pub fn set_mute_command(&self, target: Option<&SinkTarget>, muted: bool) -> ProcessSpec {
        let device = self.mixer_device(target);
        match self.backend {
            AudioBackend::Pulse | AudioBackend::Pipewire => ProcessSpec::new(
                "pactl",
                args([
                    "set-sink-mute".to_string(),
                    device,
                    if muted { "1" } else { "0" }.to_string(),
                ]),
            ),
            AudioBackend::Alsa => ProcessSpec::new(
                "amixer",
                args([
                    "-D".to_string(),
                    device,
                    "sset".to_string(),
                    self.mixer_control.clone(),
                    if muted { "mute" } else { "unmute" }.to_string(),
                ]),
            ),
            AudioBackend::Bluealsa => ProcessSpec::new(
                "bluealsa-cli",
                args([
                    "mute".to_string(),
                    device,
                    if muted { "on" } else { "off" }.to_string(),
                ]),
            ),
        }
    }

    /// 解析混音器读回的音量（百分比）
    pub fn parse_volume(&self, stdout: &str) -> Option<u8> {
        match self.backend {
            AudioBackend::Bluealsa => parse_bluealsa_volume(stdout).map(bluealsa_to_percent),
            _ => parse_percent(stdout),
        }
    }
}

fn percent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3})%").unwrap())
}

fn bluealsa_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)volume:\s*(\d+)").unwrap())
}

/// pactl "front-left: 65536 / 100% / ..." 与 amixer "[75%]" 均取第一个百分比
pub fn parse_percent(stdout: &str) -> Option<u8> {
    percent_regex()
        .captures(stdout)
        .and_then(|c| c[1].parse::<u32>().ok())
        .map(|v| v.min(100) as u8)
}

/// bluealsa-cli "Volume: 96" 或 "Volume: L: 96 R: 96"
pub fn parse_bluealsa_volume(stdout: &str) -> Option<u32> {
    if let Some(c) = bluealsa_regex().captures(stdout) {
        return c[1].parse().ok();
    }
    stdout
        .split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(backend: AudioBackend) -> StreamSettings {
        StreamSettings {
            backend,
            snapclient_path: "snapclient".into(),
            server_host: "nas.lan".into(),
            server_port: 1704,
            latency_ms: 80,
            client_name: "bluesnap-livingroom".into(),
            audio_device: None,
            adapter: "hci0".into(),
            mixer_control: "Master".into(),
            stop_grace: Duration::from_secs(5),
            restart_backoff: Duration::from_secs(5),
            restart_backoff_max: Duration::from_secs(60),
            stable_after: Duration::from_secs(30),
            mixer_timeout: Duration::from_secs(5),
        }
    }

    fn target() -> SinkTarget {
        SinkTarget::new("Kitchen", "aa:bb:cc:dd:ee:01", true, true).unwrap()
    }

    #[test]
    fn test_clamp_volume() {
        assert_eq!(clamp_volume(150), 100);
        assert_eq!(clamp_volume(-5), 0);
        assert_eq!(clamp_volume(42), 42);
    }

    #[test]
    fn test_bluealsa_scale() {
        assert_eq!(percent_to_bluealsa(100), 127);
        assert_eq!(percent_to_bluealsa(0), 0);
        assert_eq!(percent_to_bluealsa(50), 64);
        assert_eq!(bluealsa_to_percent(64), 50);
        assert_eq!(bluealsa_to_percent(127), 100);
        assert_eq!(bluealsa_to_percent(500), 100);
    }

    #[test]
    fn test_snapclient_spec_binds_device() {
        let spec = settings(AudioBackend::Bluealsa).snapclient_spec(&target());
        let line = spec.display();
        assert!(line.starts_with("snapclient --host nas.lan --port 1704 --latency 80"));
        assert!(line.ends_with("--soundcard bluealsa:DEV=AA:BB:CC:DD:EE:01,PROFILE=a2dp"));

        let mut s = settings(AudioBackend::Pipewire);
        assert!(s.snapclient_spec(&target()).display().contains("bluez_output.AA_BB_CC_DD_EE_01.1"));
        s.audio_device = Some("hw:1".into());
        assert!(s.snapclient_spec(&target()).display().ends_with("--soundcard hw:1"));
    }

    #[test]
    fn test_mixer_commands() {
        let t = target();
        assert_eq!(
            settings(AudioBackend::Pulse).set_volume_command(Some(&t), 30).display(),
            "pactl set-sink-volume bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink 30%"
        );
        assert_eq!(
            settings(AudioBackend::Alsa).set_mute_command(Some(&t), true).display(),
            "amixer -D default sset Master mute"
        );
        assert_eq!(
            settings(AudioBackend::Bluealsa).set_volume_command(Some(&t), 100).display(),
            "bluealsa-cli volume /org/bluealsa/hci0/dev_AA_BB_CC_DD_EE_01/a2dpsrc/sink 127"
        );
    }

    #[test]
    fn test_parse_volume() {
        let pulse = settings(AudioBackend::Pulse);
        assert_eq!(
            pulse.parse_volume("Volume: front-left: 42598 /  65% / -11.23 dB,   front-right: 42598 /  65% / -11.23 dB"),
            Some(65)
        );
        let alsa = settings(AudioBackend::Alsa);
        assert_eq!(
            alsa.parse_volume("  Front Left: Playback 49 [75%] [-12.00dB] [on]"),
            Some(75)
        );
        let bluealsa = settings(AudioBackend::Bluealsa);
        assert_eq!(bluealsa.parse_volume("Volume: 64\nMuted: false"), Some(50));
        assert_eq!(bluealsa.parse_volume("garbage"), None);
    }
}
