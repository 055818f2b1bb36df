//! 音箱目标：名称 + 规范化 MAC 地址

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

fn mac_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9A-F]{2}:){5}[0-9A-F]{2}$").unwrap())
}

/// 规范化为大写 AA:BB:CC:DD:EE:FF；格式不合法返回 None
pub fn normalize_address(raw: &str) -> Option<String> {
    let upper = raw.trim().to_ascii_uppercase().replace('-', ":");
    mac_regex().is_match(&upper).then_some(upper)
}

/// 配置中的一个音箱，启动后不可变；地址为唯一键
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkTarget {
    pub name: String,
    pub address: String,
    /// 看门狗是否维持该音箱的连接
    pub keepalive: bool,
    pub is_default: bool,
}

impl SinkTarget {
    pub fn new(name: &str, address: &str, keepalive: bool, is_default: bool) -> Result<Self, String> {
        let address = normalize_address(address)
            .ok_or_else(|| format!("invalid Bluetooth address '{address}'"))?;
        let name = if name.trim().is_empty() {
            address.clone()
        } else {
            name.trim().to_string()
        };
        Ok(Self {
            name,
            address,
            keepalive,
            is_default,
        })
    }

    /// bluealsa 设备路径等处使用的下划线形式：AA_BB_CC_DD_EE_FF
    pub fn address_underscored(&self) -> String {
        self.address.replace(':', "_")
    }
}
