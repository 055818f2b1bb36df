//! 入站控制命令：`<base>/command/<name>` 上的消息解析为封闭的命令集合
//!
//! 格式错误或未知的消息解析为 RejectedCommand，由调用方记录后丢弃。

use thiserror::Error;

use crate::bluetooth::normalize_address;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// 原始请求值，执行时限制到 [0, 100]
    SetVolume(i64),
    SetMute(bool),
    /// 重置所有未连接的音箱并立即调和
    Reconnect,
    /// 音箱地址（已规范化）或名称
    SelectSink(String),
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::SetVolume(_) => "volume",
            ControlCommand::SetMute(_) => "mute",
            ControlCommand::Reconnect => "reconnect",
            ControlCommand::SelectSink(_) => "select_sink",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RejectedCommand {
    #[error("not a command topic: {0}")]
    NotCommandTopic(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("invalid payload for {command}: {payload:?}")]
    InvalidPayload { command: String, payload: String },
}

/// 解析一条入站消息
pub fn parse_command(
    base_topic: &str,
    topic: &str,
    payload: &[u8],
) -> Result<ControlCommand, RejectedCommand> {
    let prefix = format!("{}/command/", base_topic.trim_end_matches('/'));
    let name = topic
        .strip_prefix(&prefix)
        .ok_or_else(|| RejectedCommand::NotCommandTopic(topic.to_string()))?;

    let text = String::from_utf8_lossy(payload).trim().to_string();
    let invalid = || RejectedCommand::InvalidPayload {
        command: name.to_string(),
        payload: text.clone(),
    };

    match name {
        "volume" => parse_volume(&text).map(ControlCommand::SetVolume).ok_or_else(invalid),
        "mute" => parse_switch(&text).map(ControlCommand::SetMute).ok_or_else(invalid),
        "reconnect" => Ok(ControlCommand::Reconnect),
        "select_sink" => {
            if text.is_empty() {
                return Err(invalid());
            }
            Ok(ControlCommand::SelectSink(
                normalize_address(&text).unwrap_or(text),
            ))
        }
        other => Err(RejectedCommand::UnknownCommand(other.to_string())),
    }
}

/// 整数、小数（四舍五入）或 {"volume": n}
fn parse_volume(text: &str) -> Option<i64> {
    if let Ok(v) = text.parse::<i64>() {
        return Some(v);
    }
    if let Ok(v) = text.parse::<f64>() {
        return v.is_finite().then(|| v.round() as i64);
    }
    let json: serde_json::Value = serde_json::from_str(text).ok()?;
    json.get("volume")?.as_f64().filter(|v| v.is_finite()).map(|v| v.round() as i64)
}

fn parse_switch(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Some(true),
        "off" | "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
