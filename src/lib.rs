//! Bluesnap - Bluetooth 音箱健康编排器
//!
//! 模块划分：
//! - **bluetooth**: 音箱目标、连接状态机、bluetoothctl 封装、连接看门狗
//! - **bridge**: 遥测采样、Home Assistant 发现、入站命令、MQTT 传输
//! - **config**: 应用配置加载（TOML + 环境变量）与校验
//! - **core**: 错误分类、状态投影、上下文、关闭协调、主控循环
//! - **escalation**: 失败预算、分级升级策略、台账、主机控制
//! - **exec**: 外部命令与长驻子进程的执行接口
//! - **observability**: tracing 初始化
//! - **stream**: snapclient 监管与混音器

pub mod bluetooth;
pub mod bridge;
pub mod config;
pub mod core;
pub mod escalation;
pub mod exec;
pub mod observability;
pub mod stream;
