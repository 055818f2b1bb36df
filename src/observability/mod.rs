//! 可观测性：tracing 订阅器
//!
//! 默认级别来自配置，RUST_LOG 存在时覆盖；json 为 true 时输出结构化日志（适合 journald 采集）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 配置加载前使用的临时订阅器（仅当前线程），配置错误也能进入日志。
/// guard 释放后由 init 安装正式订阅器
pub fn bootstrap(level: &str) -> tracing::subscriber::DefaultGuard {
    let subscriber = tracing_subscriber::registry()
        .with(filter(level))
        .with(fmt::layer().with_target(false));
    tracing::subscriber::set_default(subscriber)
}

/// 重复调用时保留第一次的订阅器
pub fn init(level: &str, json: bool) {
    let registry = tracing_subscriber::registry().with(filter(level));
    let result = if json {
        registry.with(fmt::layer().json().with_target(false)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_falls_back() {
        // 非法指令不会 panic
        let _ = filter("not a level ===");
        init("debug", false);
        init("debug", true);
    }

    #[test]
    fn test_bootstrap_guard_is_scoped() {
        let guard = bootstrap("info");
        assert!(tracing::enabled!(tracing::Level::ERROR));
        tracing::error!("bootstrap logging works");
        drop(guard);
    }
}
