//! 日志初始化
//!
//! 基于 tracing-subscriber 安装全局 fmt subscriber，`RUST_LOG` 优先于配置中的级别。

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};
use crate::error::{Error, Result};

/// 安装全局日志 subscriber，重复安装返回 `Error::Config`
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Config(format!("invalid log level `{}`: {e}", config.level)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(config.color);

    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_fails() {
        let config = LogConfig {
            level: "debug".into(),
            ..Default::default()
        };
        // 其他测试可能已经安装过 subscriber
        let _ = init(&config);
        assert!(matches!(init(&config), Err(Error::Config(_))));
    }
}
