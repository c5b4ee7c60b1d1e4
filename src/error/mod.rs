//! Flare Micro 错误处理模块
//!
//! 所有组件共用一个错误枚举，后台循环中的瞬时错误在本地吸收，
//! 只有影响服务可达性的错误才会从 `App::run` 返回。

mod grpc;

use std::time::Duration;
use thiserror::Error;

/// 动态错误类型（注册中心后端、服务器启动失败等）
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 统一结果类型
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Flare Micro 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 在超时时间内未能创建 watcher，resolver 构建失败
    #[error("discovery watcher for `{service}` not created within {timeout:?}")]
    DiscoveryTimeout { service: String, timeout: Duration },

    /// watch 过程中的瞬时错误
    #[error("watch error: {0}")]
    Watch(String),

    /// watcher 已停止或调用被取消
    #[error("operation cancelled")]
    Cancelled,

    /// 注册中心后端错误
    #[error("registry error: {0}")]
    Registry(#[source] BoxError),

    /// picker 当前没有任何就绪连接
    #[error("no connection available")]
    NoConnectionAvailable,

    /// 选择器没有可用节点
    #[error("no available node")]
    NoAvailableNode,

    /// 选择器返回的其他错误
    #[error("selector error: {0}")]
    Selector(String),

    /// 选择节点超过了调用的截止时间
    #[error("deadline exceeded while picking a connection")]
    DeadlineExceeded,

    #[error("register service failed: {0}")]
    Registration(#[source] Box<Error>),

    #[error("deregister service failed: {0}")]
    Deregistration(#[source] Box<Error>),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("{kind} server start failed: {source}")]
    ServerStart {
        kind: String,
        #[source]
        source: BoxError,
    },

    #[error("{kind} server stop failed: {reason}")]
    ServerStop { kind: String, reason: String },

    #[error("invalid target `{0}`")]
    InvalidTarget(String),

    #[error("invalid endpoint `{0}`")]
    InvalidEndpoint(String),

    #[error("no resolver registered for scheme `{0}`")]
    UnknownScheme(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    /// 后台任务 panic 或被中止
    #[error("task failed: {0}")]
    Task(String),
}

impl Error {
    /// 创建注册中心错误
    pub fn registry(err: impl Into<BoxError>) -> Self {
        Error::Registry(err.into())
    }

    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Watch(_)
                | Error::NoConnectionAvailable
                | Error::DeadlineExceeded
                | Error::Transport(_)
        )
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for Error {
    fn from(err: etcd_client::Error) -> Self {
        Error::Registry(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_errors_keep_their_source() {
        let err = Error::Registration(Box::new(Error::Timeout {
            operation: "register",
            timeout: Duration::from_secs(10),
        }));
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("register timed out after 10s"));
    }

    #[test]
    fn transient_classification() {
        assert!(Error::NoConnectionAvailable.is_transient());
        assert!(Error::Watch("reset".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::NoAvailableNode.is_transient());
    }
}
