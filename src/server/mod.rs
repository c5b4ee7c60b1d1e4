//! 服务端模块
//!
//! 所有网络服务器实现同一个最小接口 [`Server`]，编排器据此统一启动与停止。
//! 监听端口在构建时就已绑定，因此 `:0` 在启动前即可解析出真实端口。

pub mod grpc;
pub mod host;
pub mod rest;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub use grpc::{RpcServer, RpcServerBuilder};
pub use rest::{RestServer, RestServerBuilder};

/// 网络服务器
#[async_trait]
pub trait Server: Send + Sync {
    /// 服务器类型，如 `grpc`、`http`
    fn kind(&self) -> &str;

    /// 对外公布的 host:port
    fn address(&self) -> String;

    /// 带 scheme 的端点，用于构建注册实例
    fn endpoint(&self) -> Option<String> {
        None
    }

    /// 开始服务，阻塞直到服务器停止或失败；`cancel` 触发时同样停止
    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    /// 优雅停止，使阻塞中的 `start` 返回，最多等待到 `deadline`
    async fn stop(&self, deadline: Instant) -> Result<()>;
}

/// 把 `:port` 形式的地址补全为可绑定的地址
pub(crate) fn bind_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

/// 服务器的启动/停止状态
pub(crate) struct Lifecycle {
    started: AtomicBool,
    shutdown: CancellationToken,
    stopped: watch::Sender<bool>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            stopped: watch::channel(false).0,
        }
    }

    /// 标记启动，只允许一次
    pub(crate) fn begin(&self, kind: &str) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::ServerStart {
                kind: kind.to_string(),
                source: "server already started".into(),
            });
        }
        Ok(())
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 服务循环退出后调用
    pub(crate) fn finish(&self) {
        self.stopped.send_replace(true);
    }

    pub(crate) async fn stop(&self, kind: &str, deadline: Instant) -> Result<()> {
        self.shutdown.cancel();
        if !self.started.load(Ordering::SeqCst) {
            self.finish();
            return Ok(());
        }

        let mut stopped = self.stopped.subscribe();
        let finished = tokio::time::timeout_at(deadline, stopped.wait_for(|stopped| *stopped))
            .await
            .map(|result| result.is_ok());
        match finished {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::ServerStop {
                kind: kind.to_string(),
                reason: "graceful shutdown timed out".to_string(),
            }),
        }
    }
}

/// 停止信号：服务器自身的 stop 或外部取消
pub(crate) async fn shutdown_signal(shutdown: CancellationToken, cancel: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = cancel.cancelled() => {}
    }
}
