//! gRPC 服务器
//!
//! 构建时绑定监听端口并挂载标准健康检查服务，启动后把整体状态置为 SERVING，
//! 停止时先置为 NOT_SERVING 再优雅关闭。

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server as TonicServer;
use tonic::transport::server::Router;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;
use tracing::info;

use super::{Lifecycle, Server, bind_address, host, shutdown_signal};
use crate::config::RpcServerConfig;
use crate::error::{Error, Result};
use crate::registry::new_endpoint;

const KIND: &str = "grpc";

/// gRPC 服务器构建器
///
/// ```rust,no_run
/// use flare_micro::server::RpcServerBuilder;
///
/// # async fn run() -> flare_micro::Result<()> {
/// let server = RpcServerBuilder::new()
///     .address("127.0.0.1:9000")
///     .bind(|router| router /* .add_service(UserServer::new(svc)) */)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RpcServerBuilder {
    address: String,
    timeout: Option<Duration>,
    concurrency_limit: Option<usize>,
    secure: bool,
}

impl Default for RpcServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcServerBuilder {
    pub fn new() -> Self {
        Self {
            address: ":0".to_string(),
            timeout: None,
            concurrency_limit: None,
            secure: false,
        }
    }

    pub fn from_config(config: &RpcServerConfig) -> Self {
        let mut builder = Self::new().address(config.address.clone()).secure(config.secure);
        if let Some(ms) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        builder
    }

    /// 监听地址，`:0` 表示随机端口
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// 单次请求超时
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn concurrency_limit_per_connection(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// 在公布的端点上标记 `isSecure=true`
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// 绑定端口并注册业务服务
    pub async fn bind<F>(self, routes: F) -> Result<RpcServer>
    where
        F: FnOnce(Router) -> Router,
    {
        let listener = TcpListener::bind(bind_address(&self.address))
            .await
            .map_err(|e| Error::ServerStart {
                kind: KIND.to_string(),
                source: e.into(),
            })?;
        let local_addr = listener.local_addr()?;
        let address = host::extract(&self.address, local_addr);

        let (health, health_service) = tonic_health::server::health_reporter();

        let mut server = TonicServer::builder();
        if let Some(timeout) = self.timeout {
            server = server.timeout(timeout);
        }
        if let Some(limit) = self.concurrency_limit {
            server = server.concurrency_limit_per_connection(limit);
        }
        let router = routes(server.add_service(health_service));

        info!(bind = %local_addr, address = %address, "[gRPC] listener bound");

        Ok(RpcServer {
            router: Mutex::new(Some(router)),
            listener: Mutex::new(Some(listener)),
            local_addr,
            address,
            secure: self.secure,
            health,
            lifecycle: Lifecycle::new(),
        })
    }
}

/// 已绑定端口的 gRPC 服务器
pub struct RpcServer {
    router: Mutex<Option<Router>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    address: String,
    secure: bool,
    health: HealthReporter,
    lifecycle: Lifecycle,
}

impl RpcServer {
    pub fn builder() -> RpcServerBuilder {
        RpcServerBuilder::new()
    }

    /// 实际监听的地址
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 健康状态上报器，可按服务名单独设置状态
    pub fn health_reporter(&self) -> HealthReporter {
        self.health.clone()
    }
}

#[async_trait]
impl Server for RpcServer {
    fn kind(&self) -> &str {
        KIND
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn endpoint(&self) -> Option<String> {
        Some(new_endpoint("grpc", &self.address, self.secure))
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        self.lifecycle.begin(KIND)?;
        let router = self.router.lock().await.take();
        let listener = self.listener.lock().await.take();
        let (Some(router), Some(listener)) = (router, listener) else {
            return Err(Error::ServerStart {
                kind: KIND.to_string(),
                source: "listener already consumed".into(),
            });
        };

        self.health.set_service_status("", ServingStatus::Serving).await;
        info!(address = %self.address, "🚀 [gRPC] server listening");

        let result = router
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown_signal(self.lifecycle.shutdown_token(), cancel),
            )
            .await;
        self.lifecycle.finish();

        result.map_err(|e| Error::ServerStart {
            kind: KIND.to_string(),
            source: e.into(),
        })
    }

    async fn stop(&self, deadline: Instant) -> Result<()> {
        info!(address = %self.address, "[gRPC] server stopping");
        self.health.set_service_status("", ServingStatus::NotServing).await;
        self.lifecycle.stop(KIND, deadline).await?;
        info!(address = %self.address, "✅ [gRPC] server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn binds_random_port_before_start() {
        let server = RpcServerBuilder::new()
            .address("127.0.0.1:0")
            .bind(|router| router)
            .await
            .unwrap();

        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.address(), server.local_addr().to_string());
        assert_eq!(
            server.endpoint().unwrap(),
            format!("grpc://{}", server.local_addr())
        );
    }

    #[tokio::test]
    async fn secure_endpoint_is_tagged() {
        let server = RpcServerBuilder::new()
            .address("127.0.0.1:0")
            .secure(true)
            .bind(|router| router)
            .await
            .unwrap();
        assert!(server.endpoint().unwrap().ends_with("?isSecure=true"));
    }

    #[tokio::test]
    async fn stop_unblocks_start() {
        let server = Arc::new(
            RpcServerBuilder::new()
                .address("127.0.0.1:0")
                .bind(|router| router)
                .await
                .unwrap(),
        );

        let running = tokio::spawn({
            let server = server.clone();
            async move { server.start(CancellationToken::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        server
            .stop(Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();
        running.await.unwrap().unwrap();

        // 只能启动一次
        assert!(server.start(CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn cancel_token_stops_server() {
        let server = RpcServerBuilder::new()
            .address("127.0.0.1:0")
            .bind(|router| router)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        server.start(cancel).await.unwrap();
    }
}
