//! HTTP 服务器（axum）

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{Lifecycle, Server, bind_address, host, shutdown_signal};
use crate::config::RestServerConfig;
use crate::error::{Error, Result};
use crate::registry::new_endpoint;

const KIND: &str = "http";

#[derive(Debug, Clone)]
pub struct RestServerBuilder {
    address: String,
    enable_health: bool,
}

impl Default for RestServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RestServerBuilder {
    pub fn new() -> Self {
        Self {
            address: ":8080".to_string(),
            enable_health: true,
        }
    }

    pub fn from_config(config: &RestServerConfig) -> Self {
        Self::new()
            .address(config.address.clone())
            .enable_health(config.enable_health)
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// 挂载 `GET /health`
    pub fn enable_health(mut self, enable: bool) -> Self {
        self.enable_health = enable;
        self
    }

    pub async fn bind(self, router: Router) -> Result<RestServer> {
        let listener = TcpListener::bind(bind_address(&self.address))
            .await
            .map_err(|e| Error::ServerStart {
                kind: KIND.to_string(),
                source: e.into(),
            })?;
        let local_addr = listener.local_addr()?;
        let address = host::extract(&self.address, local_addr);

        let router = if self.enable_health {
            router.route("/health", get(health))
        } else {
            router
        };
        let router = router.layer(TraceLayer::new_for_http());

        info!(bind = %local_addr, address = %address, "[HTTP] listener bound");

        Ok(RestServer {
            router: Mutex::new(Some(router)),
            listener: Mutex::new(Some(listener)),
            local_addr,
            address,
            lifecycle: Lifecycle::new(),
        })
    }
}

async fn health() -> &'static str {
    "ok"
}

pub struct RestServer {
    router: Mutex<Option<Router>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    address: String,
    lifecycle: Lifecycle,
}

impl RestServer {
    pub fn builder() -> RestServerBuilder {
        RestServerBuilder::new()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Server for RestServer {
    fn kind(&self) -> &str {
        KIND
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn endpoint(&self) -> Option<String> {
        Some(new_endpoint("http", &self.address, false))
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

        info!(address = %self.address, "🚀 [HTTP] server listening");

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal(self.lifecycle.shutdown_token(), cancel))
            .await;
        self.lifecycle.finish();

        result.map_err(|e| Error::ServerStart {
            kind: KIND.to_string(),
            source: e.into(),
        })
    }

    async fn stop(&self, deadline: Instant) -> Result<()> {
        info!(address = %self.address, "[HTTP] server stopping");
        self.lifecycle.stop(KIND, deadline).await?;
        info!(address = %self.address, "✅ [HTTP] server stopped");
        Ok(())
    }
}
