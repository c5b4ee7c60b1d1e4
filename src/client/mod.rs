//! gRPC 客户端模块
//!
//! 按目标 scheme 从显式的解析器注册表中选出解析器，拨号得到 [`BalancedChannel`]。
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flare_micro::client::ClientBuilder;
//! use flare_micro::registry::MemoryRegistry;
//!
//! # async fn dial() -> flare_micro::Result<()> {
//! let registry = Arc::new(MemoryRegistry::new());
//! let channel = ClientBuilder::new("discovery:///user")
//!     .discovery(registry)
//!     .insecure(true)
//!     .dial()
//!     .await?;
//! // let client = UserClient::new(channel);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Endpoint;
use tracing::info;

use crate::balancer::{
    BalancedChannel, ConnectionPool, DEFAULT_HEALTH_CHECK_INTERVAL, EndpointHook, PoolConfig,
};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::registry::Discovery;
use crate::resolver::{DiscoveryBuilder, ResolverBuilder, ResolverRegistry, Target};
use crate::selector::{SelectorBuilder, Strategy};

/// 默认单次调用超时
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// 默认建连超时
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// 客户端构建器
pub struct ClientBuilder {
    target: String,
    timeout: Option<Duration>,
    connect_timeout: Duration,
    insecure: bool,
    discovery: Option<Arc<dyn Discovery>>,
    discovery_timeout: Duration,
    health_check_interval: Duration,
    selector: Arc<dyn SelectorBuilder>,
    resolvers: ResolverRegistry,
    endpoint_hook: Option<EndpointHook>,
}

impl ClientBuilder {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            timeout: Some(DEFAULT_TIMEOUT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            insecure: false,
            discovery: None,
            discovery_timeout: crate::resolver::discovery::DEFAULT_DISCOVERY_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            selector: Arc::new(Strategy::default()),
            resolvers: ResolverRegistry::default(),
            endpoint_hook: None,
        }
    }

    /// 从配置创建
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.target.clone())
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .insecure(config.insecure)
            .discovery_timeout(config.discovery_timeout())
            .health_check_interval(config.health_check_interval())
            .strategy(config.strategy)
    }

    /// 单次调用超时，`Duration::ZERO` 表示不限制
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 使用明文连接，并只解析不带安全标记的端点
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// 设置服务发现，启用 `discovery:///` 目标
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// 就绪连接的健康检查间隔，检查失败的连接移出就绪集合并重连
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// 使用内置负载均衡策略
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.selector = Arc::new(strategy);
        self
    }

    /// 使用自定义选择器
    pub fn selector(mut self, selector: Arc<dyn SelectorBuilder>) -> Self {
        self.selector = selector;
        self
    }

    /// 注册额外的解析器
    pub fn resolver(mut self, builder: Arc<dyn ResolverBuilder>) -> Self {
        self.resolvers.register(builder);
        self
    }

    /// 自定义每个连接的 Endpoint（如 TLS）
    pub fn endpoint_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Endpoint) -> std::result::Result<Endpoint, tonic::transport::Error> + Send + Sync + 'static,
    {
        self.endpoint_hook = Some(Arc::new(hook));
        self
    }

    /// 拨号
    pub async fn dial(self) -> Result<BalancedChannel> {
        let target = Target::parse(&self.target)?;

        let mut resolvers = self.resolvers;
        if let Some(discovery) = self.discovery {
            resolvers.register(Arc::new(
                DiscoveryBuilder::new(discovery)
                    .with_timeout(self.discovery_timeout)
                    .with_insecure(self.insecure),
            ));
        }
        let builder = resolvers
            .get(&target.scheme)
            .ok_or_else(|| Error::UnknownScheme(target.scheme.clone()))?;

        let pool = ConnectionPool::new(
            self.selector,
            PoolConfig {
                insecure: self.insecure,
                connect_timeout: self.connect_timeout,
                request_timeout: self.timeout,
                health_check_interval: self.health_check_interval,
            },
            self.endpoint_hook,
        );
        let resolver = builder.build(&target, pool.clone()).await?;

        info!(target = %target, insecure = self.insecure, "🔗 Client channel created");
        Ok(BalancedChannel::new(target, pool, resolver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let err = ClientBuilder::new("consul:///user").dial().await.unwrap_err();
        assert!(matches!(err, Error::UnknownScheme(scheme) if scheme == "consul"));
    }

    #[tokio::test]
    async fn discovery_scheme_requires_discovery() {
        let err = ClientBuilder::new("discovery:///user").dial().await.unwrap_err();
        assert!(matches!(err, Error::UnknownScheme(_)));
    }

    #[tokio::test]
    async fn direct_target_dials_without_discovery() {
        let channel = ClientBuilder::new("direct:///127.0.0.1:1")
            .insecure(true)
            .dial()
            .await
            .unwrap();
        assert_eq!(channel.target().scheme, "direct");
        assert_eq!(channel.ready_count(), 0);
        channel.close().await;
    }
}
