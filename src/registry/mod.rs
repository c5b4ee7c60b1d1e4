//! 服务注册与发现
//!
//! 定义注册中心的三个接口（Registrar / Discovery / Watcher），
//! 并提供内存实现与 etcd 实现（feature `etcd`）。

pub mod endpoint;
pub mod instance;
pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{RegistryConfig, RegistryKind};
use crate::error::Result;

pub use endpoint::{SECURE_QUERY_KEY, is_secure, new_endpoint, parse_endpoint};
pub use instance::ServiceInstance;
pub use memory::MemoryRegistry;

#[cfg(feature = "etcd")]
pub use etcd::EtcdRegistry;

/// 服务注册接口
#[async_trait]
pub trait Registrar: Send + Sync {
    /// 注册服务实例
    async fn register(&self, instance: &ServiceInstance) -> Result<()>;

    /// 注销服务实例
    async fn deregister(&self, instance: &ServiceInstance) -> Result<()>;
}

/// 服务发现接口
#[async_trait]
pub trait Discovery: Send + Sync {
    /// 获取服务当前的实例列表
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>>;

    /// 创建一个监听该服务实例变化的 watcher
    async fn watch(&self, name: &str) -> Result<Box<dyn Watcher>>;
}

/// 实例列表变化的游标
///
/// 第一次 `next` 在列表非空时立即返回当前列表，之后阻塞直到列表变化。
/// `stop` 之后任何挂起或后续的 `next` 都返回 `Error::Cancelled`。
#[async_trait]
pub trait Watcher: Send + Sync {
    async fn next(&self) -> Result<Vec<ServiceInstance>>;

    async fn stop(&self) -> Result<()>;
}

/// 同时具备注册与发现能力的注册中心
pub trait Registry: Registrar + Discovery {}

impl<T: Registrar + Discovery> Registry for T {}

/// 根据配置创建注册中心
pub async fn create_registry(config: &RegistryConfig) -> Result<Arc<dyn Registry>> {
    match config.kind {
        RegistryKind::Memory => Ok(Arc::new(MemoryRegistry::new())),
        #[cfg(feature = "etcd")]
        RegistryKind::Etcd => {
            let registry = EtcdRegistry::connect(
                &config.endpoints,
                config.namespace.clone(),
                config.ttl_secs as i64,
            )
            .await?;
            Ok(Arc::new(registry))
        }
        #[cfg(not(feature = "etcd"))]
        RegistryKind::Etcd => Err(crate::error::Error::Config(
            "etcd registry requires the `etcd` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_memory_registry_from_config() {
        let config = RegistryConfig {
            kind: RegistryKind::Memory,
            ..Default::default()
        };
        let registry = create_registry(&config).await.unwrap();
        let instance = ServiceInstance::new("1", "user");
        registry.register(&instance).await.unwrap();
        assert_eq!(registry.get_service("user").await.unwrap(), vec![instance]);
    }
}
