//! 内存注册中心
//!
//! 进程内实现，每个服务名对应一个 `tokio::sync::watch` 通道，
//! 适用于测试与单机开发。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Discovery, Registrar, ServiceInstance, Watcher};
use crate::error::{Error, Result};

/// 内存注册中心
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    services: Arc<RwLock<HashMap<String, watch::Sender<Vec<ServiceInstance>>>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, name: &str) -> watch::Sender<Vec<ServiceInstance>> {
        if let Some(sender) = self.services.read().await.get(name) {
            return sender.clone();
        }
        let mut services = self.services.write().await;
        services
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .clone()
    }
}

#[async_trait]
impl Registrar for MemoryRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        let sender = self.sender(&instance.name).await;
        sender.send_modify(|instances| {
            instances.retain(|existing| existing.id != instance.id);
            instances.push(instance.clone());
        });
        debug!(service = %instance.name, id = %instance.id, "instance registered");
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let sender = self.sender(&instance.name).await;
        sender.send_modify(|instances| instances.retain(|existing| existing.id != instance.id));
        debug!(service = %instance.name, id = %instance.id, "instance deregistered");
        Ok(())
    }
}

#[async_trait]
impl Discovery for MemoryRegistry {
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self.sender(name).await.borrow().clone())
    }

    async fn watch(&self, name: &str) -> Result<Box<dyn Watcher>> {
        let receiver = self.sender(name).await.subscribe();
        Ok(Box::new(MemoryWatcher {
            receiver: Mutex::new(receiver),
            first: AtomicBool::new(true),
            stopped: CancellationToken::new(),
        }))
    }
}

struct MemoryWatcher {
    receiver: Mutex<watch::Receiver<Vec<ServiceInstance>>>,
    first: AtomicBool,
    stopped: CancellationToken,
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&self) -> Result<Vec<ServiceInstance>> {
        if self.stopped.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut receiver = self.receiver.lock().await;
        if self.first.swap(false, Ordering::SeqCst) {
            let current = receiver.borrow_and_update().clone();
            if !current.is_empty() {
                return Ok(current);
            }
        }
        tokio::select! {
            _ = self.stopped.cancelled() => Err(Error::Cancelled),
            changed = receiver.changed() => match changed {
                Ok(()) => Ok(receiver.borrow_and_update().clone()),
                Err(_) => Err(Error::Cancelled),
            },
        }
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_next_returns_current_list() {
        let registry = MemoryRegistry::new();
        let instance = ServiceInstance::new("1", "user").with_endpoint("grpc://10.0.0.1:9000");
        registry.register(&instance).await.unwrap();

        let watcher = registry.watch("user").await.unwrap();
        assert_eq!(watcher.next().await.unwrap(), vec![instance]);
    }

    #[tokio::test]
    async fn next_blocks_until_change() {
        let registry = MemoryRegistry::new();
        let watcher = registry.watch("user").await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), watcher.next()).await;
        assert!(pending.is_err());

        let instance = ServiceInstance::new("1", "user");
        registry.register(&instance).await.unwrap();
        assert_eq!(watcher.next().await.unwrap(), vec![instance.clone()]);

        registry.deregister(&instance).await.unwrap();
        assert!(watcher.next().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_replaces_same_id() {
        let registry = MemoryRegistry::new();
        registry.register(&ServiceInstance::new("1", "user").with_version("v1")).await.unwrap();
        registry.register(&ServiceInstance::new("1", "user").with_version("v2")).await.unwrap();

        let instances = registry.get_service("user").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].version, "v2");
    }

    #[tokio::test]
    async fn stop_unblocks_pending_next() {
        let registry = MemoryRegistry::new();
        let watcher: Arc<dyn Watcher> = Arc::from(registry.watch("user").await.unwrap());

        let pending = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        watcher.stop().await.unwrap();
        watcher.stop().await.unwrap();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(matches!(watcher.next().await, Err(Error::Cancelled)));
    }
}
