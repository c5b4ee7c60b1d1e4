//! 基于服务发现的解析器：`discovery:///<service-name>`
//!
//! 构建时在超时内向注册中心申请 watcher，然后由一个后台 watch 循环
//! 把实例列表转换成去重后的地址集合推送给连接层。

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Address, Attributes, Resolver, ResolverBuilder, ResolverState, ResolverUpdater, Target};
use crate::error::{Error, Result};
use crate::registry::{Discovery, ServiceInstance, Watcher};

pub const DISCOVERY_SCHEME: &str = "discovery";

/// 解析出的端点 scheme
const ENDPOINT_SCHEME: &str = "grpc";

/// 默认创建 watcher 的超时时间
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// watch 出错后的重试间隔
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// discovery 解析器构建器
#[derive(Clone)]
pub struct DiscoveryBuilder {
    discovery: Arc<dyn Discovery>,
    timeout: Duration,
    insecure: bool,
}

impl DiscoveryBuilder {
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self {
            discovery,
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
            insecure: false,
        }
    }

    /// 设置创建 watcher 的超时时间
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 设置是否只解析明文端点
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }
}

#[async_trait]
impl ResolverBuilder for DiscoveryBuilder {
    fn scheme(&self) -> &str {
        DISCOVERY_SCHEME
    }

    async fn build(
        &self,
        target: &Target,
        updater: Arc<dyn ResolverUpdater>,
    ) -> Result<Box<dyn Resolver>> {
        let service = target.endpoint.clone();
        let watcher = match tokio::time::timeout(self.timeout, self.discovery.watch(&service)).await {
            Ok(watcher) => watcher?,
            Err(_) => {
                return Err(Error::DiscoveryTimeout {
                    service,
                    timeout: self.timeout,
                });
            }
        };

        let inner = Arc::new(Inner {
            service,
            insecure: self.insecure,
            watcher: Arc::from(watcher),
            updater,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(watch_loop(inner.clone()));

        Ok(Box::new(DiscoveryResolver { inner }))
    }
}

struct Inner {
    service: String,
    insecure: bool,
    watcher: Arc<dyn Watcher>,
    updater: Arc<dyn ResolverUpdater>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Inner {
    /// 标记关闭并取消 watch 循环，返回是否为第一次关闭
    fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    async fn update(&self, instances: Vec<ServiceInstance>) {
        let addresses = resolve_addresses(&instances, self.insecure);
        if addresses.is_empty() {
            warn!(
                service = %self.service,
                instances = instances.len(),
                "⚠️ Zero endpoint found, refused to write"
            );
            return;
        }

        let count = addresses.len();
        if let Err(e) = self.updater.update_state(ResolverState { addresses }).await {
            error!(service = %self.service, error = %e, "Failed to update resolver state");
            return;
        }
        info!(service = %self.service, addresses = count, "Resolver state updated");
    }
}

/// 唯一的写入者：串行地把 watcher 的结果发布出去
async fn watch_loop(inner: Arc<Inner>) {
    loop {
        let result = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            result = inner.watcher.next() => result,
        };
        match result {
            Ok(instances) => inner.update(instances).await,
            Err(Error::Cancelled) => return,
            Err(e) => {
                error!(service = %inner.service, error = %e, "Failed to watch discovery endpoint");
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                }
            }
        }
    }
}

/// 把实例列表转换为地址集合
///
/// 每个实例取第一个 scheme 为 `grpc` 且安全标记匹配的端点，
/// 没有匹配端点或端点非法的实例被跳过，地址按字符串去重。
pub fn resolve_addresses(instances: &[ServiceInstance], insecure: bool) -> Vec<Address> {
    let mut seen = HashSet::new();
    let mut addresses = Vec::new();
    for instance in instances {
        let addr = match instance.endpoint(ENDPOINT_SCHEME, !insecure) {
            Ok(Some(addr)) => addr,
            Ok(None) => continue,
            Err(e) => {
                error!(instance = %instance.id, error = %e, "Failed to parse discovery endpoint");
                continue;
            }
        };
        if !seen.insert(addr.clone()) {
            continue;
        }
        addresses.push(Address {
            addr,
            server_name: instance.name.clone(),
            attributes: Attributes::from_instance(Arc::new(instance.clone())),
        });
    }
    addresses
}

/// discovery 解析器
pub struct DiscoveryResolver {
    inner: Arc<Inner>,
}

#[async_trait]
impl Resolver for DiscoveryResolver {
    async fn close(&self) {
        if !self.inner.shutdown() {
            return;
        }
        if let Err(e) = self.inner.watcher.stop().await {
            error!(service = %self.inner.service, error = %e, "Failed to stop watcher");
        }
    }
}

impl Drop for DiscoveryResolver {
    fn drop(&mut self) {
        if !self.inner.shutdown() {
            return;
        }
        let watcher = self.inner.watcher.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = watcher.stop().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, endpoints: &[&str]) -> ServiceInstance {
        endpoints
            .iter()
            .fold(ServiceInstance::new(id, "user"), |i, e| i.with_endpoint(*e))
    }

    #[test]
    fn resolves_insecure_grpc_endpoint() {
        let addresses = resolve_addresses(&[instance("1", &["grpc://10.0.0.1:9000"])], true);
        let addrs: Vec<_> = addresses.iter().map(|a| a.addr.as_str()).collect();
        assert_eq!(addrs, vec!["10.0.0.1:9000"]);
        assert_eq!(addresses[0].server_name, "user");
        assert_eq!(
            addresses[0].attributes.instance().map(|i| i.id.as_str()),
            Some("1")
        );
    }

    #[test]
    fn deduplicates_and_skips_mismatched() {
        let instances = vec![
            instance("1", &["grpc://10.0.0.1:9000"]),
            instance("2", &["grpc://10.0.0.1:9000"]),
            instance("3", &["http://10.0.0.3:8080"]),
            instance("4", &["grpc://10.0.0.4:9443?isSecure=true"]),
            instance("5", &["grpc://bad host"]),
            instance("6", &["http://10.0.0.6:8080", "grpc://10.0.0.6:9000"]),
        ];
        let addrs: Vec<_> = resolve_addresses(&instances, true)
            .into_iter()
            .map(|a| a.addr)
            .collect();
        assert_eq!(addrs, vec!["10.0.0.1:9000", "10.0.0.6:9000"]);

        let secure: Vec<_> = resolve_addresses(&instances, false)
            .into_iter()
            .map(|a| a.addr)
            .collect();
        assert_eq!(secure, vec!["10.0.0.4:9443"]);
    }
}
