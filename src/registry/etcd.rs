//! etcd 服务注册发现实现
//!
//! key 布局：`{namespace}/{service}/{instance_id}`，value 为实例 JSON。
//! 注册时创建租约并后台续约，续约失败带退避重试，租约过期则重新授予并重写 key；
//! 注销时停止续约、删除 key 并撤销租约。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use etcd_client::{Client, GetOptions, PutOptions, WatchOptions, WatchStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Discovery, Registrar, ServiceInstance, Watcher};
use crate::error::{Error, Result};

const KEEP_ALIVE_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const KEEP_ALIVE_MAX_BACKOFF: Duration = Duration::from_secs(10);

struct Lease {
    /// 重新授予后会变化
    id: Arc<AtomicI64>,
    keep_alive: JoinHandle<()>,
}

/// etcd 服务注册发现
pub struct EtcdRegistry {
    client: Client,
    namespace: String,
    ttl: i64,
    leases: Mutex<HashMap<String, Lease>>,
}

impl EtcdRegistry {
    /// 连接 etcd
    pub async fn connect(endpoints: &[String], namespace: impl Into<String>, ttl: i64) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .context("failed to connect to etcd")
            .map_err(Error::registry)?;

        Ok(Self {
            client,
            namespace: namespace.into(),
            ttl: ttl.max(1),
            leases: Mutex::new(HashMap::new()),
        })
    }

    fn service_prefix(&self, name: &str) -> String {
        format!("{}/{}/", self.namespace, name)
    }

    fn instance_key(&self, instance: &ServiceInstance) -> String {
        format!("{}{}", self.service_prefix(&instance.name), instance.id)
    }

    async fn open_watcher(&self, name: &str) -> Result<EtcdWatcher> {
        let prefix = self.service_prefix(name);
        let mut client = self.client.clone();
        let (watcher, stream) = client
            .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await?;

        Ok(EtcdWatcher {
            client: self.client.clone(),
            prefix,
            watcher: Mutex::new(watcher),
            stream: Mutex::new(Some(stream)),
            first: AtomicBool::new(true),
            stopped: CancellationToken::new(),
        })
    }
}

/// 在租约下写入实例 key，返回租约 ID
async fn put_with_lease(client: &mut Client, key: &str, value: &[u8], ttl: i64) -> Result<i64> {
    let lease = client.lease_grant(ttl, None).await?;
    client
        .put(key, value, Some(PutOptions::new().with_lease(lease.id())))
        .await?;
    Ok(lease.id())
}

enum KeepAliveEnd {
    Expired,
    Failed(String),
}

/// 持续续约，直到租约过期或连接出错
async fn keep_alive_session(
    client: &mut Client,
    lease_id: i64,
    interval: Duration,
    backoff: &mut Duration,
) -> KeepAliveEnd {
    let (mut keeper, mut stream) = match client.lease_keep_alive(lease_id).await {
        Ok(pair) => pair,
        Err(e) => return KeepAliveEnd::Failed(e.to_string()),
    };
    loop {
        if let Err(e) = keeper.keep_alive().await {
            return KeepAliveEnd::Failed(e.to_string());
        }
        match stream.message().await {
            Ok(Some(resp)) if resp.ttl() <= 0 => return KeepAliveEnd::Expired,
            Ok(Some(resp)) => {
                debug!(lease_id, ttl = resp.ttl(), "Lease keep-alive successful");
                *backoff = KEEP_ALIVE_INITIAL_BACKOFF;
            }
            Ok(None) => return KeepAliveEnd::Failed("keep-alive stream closed".to_string()),
            Err(e) => return KeepAliveEnd::Failed(e.to_string()),
        }
        tokio::time::sleep(interval).await;
    }
}

async fn keep_alive_loop(mut client: Client, key: String, value: Vec<u8>, ttl: i64, lease: Arc<AtomicI64>) {
    let interval = Duration::from_secs((ttl as u64 / 3).max(1));
    let mut backoff = KEEP_ALIVE_INITIAL_BACKOFF;
    loop {
        let lease_id = lease.load(Ordering::SeqCst);
        match keep_alive_session(&mut client, lease_id, interval, &mut backoff).await {
            KeepAliveEnd::Expired => {
                warn!(key = %key, lease_id, "⚠️ Lease expired, registering again");
                match put_with_lease(&mut client, &key, &value, ttl).await {
                    Ok(id) => {
                        lease.store(id, Ordering::SeqCst);
                        info!(key = %key, lease_id = id, "✅ Service registered to etcd again");
                        backoff = KEEP_ALIVE_INITIAL_BACKOFF;
                        continue;
                    }
                    Err(e) => error!(key = %key, error = %e, "Failed to register again"),
                }
            }
            KeepAliveEnd::Failed(reason) => {
                warn!(key = %key, lease_id, error = %reason, retry_in = ?backoff, "Lease keep-alive failed, retrying");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(KEEP_ALIVE_MAX_BACKOFF);
    }
}

async fn fetch_instances(client: &Client, prefix: &str) -> Result<Vec<ServiceInstance>> {
    let mut client = client.clone();
    let resp = client
        .get(prefix, Some(GetOptions::new().with_prefix()))
        .await
        .with_context(|| format!("failed to list {prefix}"))
        .map_err(Error::registry)?;

    let mut instances = Vec::with_capacity(resp.kvs().len());
    for kv in resp.kvs() {
        match serde_json::from_slice::<ServiceInstance>(kv.value()) {
            Ok(instance) => instances.push(instance),
            Err(e) => warn!(key = %String::from_utf8_lossy(kv.key()), error = %e, "skip malformed instance"),
        }
    }
    Ok(instances)
}

#[async_trait]
impl Registrar for EtcdRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        let key = self.instance_key(instance);
        let value = serde_json::to_vec(instance)
            .context("failed to encode instance")
            .map_err(Error::registry)?;

        let mut client = self.client.clone();
        let lease_id = put_with_lease(&mut client, &key, &value, self.ttl).await?;

        let id = Arc::new(AtomicI64::new(lease_id));
        let keep_alive = tokio::spawn(keep_alive_loop(
            self.client.clone(),
            key.clone(),
            value,
            self.ttl,
            id.clone(),
        ));
        let previous = self
            .leases
            .lock()
            .await
            .insert(instance.id.clone(), Lease { id, keep_alive });
        if let Some(previous) = previous {
            previous.keep_alive.abort();
            let _ = client.lease_revoke(previous.id.load(Ordering::SeqCst)).await;
        }

        info!(key = %key, lease_id, "✅ Service registered to etcd");
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let key = self.instance_key(instance);
        let mut client = self.client.clone();

        let lease = self.leases.lock().await.remove(&instance.id);
        if let Some(lease) = &lease {
            lease.keep_alive.abort();
        }
        client.delete(key.clone(), None).await?;
        if let Some(lease) = lease {
            client.lease_revoke(lease.id.load(Ordering::SeqCst)).await?;
        }

        info!(key = %key, "Service deregistered from etcd");
        Ok(())
    }
}

#[async_trait]
impl Discovery for EtcdRegistry {
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        fetch_instances(&self.client, &self.service_prefix(name)).await
    }

    async fn watch(&self, name: &str) -> Result<Box<dyn Watcher>> {
        Ok(Box::new(self.open_watcher(name).await?))
    }
}

struct EtcdWatcher {
    client: Client,
    prefix: String,
    watcher: Mutex<etcd_client::Watcher>,
    /// `None` 表示 watch 已失效，下次 `next` 重新建立
    stream: Mutex<Option<WatchStream>>,
    first: AtomicBool,
    stopped: CancellationToken,
}

impl EtcdWatcher {
    /// 重新建立 watch，并返回当前完整列表以补上失效期间的变化
    async fn reopen(&self, slot: &mut Option<WatchStream>) -> Result<Vec<ServiceInstance>> {
        let mut client = self.client.clone();
        let (mut watcher, stream) = client
            .watch(self.prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await?;
        if self.stopped.is_cancelled() {
            let _ = watcher.cancel().await;
            return Err(Error::Cancelled);
        }
        *self.watcher.lock().await = watcher;
        *slot = Some(stream);
        info!(prefix = %self.prefix, "etcd watch re-established");
        fetch_instances(&self.client, &self.prefix).await
    }
}

#[async_trait]
impl Watcher for EtcdWatcher {
    async fn next(&self) -> Result<Vec<ServiceInstance>> {
        if self.stopped.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.first.swap(false, Ordering::SeqCst) {
            let instances = fetch_instances(&self.client, &self.prefix).await?;
            if !instances.is_empty() {
                return Ok(instances);
            }
        }

        let mut slot = self.stream.lock().await;
        let Some(stream) = slot.as_mut() else {
            return self.reopen(&mut slot).await;
        };
        loop {
            let message = tokio::select! {
                _ = self.stopped.cancelled() => return Err(Error::Cancelled),
                message = stream.message() => message,
            };
            let reason = match message {
                Ok(Some(resp)) if resp.canceled() => "canceled".to_string(),
                Ok(Some(resp)) if resp.events().is_empty() => continue,
                Ok(Some(_)) => return fetch_instances(&self.client, &self.prefix).await,
                Ok(None) => "closed".to_string(),
                Err(e) => e.to_string(),
            };
            *slot = None;
            return Err(Error::Watch(format!("etcd watch on {} {reason}", self.prefix)));
        }
    }

    async fn stop(&self) -> Result<()> {
        if self.stopped.is_cancelled() {
            return Ok(());
        }
        self.stopped.cancel();
        self.watcher.lock().await.cancel().await?;
        Ok(())
    }
}
