//! 连接池
//!
//! 接收解析器推送的地址集合，每个地址一个连接任务：建连、健康检查通过后进入就绪集合，
//! 之后周期性检查健康，失败即移出就绪集合并带退避重连。
//! 就绪集合或其属性变化后重建 picker（copy-then-swap），选择器在整个连接池内共享。

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tonic::transport::{Channel, Endpoint};
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tracing::{debug, info, warn};

use super::picker::{Picked, Picker, ReadyConn};
use crate::error::{Error, Result};
use crate::resolver::{Address, ResolverState, ResolverUpdater};
use crate::selector::{Node, PickInfo, Selector, SelectorBuilder};

/// 节点的传输类型
const NODE_SCHEME: &str = "grpc";

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// picker 在选择期间被替换时的最多尝试次数
const PICK_ATTEMPTS: usize = 2;

/// 默认健康检查间隔
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// 自定义 Endpoint（如 TLS 配置）
pub type EndpointHook =
    Arc<dyn Fn(Endpoint) -> std::result::Result<Endpoint, tonic::transport::Error> + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) insecure: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) health_check_interval: Duration,
}

/// 一个地址的连接任务
struct AddressTask {
    handle: JoinHandle<()>,
    /// 调用方发现传输错误时唤醒，立即做一次健康检查
    recheck: Arc<Notify>,
}

#[derive(Default)]
struct PoolState {
    addresses: HashMap<String, Address>,
    ready: HashMap<String, Channel>,
    tasks: HashMap<String, AddressTask>,
}

pub(crate) struct ConnectionPool {
    this: Weak<ConnectionPool>,
    selector: Arc<dyn Selector>,
    config: PoolConfig,
    endpoint_hook: Option<EndpointHook>,
    state: Mutex<PoolState>,
    picker: ArcSwap<Picker>,
    closed: CancellationToken,
}

impl ConnectionPool {
    pub(crate) fn new(
        selector_builder: Arc<dyn SelectorBuilder>,
        config: PoolConfig,
        endpoint_hook: Option<EndpointHook>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            selector: selector_builder.build(),
            config,
            endpoint_hook,
            state: Mutex::new(PoolState::default()),
            picker: ArcSwap::from_pointee(Picker::empty()),
            closed: CancellationToken::new(),
        })
    }

    /// 当前 picker
    pub(crate) fn current_picker(&self) -> Arc<Picker> {
        self.picker.load_full()
    }

    /// 为一次调用选择连接
    ///
    /// 选择期间 picker 被替换时，用最新的 picker 重试。
    pub(crate) async fn pick(&self, info: &PickInfo) -> Result<Picked> {
        for _ in 0..PICK_ATTEMPTS {
            if let Some(picked) = self.current_picker().try_pick(info).await? {
                return Ok(picked);
            }
            debug!(method = %info.method, "picker replaced during pick, retrying");
        }
        Err(Error::Selector("selected node is not ready".into()))
    }

    /// 调用在传输层失败，尽快检查该连接
    pub(crate) async fn report_failure(&self, addr: &str) {
        let state = self.state.lock().await;
        if let Some(task) = state.tasks.get(addr) {
            task.recheck.notify_one();
        }
    }

    /// 关闭连接池，丢弃所有连接
    pub(crate) async fn close(&self) {
        self.closed.cancel();
        let mut state = self.state.lock().await;
        for (_, task) in state.tasks.drain() {
            task.handle.abort();
        }
        state.ready.clear();
        state.addresses.clear();
        self.picker.store(Arc::new(Picker::empty()));
        debug!("connection pool closed");
    }

    /// 同步关闭，用于 Drop；未能中止的连接任务在观察到关闭后退出
    pub(crate) fn shutdown(&self) {
        self.closed.cancel();
        self.picker.store(Arc::new(Picker::empty()));
        if let Ok(mut state) = self.state.try_lock() {
            for (_, task) in state.tasks.drain() {
                task.handle.abort();
            }
            state.ready.clear();
        }
    }

    fn rebuild_picker(&self, state: &PoolState) {
        let mut ready: Vec<ReadyConn> = state
            .ready
            .iter()
            .map(|(addr, channel)| {
                let instance = state
                    .addresses
                    .get(addr)
                    .and_then(|a| a.attributes.instance().cloned());
                ReadyConn {
                    node: Node::new(NODE_SCHEME, addr.clone(), instance),
                    channel: channel.clone(),
                }
            })
            .collect();
        ready.sort_by(|a, b| a.node.address().cmp(b.node.address()));

        let picker = Picker::new(self.selector.clone(), ready);
        debug!(ready = picker.len(), "picker rebuilt");
        self.picker.store(Arc::new(picker));
    }

    fn spawn_task(&self, addr: String) -> Option<AddressTask> {
        let pool = self.this.upgrade()?;
        let recheck = Arc::new(Notify::new());
        let handle = tokio::spawn(connection_loop(pool, addr, recheck.clone()));
        Some(AddressTask { handle, recheck })
    }

    async fn connect(&self, addr: &str) -> Result<Channel> {
        let scheme = if self.config.insecure { "http" } else { "https" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))?
            .connect_timeout(self.config.connect_timeout);
        if let Some(timeout) = self.config.request_timeout {
            endpoint = endpoint.timeout(timeout);
        }
        if let Some(hook) = &self.endpoint_hook {
            endpoint = (**hook)(endpoint)?;
        }
        Ok(endpoint.connect().await?)
    }

    /// 返回 false 表示地址已移除或连接池已关闭，连接任务应退出
    async fn mark_ready(&self, addr: &str, channel: Channel) -> bool {
        let mut state = self.state.lock().await;
        if self.closed.is_cancelled() || !state.addresses.contains_key(addr) {
            return false;
        }
        info!(address = %addr, "✅ Connection ready");
        state.ready.insert(addr.to_string(), channel);
        self.rebuild_picker(&state);
        true
    }

    async fn mark_unready(&self, addr: &str) -> bool {
        let mut state = self.state.lock().await;
        if self.closed.is_cancelled() || !state.addresses.contains_key(addr) {
            return false;
        }
        if state.ready.remove(addr).is_some() {
            warn!(address = %addr, "⚠️ Connection lost, reconnecting");
            self.rebuild_picker(&state);
        }
        true
    }

    /// 阻塞到连接不再健康或连接池关闭
    async fn watch_health(&self, addr: &str, channel: &Channel, recheck: &Notify) {
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return,
                _ = tokio::time::sleep(self.config.health_check_interval) => {}
                _ = recheck.notified() => {}
            }
            if let Err(reason) = check_health(channel.clone(), self.config.connect_timeout).await {
                warn!(address = %addr, reason = %reason, "Health check failed");
                return;
            }
        }
    }
}

/// 使用标准 gRPC 健康检查服务检查连接
///
/// 未实现健康检查服务的后端视为健康；只有传输失败、超时或 NOT_SERVING 才算不健康。
async fn check_health(channel: Channel, timeout: Duration) -> std::result::Result<(), String> {
    let mut client = HealthClient::new(channel);
    let request = HealthCheckRequest {
        service: String::new(),
    };
    match tokio::time::timeout(timeout, client.check(request)).await {
        Err(_) => Err(format!("no response within {timeout:?}")),
        Ok(Ok(response)) if response.get_ref().status == ServingStatus::NotServing as i32 => {
            Err("not serving".to_string())
        }
        Ok(Ok(_)) => Ok(()),
        Ok(Err(status)) if matches!(status.code(), Code::Unimplemented | Code::NotFound) => Ok(()),
        Ok(Err(status)) => Err(status.to_string()),
    }
}

async fn connection_loop(pool: Arc<ConnectionPool>, addr: String, recheck: Arc<Notify>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let attempt = match pool.connect(&addr).await {
            Ok(channel) => check_health(channel.clone(), pool.config.connect_timeout)
                .await
                .map(|()| channel),
            Err(e) => Err(e.to_string()),
        };

        match attempt {
            Ok(channel) => {
                if !pool.mark_ready(&addr, channel.clone()).await {
                    return;
                }
                backoff = INITIAL_BACKOFF;
                pool.watch_health(&addr, &channel, &recheck).await;
                if !pool.mark_unready(&addr).await {
                    return;
                }
            }
            Err(reason) => {
                warn!(address = %addr, error = %reason, retry_in = ?backoff, "Failed to connect, retrying");
                tokio::select! {
                    _ = pool.closed.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[async_trait]
impl ResolverUpdater for ConnectionPool {
    async fn update_state(&self, update: ResolverState) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut desired: HashMap<String, Address> = HashMap::with_capacity(update.addresses.len());
        for address in update.addresses {
            desired.entry(address.addr.clone()).or_insert(address);
        }

        let mut state = self.state.lock().await;
        let removed: Vec<String> = state
            .addresses
            .keys()
            .filter(|addr| !desired.contains_key(*addr))
            .cloned()
            .collect();
        let mut ready_changed = false;
        for addr in &removed {
            ready_changed |= state.ready.remove(addr).is_some();
            if let Some(task) = state.tasks.remove(addr) {
                task.handle.abort();
            }
        }
        // 保留的就绪地址属性变化时，选择器需要看到新的实例信息
        ready_changed |= state
            .ready
            .keys()
            .any(|addr| state.addresses.get(addr) != desired.get(addr));

        let mut added = 0;
        for addr in desired.keys() {
            if state.tasks.contains_key(addr) {
                continue;
            }
            if let Some(task) = self.spawn_task(addr.clone()) {
                state.tasks.insert(addr.clone(), task);
                added += 1;
            }
        }

        state.addresses = desired;
        if ready_changed {
            self.rebuild_picker(&state);
        }
        info!(
            total = state.addresses.len(),
            added,
            removed = removed.len(),
            "Connection pool updated"
        );
        Ok(())
    }
}
