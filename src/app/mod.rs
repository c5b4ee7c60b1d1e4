//! 应用编排器
//!
//! 负责并发启动所有服务器、在监听就绪后注册服务实例、等待终止信号或服务器故障，
//! 并在超时约束下完成停止与注销。
//!
//! # 使用示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flare_micro::app::App;
//! use flare_micro::registry::MemoryRegistry;
//! use flare_micro::server::RpcServerBuilder;
//!
//! # async fn run() -> flare_micro::Result<()> {
//! let rpc = RpcServerBuilder::new()
//!     .address(":9000")
//!     .bind(|router| router /* .add_service(UserServer::new(svc)) */)
//!     .await?;
//!
//! let app = App::builder("user")
//!     .with_version("v1")
//!     .with_registrar(Arc::new(MemoryRegistry::new()))
//!     .add_server(Arc::new(rpc))
//!     .build();
//!
//! app.run().await
//! # }
//! ```
//!
//! # 生命周期
//!
//! `Created → Starting → Running → Stopping → Stopped`，任一阶段出错进入 `Failed`。
//! 信号、服务器故障和显式 `stop()` 都汇聚到同一个根取消令牌上。

pub mod signal;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::registry::{Registrar, ServiceInstance};
use crate::server::Server;

pub use signal::ShutdownSignal;

/// 默认注册超时
pub const DEFAULT_REGISTRAR_TIMEOUT: Duration = Duration::from_secs(10);

/// 默认停止超时
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// 等待后台任务退出时在停止超时之外额外给出的时间
const STOP_GRACE: Duration = Duration::from_millis(500);

/// 应用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AppState::Created => "created",
            AppState::Starting => "starting",
            AppState::Running => "running",
            AppState::Stopping => "stopping",
            AppState::Stopped => "stopped",
            AppState::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct AppOptions {
    id: String,
    name: String,
    version: String,
    metadata: HashMap<String, String>,
    endpoints: Vec<String>,
    registrar: Option<Arc<dyn Registrar>>,
    registrar_timeout: Duration,
    stop_timeout: Duration,
    signals: Vec<ShutdownSignal>,
    servers: Vec<Arc<dyn Server>>,
}

/// 应用构建器
pub struct AppBuilder {
    options: AppOptions,
}

impl AppBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            options: AppOptions {
                id: Uuid::new_v4().to_string(),
                name: name.into(),
                version: String::new(),
                metadata: HashMap::new(),
                endpoints: Vec::new(),
                registrar: None,
                registrar_timeout: DEFAULT_REGISTRAR_TIMEOUT,
                stop_timeout: DEFAULT_STOP_TIMEOUT,
                signals: vec![
                    ShutdownSignal::Terminate,
                    ShutdownSignal::Interrupt,
                    ShutdownSignal::Quit,
                ],
                servers: Vec::new(),
            },
        }
    }

    /// 从配置创建，服务器与注册中心需另行添加
    pub fn from_config(config: &AppConfig) -> Self {
        let mut builder = Self::new(config.name.clone())
            .with_version(config.version.clone())
            .with_registrar_timeout(config.registrar_timeout())
            .with_stop_timeout(config.stop_timeout())
            .with_signals(config.signals.clone());
        if let Some(id) = &config.id {
            builder = builder.with_id(id.clone());
        }
        for (key, value) in &config.metadata {
            builder = builder.with_metadata(key.clone(), value.clone());
        }
        for endpoint in &config.endpoints {
            builder = builder.with_endpoint(endpoint.clone());
        }
        builder
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.options.id = id.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.options.version = version.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.metadata.insert(key.into(), value.into());
        self
    }

    /// 额外公布的端点，与服务器自报的端点合并
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.options.endpoints.push(endpoint.into());
        self
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn Registrar>) -> Self {
        self.options.registrar = Some(registrar);
        self
    }

    pub fn with_registrar_timeout(mut self, timeout: Duration) -> Self {
        self.options.registrar_timeout = timeout;
        self
    }

    /// 每个服务器停止以及注销各自的超时
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.options.stop_timeout = timeout;
        self
    }

    /// 监听的终止信号，空列表表示不监听
    pub fn with_signals(mut self, signals: Vec<ShutdownSignal>) -> Self {
        self.options.signals = signals;
        self
    }

    pub fn add_server(mut self, server: Arc<dyn Server>) -> Self {
        self.options.servers.push(server);
        self
    }

    pub fn build(self) -> App {
        App {
            inner: Arc::new(AppInner {
                options: self.options,
                instance: Mutex::new(None),
                cancel: ArcSwapOption::empty(),
                state: watch::channel(AppState::Created).0,
                registered: AtomicBool::new(false),
            }),
        }
    }
}

/// 应用
///
/// 可以克隆后在其他任务中调用 [`App::stop`]。
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

struct AppInner {
    options: AppOptions,
    /// 启动时写入，停止路径读取
    instance: Mutex<Option<ServiceInstance>>,
    /// 当前运行的根取消令牌，与进入 `Starting` 同时写入
    cancel: ArcSwapOption<CancellationToken>,
    state: watch::Sender<AppState>,
    registered: AtomicBool,
}

impl App {
    pub fn builder(name: impl Into<String>) -> AppBuilder {
        AppBuilder::new(name)
    }

    pub fn id(&self) -> &str {
        &self.inner.options.id
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn state(&self) -> AppState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AppState> {
        self.inner.state.subscribe()
    }

    /// 本次运行构建的服务实例
    pub async fn instance(&self) -> Option<ServiceInstance> {
        self.inner.instance.lock().await.clone()
    }

    /// 运行直到收到信号、某个服务器失败或调用 [`App::stop`]
    ///
    /// 返回第一个出现的错误；干净退出时返回 `Ok(())`。
    pub async fn run(&self) -> Result<()> {
        let root = CancellationToken::new();
        let mut entered = false;
        self.inner.state.send_if_modified(|state| {
            if matches!(state, AppState::Created | AppState::Stopped | AppState::Failed) {
                *state = AppState::Starting;
                self.inner.cancel.store(Some(Arc::new(root.clone())));
                entered = true;
            }
            entered
        });
        if !entered {
            return Err(Error::Task("app is already running".to_string()));
        }

        let options = &self.inner.options;
        let instance = self.build_instance();
        info!(
            app = %options.name,
            id = %options.id,
            endpoints = ?instance.endpoints,
            servers = options.servers.len(),
            "🚀 Starting app"
        );
        *self.inner.instance.lock().await = Some(instance.clone());

        let signal = match signal::listen(&options.signals) {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "❌ Failed to install signal handlers");
                self.finish_run();
                self.set_state(AppState::Failed);
                return Err(e.into());
            }
        };

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let (launched_tx, mut launched_rx) = mpsc::channel::<()>(options.servers.len().max(1));
        for server in &options.servers {
            tasks.spawn(watch_stop(server.clone(), root.clone(), options.stop_timeout));

            let server = server.clone();
            let root = root.clone();
            let launched = launched_tx.clone();
            tasks.spawn(async move {
                let _ = launched.send(()).await;
                drop(launched);

                let result = server.start(root.clone()).await;
                match &result {
                    Ok(()) => debug!(kind = %server.kind(), "server exited"),
                    Err(e) => error!(kind = %server.kind(), error = %e, "❌ Server failed"),
                }
                root.cancel();
                result
            });
        }
        drop(launched_tx);
        while launched_rx.recv().await.is_some() {}

        if let Err(e) = self.register(&instance, &root).await {
            error!(app = %options.name, error = %e, "❌ Service registration failed, shutting down");
            root.cancel();
            let mut first_error = None;
            drain(&mut tasks, options.stop_timeout, &mut first_error).await;
            self.finish_run();
            self.set_state(AppState::Failed);
            return Err(e);
        }

        tasks.spawn({
            let app = self.clone();
            let root = root.clone();
            async move {
                tokio::select! {
                    sig = signal => {
                        info!(signal = %sig, "Shutdown signal received");
                        if let Err(e) = app.stop().await {
                            warn!(error = %e, "⚠️ Stop after signal reported an error");
                        }
                    }
                    _ = root.cancelled() => {}
                }
                Ok(())
            }
        });

        // 启动期间已经请求停止时不再进入 Running
        if !root.is_cancelled() {
            self.set_state(AppState::Running);
            info!(app = %options.name, id = %options.id, "✅ App running");
        }

        let mut first_error = None;
        loop {
            tokio::select! {
                _ = root.cancelled() => break,
                joined = tasks.join_next() => match joined {
                    Some(joined) => record(&mut first_error, joined),
                    None => break,
                },
            }
        }

        self.set_state(AppState::Stopping);
        info!(app = %options.name, "App stopping");
        if let Err(e) = self.deregister().await {
            warn!(error = %e, "⚠️ Failed to deregister service");
        }
        root.cancel();
        drain(&mut tasks, options.stop_timeout, &mut first_error).await;
        self.finish_run();

        match first_error {
            Some(e) => {
                error!(app = %options.name, error = %e, "❌ App stopped with error");
                self.set_state(AppState::Failed);
                Err(e)
            }
            None => {
                info!(app = %options.name, "✅ App stopped");
                self.set_state(AppState::Stopped);
                Ok(())
            }
        }
    }

    /// 停止运行中的应用
    ///
    /// 先注销（每次运行至多一次），再触发根取消令牌；返回注销的错误。
    pub async fn stop(&self) -> Result<()> {
        let result = self.deregister().await;
        if let Some(root) = self.inner.cancel.load_full() {
            root.cancel();
        }
        result
    }

    fn build_instance(&self) -> ServiceInstance {
        let options = &self.inner.options;
        let mut endpoints = options.endpoints.clone();
        for endpoint in options.servers.iter().filter_map(|server| server.endpoint()) {
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }
        ServiceInstance {
            id: options.id.clone(),
            name: options.name.clone(),
            version: options.version.clone(),
            metadata: options.metadata.clone(),
            endpoints,
        }
    }

    async fn register(&self, instance: &ServiceInstance, root: &CancellationToken) -> Result<()> {
        let Some(registrar) = &self.inner.options.registrar else {
            return Ok(());
        };
        // 某个服务器已经退出，不再公布
        if root.is_cancelled() {
            return Ok(());
        }

        let timeout = self.inner.options.registrar_timeout;
        let result = match tokio::time::timeout(timeout, registrar.register(instance)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: "register",
                timeout,
            }),
        };
        match result {
            Ok(()) => {
                self.inner.registered.store(true, Ordering::SeqCst);
                info!(service = %instance.name, id = %instance.id, "✅ Service registered");
                Ok(())
            }
            Err(e) => Err(Error::Registration(Box::new(e))),
        }
    }

    async fn deregister(&self) -> Result<()> {
        let Some(registrar) = &self.inner.options.registrar else {
            return Ok(());
        };
        if !self.inner.registered.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(instance) = self.inner.instance.lock().await.clone() else {
            return Ok(());
        };

        let timeout = self.inner.options.stop_timeout;
        let result = match tokio::time::timeout(timeout, registrar.deregister(&instance)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: "deregister",
                timeout,
            }),
        };
        match result {
            Ok(()) => {
                info!(service = %instance.name, id = %instance.id, "Service deregistered");
                Ok(())
            }
            Err(e) => Err(Error::Deregistration(Box::new(e))),
        }
    }

    fn finish_run(&self) {
        self.inner.cancel.store(None);
    }

    fn set_state(&self, state: AppState) {
        let previous = self.inner.state.send_replace(state);
        debug!(from = %previous, to = %state, "app state changed");
    }
}

/// 根令牌取消后在截止时间内停止服务器
async fn watch_stop(server: Arc<dyn Server>, root: CancellationToken, timeout: Duration) -> Result<()> {
    root.cancelled().await;
    let deadline = Instant::now() + timeout;
    match tokio::time::timeout_at(deadline, server.stop(deadline)).await {
        Ok(result) => result,
        Err(_) => Err(Error::ServerStop {
            kind: server.kind().to_string(),
            reason: format!("stop did not finish within {timeout:?}"),
        }),
    }
}

/// 等待剩余任务，超过停止超时加宽限期后直接中止
async fn drain(tasks: &mut JoinSet<Result<()>>, stop_timeout: Duration, first_error: &mut Option<Error>) {
    let joined = tokio::time::timeout(stop_timeout + STOP_GRACE, async {
        while let Some(joined) = tasks.join_next().await {
            record(first_error, joined);
        }
    })
    .await;
    if joined.is_err() {
        warn!(remaining = tasks.len(), "⚠️ Tasks did not finish in time, aborting");
        tasks.shutdown().await;
    }
}

fn record(first_error: &mut Option<Error>, joined: std::result::Result<Result<()>, JoinError>) {
    let result = joined.map_err(|e| Error::Task(e.to_string())).and_then(|result| result);
    if let Err(e) = result {
        if first_error.is_none() {
            *first_error = Some(e);
        } else {
            warn!(error = %e, "Secondary error while stopping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Discovery, MemoryRegistry};

    fn quiet(name: &str) -> AppBuilder {
        App::builder(name).with_signals(Vec::new())
    }

    #[test]
    fn builder_defaults() {
        let app = App::builder("user").build();
        assert_eq!(app.name(), "user");
        assert!(Uuid::parse_str(app.id()).is_ok());
        assert_eq!(app.state(), AppState::Created);
        assert_eq!(app.inner.options.signals.len(), 3);
    }

    #[test]
    fn from_config_copies_identity() {
        let config: AppConfig = toml::from_str(
            r#"
            name = "order"
            id = "order-1"
            version = "v2"
            endpoints = ["grpc://10.0.0.9:9000"]
            metadata = { zone = "b" }
            stop_timeout_secs = 1
            "#,
        )
        .unwrap();
        let app = AppBuilder::from_config(&config).build();
        let instance = app.build_instance();
        assert_eq!(instance.id, "order-1");
        assert_eq!(instance.version, "v2");
        assert_eq!(instance.metadata["zone"], "b");
        assert_eq!(instance.endpoints, vec!["grpc://10.0.0.9:9000".to_string()]);
        assert_eq!(app.inner.options.stop_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn run_without_servers_stops_on_request() {
        let registry = Arc::new(MemoryRegistry::new());
        let app = quiet("empty")
            .with_id("empty-1")
            .with_endpoint("grpc://127.0.0.1:1")
            .with_registrar(registry.clone())
            .build();

        let running = tokio::spawn({
            let app = app.clone();
            async move { app.run().await }
        });

        let mut states = app.subscribe_state();
        states.wait_for(|state| *state == AppState::Running).await.unwrap();
        assert_eq!(registry.get_service("empty").await.unwrap().len(), 1);

        app.stop().await.unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(app.state(), AppState::Stopped);
        assert!(registry.get_service("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_before_run_is_noop() {
        let app = quiet("idle").build();
        app.stop().await.unwrap();
        assert_eq!(app.state(), AppState::Created);
    }

    /// 注册阻塞到被放行
    #[derive(Default)]
    struct GatedRegistrar {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
        deregisters: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Registrar for GatedRegistrar {
        async fn register(&self, _instance: &ServiceInstance) -> Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }

        async fn deregister(&self, _instance: &ServiceInstance) -> Result<()> {
            self.deregisters.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_as_soon_as_starting_is_honoured() {
        let app = quiet("eager").build();
        let mut states = app.subscribe_state();
        let running = tokio::spawn({
            let app = app.clone();
            async move { app.run().await }
        });

        states.wait_for(|state| *state != AppState::Created).await.unwrap();
        app.stop().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("stop during start was lost")
            .unwrap()
            .unwrap();
        assert_eq!(app.state(), AppState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_during_registration_skips_running() {
        let registrar = Arc::new(GatedRegistrar::default());
        let app = quiet("gated").with_registrar(registrar.clone()).build();
        let running = tokio::spawn({
            let app = app.clone();
            async move { app.run().await }
        });

        registrar.entered.notified().await;
        assert_eq!(app.state(), AppState::Starting);
        app.stop().await.unwrap();
        registrar.release.notify_one();

        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("run did not return")
            .unwrap()
            .unwrap();
        assert_eq!(app.state(), AppState::Stopped);
        // 放行后才完成的注册在退出时被注销
        assert_eq!(registrar.deregisters.load(Ordering::SeqCst), 1);
    }
}
