use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::ShutdownSignal;
use crate::error::{Error, Result};
use crate::selector::Strategy;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub app: AppConfig,
    pub rpc: Option<RpcServerConfig>,
    pub rest: Option<RestServerConfig>,
    #[serde(default)]
    pub clients: HashMap<String, ClientConfig>,
    pub registry: Option<RegistryConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// 不配置时启动时生成 uuid
    pub id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// 额外公布的端点
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_stage_timeout_secs")]
    pub registrar_timeout_secs: u64,
    #[serde(default = "default_stage_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_signals")]
    pub signals: Vec<ShutdownSignal>,
}

fn default_stage_timeout_secs() -> u64 {
    10
}

fn default_signals() -> Vec<ShutdownSignal> {
    vec![
        ShutdownSignal::Terminate,
        ShutdownSignal::Interrupt,
        ShutdownSignal::Quit,
    ]
}

impl AppConfig {
    pub fn registrar_timeout(&self) -> Duration {
        Duration::from_secs(self.registrar_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcServerConfig {
    #[serde(default = "default_rpc_address")]
    pub address: String,
    /// 单次请求超时
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub secure: bool,
}

fn default_rpc_address() -> String {
    ":0".to_string()
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            address: default_rpc_address(),
            timeout_ms: None,
            secure: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestServerConfig {
    #[serde(default = "default_rest_address")]
    pub address: String,
    #[serde(default = "default_true")]
    pub enable_health: bool,
}

fn default_rest_address() -> String {
    ":8080".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RestServerConfig {
    fn default() -> Self {
        Self {
            address: default_rest_address(),
            enable_health: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// 如 `discovery:///user` 或 `direct:///10.0.0.1:9000`
    pub target: String,
    #[serde(default = "default_client_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_stage_timeout_secs")]
    pub discovery_timeout_secs: u64,
    #[serde(default)]
    pub strategy: Strategy,
    /// 就绪连接的健康检查间隔
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

fn default_health_check_interval_ms() -> u64 {
    1000
}

fn default_client_timeout_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    #[default]
    Memory,
    Etcd,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub kind: RegistryKind,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_namespace() -> String {
    "flare".to_string()
}

fn default_ttl_secs() -> u64 {
    15
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: RegistryKind::default(),
            endpoints: Vec::new(),
            namespace: default_namespace(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// EnvFilter 指令，`RUST_LOG` 优先
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_true")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            color: true,
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }
}
