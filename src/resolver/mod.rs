//! 名称解析
//!
//! 把客户端目标（如 `discovery:///user`、`direct:///a:1,b:2`）解析成持续更新的地址集合，
//! 通过 [`ResolverUpdater`] 推送给连接层。解析器按 scheme 显式注册在 [`ResolverRegistry`] 中。

pub mod direct;
pub mod discovery;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::registry::ServiceInstance;

pub use direct::{DIRECT_SCHEME, DirectBuilder};
pub use discovery::{DISCOVERY_SCHEME, DiscoveryBuilder, resolve_addresses};

/// 客户端拨号目标：`scheme://authority/endpoint`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub authority: String,
    pub endpoint: String,
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self> {
        let Some((scheme, rest)) = raw.split_once("://") else {
            // 裸地址按静态地址处理
            if raw.trim().is_empty() {
                return Err(Error::InvalidTarget(raw.to_string()));
            }
            return Ok(Self {
                scheme: DIRECT_SCHEME.to_string(),
                authority: String::new(),
                endpoint: raw.trim().to_string(),
            });
        };
        let (authority, endpoint) = rest.split_once('/').unwrap_or((rest, ""));
        if scheme.is_empty() || endpoint.is_empty() {
            return Err(Error::InvalidTarget(raw.to_string()));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            endpoint: endpoint.to_string(),
        })
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.endpoint)
    }
}

/// 地址附带的属性：实例元数据加上完整实例的引用
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    values: HashMap<String, String>,
    instance: Option<Arc<ServiceInstance>>,
}

impl Attributes {
    pub fn from_instance(instance: Arc<ServiceInstance>) -> Self {
        Self {
            values: instance.metadata.clone(),
            instance: Some(instance),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn instance(&self) -> Option<&Arc<ServiceInstance>> {
        self.instance.as_ref()
    }
}

/// 解析出的一个地址
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    /// host:port
    pub addr: String,
    pub server_name: String,
    pub attributes: Attributes,
}

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            server_name: String::new(),
            attributes: Attributes::default(),
        }
    }
}

/// 一次发布的完整地址集合
#[derive(Debug, Clone, Default)]
pub struct ResolverState {
    pub addresses: Vec<Address>,
}

/// 接收地址更新的一方（连接池）
#[async_trait]
pub trait ResolverUpdater: Send + Sync {
    async fn update_state(&self, state: ResolverState) -> Result<()>;
}

/// 已构建的解析器
#[async_trait]
pub trait Resolver: Send + Sync {
    /// 推送式解析，无需主动触发
    fn resolve_now(&self) {}

    /// 关闭解析器，可重复调用
    async fn close(&self);
}

/// 按 scheme 构建解析器
#[async_trait]
pub trait ResolverBuilder: Send + Sync {
    fn scheme(&self) -> &str;

    async fn build(
        &self,
        target: &Target,
        updater: Arc<dyn ResolverUpdater>,
    ) -> Result<Box<dyn Resolver>>;
}

/// 显式的解析器注册表，按 scheme 查找，拨号时传入
#[derive(Clone)]
pub struct ResolverRegistry {
    builders: HashMap<String, Arc<dyn ResolverBuilder>>,
}

impl ResolverRegistry {
    /// 创建空注册表
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// 注册解析器，同 scheme 的旧解析器被替换
    pub fn register(&mut self, builder: Arc<dyn ResolverBuilder>) {
        self.builders.insert(builder.scheme().to_string(), builder);
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders.get(scheme).cloned()
    }
}

impl Default for ResolverRegistry {
    /// 默认包含 direct 解析器
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(DirectBuilder));
        registry
    }
}
