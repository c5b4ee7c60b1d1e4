//! 节点选择器
//!
//! 可插拔的选择策略契约：`apply` 接收完整的节点集合（整体替换），
//! `select` 为每次调用选出一个节点并返回完成回调，回调把调用结果反馈给策略。

pub mod p2c;
pub mod random;
pub mod round_robin;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Result;
use crate::registry::ServiceInstance;

pub use p2c::P2c;
pub use random::Random;
pub use round_robin::RoundRobin;

/// 可被选择的调用目标
#[derive(Debug, Clone)]
pub struct Node {
    scheme: String,
    address: String,
    instance: Option<Arc<ServiceInstance>>,
}

impl Node {
    pub fn new(
        scheme: impl Into<String>,
        address: impl Into<String>,
        instance: Option<Arc<ServiceInstance>>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            address: address.into(),
            instance,
        }
    }

    /// 传输类型，如 `grpc`
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// host:port
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn instance(&self) -> Option<&Arc<ServiceInstance>> {
        self.instance.as_ref()
    }

    pub fn service_name(&self) -> &str {
        self.instance.as_deref().map_or("", |i| i.name.as_str())
    }

    pub fn version(&self) -> &str {
        self.instance.as_deref().map_or("", |i| i.version.as_str())
    }

    pub fn metadata(&self) -> Option<&HashMap<String, String>> {
        self.instance.as_deref().map(|i| &i.metadata)
    }

    /// 元数据中 `weight` 声明的初始权重
    pub fn initial_weight(&self) -> Option<u32> {
        self.metadata()?.get("weight")?.parse().ok()
    }
}

/// 一次调用的选择上下文
#[derive(Debug, Clone, Default)]
pub struct PickInfo {
    /// 调用路径，如 `/grpc.health.v1.Health/Check`
    pub method: String,
    /// 调用截止时间
    pub deadline: Option<Instant>,
    /// 请求元数据
    pub metadata: HeaderMap,
}

/// 响应 trailer 的只读视图
pub trait ReplyMetadata: Send + Sync {
    /// 返回 key 的第一个值，不存在时返回空字符串
    fn get(&self, key: &str) -> String;
}

/// 基于 `HeaderMap` 的 trailer
#[derive(Debug, Clone, Default)]
pub struct Trailer(HeaderMap);

impl Trailer {
    pub fn new(headers: HeaderMap) -> Self {
        Self(headers)
    }
}

impl ReplyMetadata for Trailer {
    fn get(&self, key: &str) -> String {
        self.0
            .get(key)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }
}

/// 调用完成信息
#[derive(Debug)]
pub struct DoneInfo {
    /// 调用失败时的状态
    pub error: Option<tonic::Status>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reply_md: Trailer,
}

/// 完成回调
pub type DoneFunc = Box<dyn FnOnce(DoneInfo) + Send>;

/// 选择策略
#[async_trait]
pub trait Selector: Send + Sync {
    /// 用完整的节点集合替换当前集合
    fn apply(&self, nodes: Vec<Node>);

    /// 选择一个节点，可以在截止时间内阻塞
    async fn select(&self, info: &PickInfo) -> Result<(Node, Option<DoneFunc>)>;
}

/// 每次节点集合变化时创建新的选择器
pub trait SelectorBuilder: Send + Sync {
    fn build(&self) -> Arc<dyn Selector>;
}

/// 内置的负载均衡策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// 轮询（Round Robin）
    #[default]
    RoundRobin,
    /// 随机（Random）
    Random,
    /// 两次随机选择，取延迟负载较低者
    P2c,
}

impl SelectorBuilder for Strategy {
    fn build(&self) -> Arc<dyn Selector> {
        match self {
            Strategy::RoundRobin => Arc::new(RoundRobin::new()),
            Strategy::Random => Arc::new(Random::new()),
            Strategy::P2c => Arc::new(P2c::new()),
        }
    }
}

/// 节点过滤器，在 `apply` 时作用于完整节点集合
pub type NodeFilter = Arc<dyn Fn(Vec<Node>) -> Vec<Node> + Send + Sync>;

/// 只保留指定版本的节点
pub fn version_filter(version: impl Into<String>) -> NodeFilter {
    let version = version.into();
    Arc::new(move |nodes: Vec<Node>| {
        nodes
            .into_iter()
            .filter(|node| node.version() == version)
            .collect()
    })
}

/// 带过滤器的策略构建器
#[derive(Clone, Default)]
pub struct StrategyBuilder {
    strategy: Strategy,
    filters: Vec<NodeFilter>,
}

impl StrategyBuilder {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: NodeFilter) -> Self {
        self.filters.push(filter);
        self
    }
}

impl fmt::Debug for StrategyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyBuilder")
            .field("strategy", &self.strategy)
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl SelectorBuilder for StrategyBuilder {
    fn build(&self) -> Arc<dyn Selector> {
        let inner = self.strategy.build();
        if self.filters.is_empty() {
            return inner;
        }
        Arc::new(Filtered {
            inner,
            filters: self.filters.clone(),
        })
    }
}

struct Filtered {
    inner: Arc<dyn Selector>,
    filters: Vec<NodeFilter>,
}

#[async_trait]
impl Selector for Filtered {
    fn apply(&self, nodes: Vec<Node>) {
        let nodes = self.filters.iter().fold(nodes, |nodes, filter| filter(nodes));
        self.inner.apply(nodes);
    }

    async fn select(&self, info: &PickInfo) -> Result<(Node, Option<DoneFunc>)> {
        self.inner.select(info).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use http::HeaderValue;

    pub(crate) fn node(addr: &str, version: &str) -> Node {
        let instance = ServiceInstance::new(addr, "user").with_version(version);
        Node::new("grpc", addr, Some(Arc::new(instance)))
    }

    #[test]
    fn trailer_returns_first_value_or_empty() {
        let mut headers = HeaderMap::new();
        headers.append("cpu-usage", HeaderValue::from_static("300"));
        headers.append("cpu-usage", HeaderValue::from_static("500"));
        let trailer = Trailer::new(headers);

        assert_eq!(trailer.get("cpu-usage"), "300");
        assert_eq!(trailer.get("missing"), "");
    }

    #[test]
    fn node_reads_instance_fields() {
        let instance = ServiceInstance::new("1", "user")
            .with_version("v2")
            .with_metadata("weight", "40");
        let node = Node::new("grpc", "10.0.0.1:9000", Some(Arc::new(instance)));

        assert_eq!(node.service_name(), "user");
        assert_eq!(node.version(), "v2");
        assert_eq!(node.initial_weight(), Some(40));
        assert_eq!(Node::new("grpc", "a:1", None).initial_weight(), None);
    }

    #[tokio::test]
    async fn version_filter_applies_before_strategy() {
        let selector = StrategyBuilder::new(Strategy::RoundRobin)
            .with_filter(version_filter("v2"))
            .build();
        selector.apply(vec![node("a:1", "v1"), node("b:1", "v2")]);

        for _ in 0..4 {
            let (picked, _) = selector.select(&PickInfo::default()).await.unwrap();
            assert_eq!(picked.address(), "b:1");
        }

        selector.apply(vec![node("a:1", "v1")]);
        assert!(matches!(
            selector.select(&PickInfo::default()).await,
            Err(Error::NoAvailableNode)
        ));
    }

    #[test]
    fn strategy_deserializes_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            strategy: Strategy,
        }
        let w: Wrapper = toml::from_str(r#"strategy = "p2c""#).unwrap();
        assert_eq!(w.strategy, Strategy::P2c);
        let w: Wrapper = toml::from_str(r#"strategy = "round_robin""#).unwrap();
        assert_eq!(w.strategy, Strategy::RoundRobin);
    }
}
