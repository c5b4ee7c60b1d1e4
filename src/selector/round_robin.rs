//! 轮询选择器

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use async_trait::async_trait;

use super::{DoneFunc, Node, PickInfo, Selector};
use crate::error::{Error, Result};

/// 轮询选择器
///
/// 节点集合保存在 `ArcSwap` 中，`apply` 一次性替换，
/// 并发的 `select` 只会看到旧集合或新集合之一。
pub struct RoundRobin {
    nodes: ArcSwap<Vec<Node>>,
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            nodes: ArcSwap::from_pointee(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    /// 当前节点集合的快照
    pub fn snapshot(&self) -> Arc<Vec<Node>> {
        self.nodes.load_full()
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Selector for RoundRobin {
    fn apply(&self, nodes: Vec<Node>) {
        self.nodes.store(Arc::new(nodes));
    }

    async fn select(&self, _info: &PickInfo) -> Result<(Node, Option<DoneFunc>)> {
        let nodes = self.nodes.load();
        if nodes.is_empty() {
            return Err(Error::NoAvailableNode);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        Ok((nodes[index % nodes.len()].clone(), None))
    }
}
