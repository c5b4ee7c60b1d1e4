//! 随机选择器

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use rand::Rng;

use super::{DoneFunc, Node, PickInfo, Selector};
use crate::error::{Error, Result};

/// 均匀随机选择器
pub struct Random {
    nodes: ArcSwap<Vec<Node>>,
}

impl Random {
    pub fn new() -> Self {
        Self {
            nodes: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Selector for Random {
    fn apply(&self, nodes: Vec<Node>) {
        self.nodes.store(Arc::new(nodes));
    }

    async fn select(&self, _info: &PickInfo) -> Result<(Node, Option<DoneFunc>)> {
        let nodes = self.nodes.load();
        if nodes.is_empty() {
            return Err(Error::NoAvailableNode);
        }
        let index = rand::thread_rng().gen_range(0..nodes.len());
        Ok((nodes[index].clone(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::tests::node;
    use std::collections::HashSet;

    #[tokio::test]
    async fn picks_only_applied_nodes() {
        let selector = Random::new();
        selector.apply(vec![node("a:1", ""), node("b:1", "")]);

        let mut seen = HashSet::new();
        for _ in 0..200 {
            let (node, _) = selector.select(&PickInfo::default()).await.unwrap();
            seen.insert(node.address().to_string());
        }
        assert_eq!(seen, HashSet::from(["a:1".to_string(), "b:1".to_string()]));
    }
}
