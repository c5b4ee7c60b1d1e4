//! P2C（Power of Two Choices）选择器
//!
//! 随机取两个节点，选择 `EWMA 延迟 × (在途请求数 + 1)` 较小者。
//! 完成回调用本次调用耗时更新 EWMA，失败的调用按惩罚延迟计入。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use rand::Rng;

use super::{DoneFunc, DoneInfo, Node, PickInfo, Selector};
use crate::error::{Error, Result};

/// 失败调用计入的延迟
const PENALTY: Duration = Duration::from_secs(1);

/// EWMA 中新样本的权重
const EWMA_ALPHA: f64 = 0.3;

#[derive(Default)]
struct NodeStats {
    inflight: AtomicI64,
    /// 纳秒
    lag: AtomicU64,
}

impl NodeStats {
    fn load(&self) -> u128 {
        let lag = self.lag.load(Ordering::Relaxed) as u128;
        let inflight = self.inflight.load(Ordering::Relaxed).max(0) as u128;
        (lag + 1) * (inflight + 1)
    }

    fn observe(&self, rtt: Duration) {
        let sample = rtt.as_nanos().min(u64::MAX as u128) as u64;
        let _ = self
            .lag
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                if old == 0 {
                    Some(sample)
                } else {
                    Some((old as f64 * (1.0 - EWMA_ALPHA) + sample as f64 * EWMA_ALPHA) as u64)
                }
            });
    }
}

#[derive(Clone)]
struct WeightedNode {
    node: Node,
    stats: Arc<NodeStats>,
}

/// P2C 选择器，同地址节点的统计在 `apply` 之间保留
pub struct P2c {
    nodes: ArcSwap<Vec<WeightedNode>>,
}

impl P2c {
    pub fn new() -> Self {
        Self {
            nodes: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl Default for P2c {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Selector for P2c {
    fn apply(&self, nodes: Vec<Node>) {
        let previous: HashMap<String, Arc<NodeStats>> = self
            .nodes
            .load()
            .iter()
            .map(|w| (w.node.address().to_string(), w.stats.clone()))
            .collect();

        let weighted = nodes
            .into_iter()
            .map(|node| {
                let stats = previous.get(node.address()).cloned().unwrap_or_default();
                WeightedNode { node, stats }
            })
            .collect();
        self.nodes.store(Arc::new(weighted));
    }

    async fn select(&self, _info: &PickInfo) -> Result<(Node, Option<DoneFunc>)> {
        let chosen = {
            let nodes = self.nodes.load();
            match nodes.len() {
                0 => return Err(Error::NoAvailableNode),
                1 => nodes[0].clone(),
                len => {
                    let mut rng = rand::thread_rng();
                    let a = rng.gen_range(0..len);
                    let mut b = rng.gen_range(0..len - 1);
                    if b >= a {
                        b += 1;
                    }
                    let (first, second) = (&nodes[a], &nodes[b]);
                    if second.stats.load() < first.stats.load() {
                        second.clone()
                    } else {
                        first.clone()
                    }
                }
            }
        };

        chosen.stats.inflight.fetch_add(1, Ordering::Relaxed);
        let stats = chosen.stats.clone();
        let start = Instant::now();
        let done: DoneFunc = Box::new(move |info: DoneInfo| {
            stats.inflight.fetch_sub(1, Ordering::Relaxed);
            let mut rtt = start.elapsed();
            if info.error.is_some() {
                rtt = rtt.max(PENALTY);
            }
            stats.observe(rtt);
        });
        Ok((chosen.node, Some(done)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Trailer;
    use crate::selector::tests::node;

    fn done_info(error: Option<tonic::Status>) -> DoneInfo {
        DoneInfo {
            error,
            bytes_sent: 0,
            bytes_received: 0,
            reply_md: Trailer::default(),
        }
    }

    async fn pick(selector: &P2c) -> (String, DoneFunc) {
        let (node, done) = selector.select(&PickInfo::default()).await.unwrap();
        (node.address().to_string(), done.expect("p2c always returns a done callback"))
    }

    #[tokio::test]
    async fn failed_node_is_avoided() {
        let selector = P2c::new();
        selector.apply(vec![node("a:1", ""), node("b:1", "")]);

        let (failed, done) = pick(&selector).await;
        done(done_info(Some(tonic::Status::unavailable("down"))));

        for _ in 0..10 {
            let (addr, done) = pick(&selector).await;
            assert_ne!(addr, failed);
            done(done_info(None));
        }

        // 统计在重新 apply 后保留
        selector.apply(vec![node("b:1", ""), node("a:1", "")]);
        let (addr, _) = pick(&selector).await;
        assert_ne!(addr, failed);
    }

    #[tokio::test]
    async fn inflight_requests_spread_load() {
        let selector = P2c::new();
        selector.apply(vec![node("a:1", ""), node("b:1", "")]);

        let (first, _pending) = pick(&selector).await;
        let (second, _) = pick(&selector).await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn single_and_empty_population() {
        let selector = P2c::new();
        assert!(matches!(
            selector.select(&PickInfo::default()).await,
            Err(Error::NoAvailableNode)
        ));

        selector.apply(vec![node("a:1", "")]);
        let (addr, _) = pick(&selector).await;
        assert_eq!(addr, "a:1");
    }
}
