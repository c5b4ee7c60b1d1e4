//! Picker：把就绪连接暴露给选择器，并按调用选择连接

use std::collections::HashMap;
use std::sync::Arc;

use tonic::Status;
use tonic::transport::Channel;
use tracing::debug;

use crate::error::{Error, Result};
use crate::selector::{DoneFunc, DoneInfo, Node, PickInfo, Selector, Trailer};

/// 一个就绪连接
#[derive(Clone)]
pub(crate) struct ReadyConn {
    pub(crate) node: Node,
    pub(crate) channel: Channel,
}

/// pick 的结果
pub struct Picked {
    pub node: Node,
    pub channel: Channel,
    pub done: Option<DoneFunc>,
}

/// 由某一时刻的就绪连接集合构建的 picker
///
/// 选择器在连接池内共享，picker 只持有构建时刻的连接快照。
pub struct Picker {
    inner: Option<PickerInner>,
}

struct PickerInner {
    selector: Arc<dyn Selector>,
    channels: HashMap<String, Channel>,
}

impl Picker {
    /// 没有就绪连接时的 picker，所有 pick 立即失败
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// 把就绪节点交给选择器，并以就绪连接构建 picker
    pub(crate) fn new(selector: Arc<dyn Selector>, ready: Vec<ReadyConn>) -> Self {
        let mut nodes = Vec::with_capacity(ready.len());
        let mut channels = HashMap::with_capacity(ready.len());
        for conn in ready {
            channels.insert(conn.node.address().to_string(), conn.channel);
            nodes.push(conn.node);
        }
        debug!(nodes = nodes.len(), "building picker");

        selector.apply(nodes);
        if channels.is_empty() {
            return Self::empty();
        }
        Self {
            inner: Some(PickerInner { selector, channels }),
        }
    }

    /// 就绪连接数量
    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.channels.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 为一次调用选择连接
    ///
    /// 选择器可以阻塞，但不会超过调用的截止时间；选择器返回的错误原样返回。
    pub async fn pick(&self, info: &PickInfo) -> Result<Picked> {
        self.try_pick(info)
            .await?
            .ok_or_else(|| Error::Selector("selected node is not ready".into()))
    }

    /// 选择器已切换到更新的节点集合时返回 `None`
    pub(crate) async fn try_pick(&self, info: &PickInfo) -> Result<Option<Picked>> {
        let Some(inner) = &self.inner else {
            return Err(Error::NoConnectionAvailable);
        };

        let selected = match info.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, inner.selector.select(info))
                .await
                .map_err(|_| Error::DeadlineExceeded)?,
            None => inner.selector.select(info).await,
        };
        let (node, done) = selected?;

        match inner.channels.get(node.address()) {
            Some(channel) => Ok(Some(Picked {
                channel: channel.clone(),
                node,
                done,
            })),
            None => {
                if let Some(done) = done {
                    done(DoneInfo {
                        error: Some(Status::unavailable("node is no longer ready")),
                        bytes_sent: 0,
                        bytes_received: 0,
                        reply_md: Trailer::default(),
                    });
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{SelectorBuilder, Strategy};
    use async_trait::async_trait;
    use std::time::Duration;
    use tonic::transport::Endpoint;

    fn lazy_channel(addr: &str) -> Channel {
        Endpoint::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect_lazy()
    }

    fn ready(addr: &str) -> ReadyConn {
        ReadyConn {
            node: Node::new("grpc", addr, None),
            channel: lazy_channel(addr),
        }
    }

    struct Failing;

    #[async_trait]
    impl Selector for Failing {
        fn apply(&self, _nodes: Vec<Node>) {}

        async fn select(&self, _info: &PickInfo) -> Result<(Node, Option<DoneFunc>)> {
            Err(Error::Selector("rate limited".into()))
        }
    }

    struct Stalling;

    #[async_trait]
    impl Selector for Stalling {
        fn apply(&self, _nodes: Vec<Node>) {}

        async fn select(&self, _info: &PickInfo) -> Result<(Node, Option<DoneFunc>)> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn empty_picker_fails_immediately() {
        let picker = Picker::new(Strategy::RoundRobin.build(), Vec::new());
        for _ in 0..3 {
            assert!(matches!(
                picker.pick(&PickInfo::default()).await,
                Err(Error::NoConnectionAvailable)
            ));
        }
        assert!(picker.is_empty());
    }

    #[tokio::test]
    async fn picks_channel_of_selected_node() {
        let picker = Picker::new(Strategy::RoundRobin.build(), vec![ready("127.0.0.1:1"), ready("127.0.0.1:2")]);
        assert_eq!(picker.len(), 2);

        let mut addrs = Vec::new();
        for _ in 0..2 {
            addrs.push(picker.pick(&PickInfo::default()).await.unwrap().node.address().to_string());
        }
        addrs.sort();
        assert_eq!(addrs, ["127.0.0.1:1", "127.0.0.1:2"]);
    }

    #[tokio::test]
    async fn selector_errors_surface_verbatim() {
        let picker = Picker::new(Arc::new(Failing), vec![ready("127.0.0.1:1")]);
        match picker.pick(&PickInfo::default()).await {
            Err(Error::Selector(msg)) => assert_eq!(msg, "rate limited"),
            _ => panic!("expected selector error"),
        }
    }

    #[tokio::test]
    async fn blocking_select_is_bounded_by_deadline() {
        let picker = Picker::new(Arc::new(Stalling), vec![ready("127.0.0.1:1")]);
        let info = PickInfo {
            deadline: Some(tokio::time::Instant::now() + Duration::from_millis(20)),
            ..Default::default()
        };
        assert!(matches!(picker.pick(&info).await, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn node_outside_snapshot_is_reported_stale() {
        let selector = Strategy::RoundRobin.build();
        let picker = Picker::new(selector.clone(), vec![ready("127.0.0.1:1")]);

        // 更新的 picker 已把选择器切换到新的节点集合
        let _newer = Picker::new(selector, vec![ready("127.0.0.1:2")]);
        assert!(picker.try_pick(&PickInfo::default()).await.unwrap().is_none());
        assert!(matches!(
            picker.pick(&PickInfo::default()).await,
            Err(Error::Selector(_))
        ));
    }
}
