//! 静态地址解析：`direct:///10.0.0.1:9000,10.0.0.2:9000`

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Address, Resolver, ResolverBuilder, ResolverState, ResolverUpdater, Target};
use crate::error::{Error, Result};

pub const DIRECT_SCHEME: &str = "direct";

/// direct 解析器构建器，构建时一次性发布全部地址
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectBuilder;

#[async_trait]
impl ResolverBuilder for DirectBuilder {
    fn scheme(&self) -> &str {
        DIRECT_SCHEME
    }

    async fn build(
        &self,
        target: &Target,
        updater: Arc<dyn ResolverUpdater>,
    ) -> Result<Box<dyn Resolver>> {
        let mut addresses: Vec<Address> = Vec::new();
        for addr in target.endpoint.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            if !addresses.iter().any(|a| a.addr == addr) {
                addresses.push(Address::new(addr));
            }
        }
        if addresses.is_empty() {
            return Err(Error::InvalidTarget(target.to_string()));
        }

        debug!(target = %target, count = addresses.len(), "direct addresses resolved");
        updater.update_state(ResolverState { addresses }).await?;
        Ok(Box::new(DirectResolver))
    }
}

struct DirectResolver;

#[async_trait]
impl Resolver for DirectResolver {
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Vec<String>>>);

    #[async_trait]
    impl ResolverUpdater for Recorder {
        async fn update_state(&self, state: ResolverState) -> Result<()> {
            let addrs = state.addresses.into_iter().map(|a| a.addr).collect();
            self.0.lock().await.push(addrs);
            Ok(())
        }
    }

    #[tokio::test]
    async fn publishes_static_addresses_once() {
        let recorder = Arc::new(Recorder::default());
        let target = Target::parse("direct:///10.0.0.1:9000, 10.0.0.2:9000,,10.0.0.1:9000").unwrap();

        let resolver = DirectBuilder.build(&target, recorder.clone()).await.unwrap();
        resolver.resolve_now();
        resolver.close().await;

        let published = recorder.0.lock().await.clone();
        assert_eq!(published, vec![vec!["10.0.0.1:9000".to_string(), "10.0.0.2:9000".to_string()]]);
    }

    #[tokio::test]
    async fn empty_list_is_invalid() {
        let recorder = Arc::new(Recorder::default());
        let target = Target::parse("direct:///,").unwrap();
        assert!(matches!(
            DirectBuilder.build(&target, recorder).await,
            Err(Error::InvalidTarget(_))
        ));
    }
}
