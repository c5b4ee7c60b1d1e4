//! etcd 注册中心集成测试
//!
//! 需要运行中的 etcd，默认忽略：
//! `cargo test --features etcd --test etcd_registry_test -- --ignored`
//!
//! ```bash
//! docker run -d --name etcd-test -p 2379:2379 \
//!   quay.io/coreos/etcd:v3.5.9 \
//!   etcd --advertise-client-urls=http://127.0.0.1:2379 \
//!        --listen-client-urls=http://0.0.0.0:2379
//! ```
#![cfg(feature = "etcd")]

use std::time::Duration;

use flare_micro::registry::{Discovery, EtcdRegistry, Registrar, ServiceInstance};

/// 可以通过环境变量 ETCD_ENDPOINTS 覆盖
fn etcd_endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["http://127.0.0.1:2379".to_string()])
}

const TEST_NAMESPACE: &str = "flare-micro-test";

fn instance(id: &str, port: u16) -> ServiceInstance {
    ServiceInstance::new(id, "etcd-user")
        .with_version("v1.0.0")
        .with_metadata("env", "test")
        .with_endpoint(format!("grpc://127.0.0.1:{port}"))
}

#[tokio::test]
#[ignore]
async fn register_and_get_service() {
    let registry = EtcdRegistry::connect(&etcd_endpoints(), TEST_NAMESPACE, 10)
        .await
        .expect("Failed to connect to etcd");

    let first = instance("etcd-user-1", 50051);
    registry.register(&first).await.unwrap();

    let instances = registry.get_service("etcd-user").await.unwrap();
    assert!(instances.contains(&first), "{instances:?}");

    registry.deregister(&first).await.unwrap();
    let instances = registry.get_service("etcd-user").await.unwrap();
    assert!(!instances.contains(&first));
}

#[tokio::test]
#[ignore]
async fn watcher_sees_changes() {
    let registry = EtcdRegistry::connect(&etcd_endpoints(), TEST_NAMESPACE, 10)
        .await
        .expect("Failed to connect to etcd");

    let second = instance("etcd-user-2", 50052);
    registry.register(&second).await.unwrap();

    let watcher = registry.watch("etcd-user").await.unwrap();
    let current = watcher.next().await.unwrap();
    assert!(current.contains(&second));

    let third = instance("etcd-user-3", 50053);
    registry.register(&third).await.unwrap();
    let updated = tokio::time::timeout(Duration::from_secs(5), watcher.next())
        .await
        .expect("watch did not fire")
        .unwrap();
    assert!(updated.contains(&third));

    registry.deregister(&second).await.unwrap();
    registry.deregister(&third).await.unwrap();
    watcher.stop().await.unwrap();
    assert!(watcher.next().await.is_err());
}
