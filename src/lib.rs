//! Flare Micro Library
//!
//! Provides the microservice runtime for Flare services: discovery-driven gRPC name
//! resolution, pluggable client-side load balancing, and multi-server lifecycle
//! orchestration with registry registration.

pub mod app;
pub mod config;
pub mod error;
pub mod logging;
pub mod registry;

// gRPC 客户端
pub mod balancer;
pub mod client;
pub mod resolver;
pub mod selector;

// 服务端
pub mod server;

// Re-exports
pub use app::{App, AppBuilder, AppState, ShutdownSignal};
pub use balancer::BalancedChannel;
pub use client::ClientBuilder;
pub use config::Config;
pub use error::{Error, Result};
pub use registry::{Discovery, Registrar, Registry, ServiceInstance, Watcher};
pub use selector::Strategy;
pub use server::{RestServer, RestServerBuilder, RpcServer, RpcServerBuilder, Server};
