//! 负载均衡
//!
//! 连接池接收解析器推送的地址，维护就绪连接并持续检查其健康；picker 把就绪连接交给
//! 可插拔的选择器；`BalancedChannel` 把这一切包装成 tonic 可用的通道。

mod channel;
mod picker;
mod pool;

pub use channel::{BalancedChannel, DoneBody};
pub use picker::{Picked, Picker};
pub use pool::{DEFAULT_HEALTH_CHECK_INTERVAL, EndpointHook};

pub(crate) use pool::{ConnectionPool, PoolConfig};
