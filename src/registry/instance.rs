//! 服务实例定义

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::endpoint;
use crate::error::Result;

/// 服务实例
///
/// 注册中心中可见的进程身份，每次 `App::run` 构建一次，构建后只读。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInstance {
    /// 实例 ID（进程内唯一，启动时生成）
    pub id: String,

    /// 服务名称
    pub name: String,

    /// 版本
    #[serde(default)]
    pub version: String,

    /// 元数据
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// 端点列表，每种传输一个，如 `grpc://10.0.0.1:9000`
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl ServiceInstance {
    /// 创建新的服务实例
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// 设置版本
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 添加端点
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    /// 检查是否匹配版本
    pub fn matches_version(&self, version: Option<&str>) -> bool {
        match version {
            None => true,
            Some(v) => self.version == v,
        }
    }

    /// 查找匹配 scheme 与安全标记的端点地址（host:port）
    pub fn endpoint(&self, scheme: &str, secure: bool) -> Result<Option<String>> {
        endpoint::parse_endpoint(&self.endpoints, scheme, secure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_fill_every_field() {
        let instance = ServiceInstance::new("id-1", "user")
            .with_version("v2")
            .with_metadata("zone", "a")
            .with_endpoint("grpc://10.0.0.1:9000");

        assert_eq!(instance.version, "v2");
        assert_eq!(instance.metadata.get("zone").map(String::as_str), Some("a"));
        assert!(instance.matches_version(Some("v2")));
        assert!(instance.matches_version(None));
        assert!(!instance.matches_version(Some("v1")));
        assert_eq!(
            instance.endpoint("grpc", false).unwrap().as_deref(),
            Some("10.0.0.1:9000")
        );
    }

    #[test]
    fn deserializes_without_optional_fields() {
        let instance: ServiceInstance =
            serde_json::from_str(r#"{"id":"1","name":"user"}"#).unwrap();
        assert!(instance.endpoints.is_empty());
        assert!(instance.metadata.is_empty());
    }
}
