//! 端点 URI 约定：`scheme://host:port[?isSecure=true]`

use http::Uri;

use crate::error::{Error, Result};

/// 安全标记的查询参数名
pub const SECURE_QUERY_KEY: &str = "isSecure";

/// 构建端点 URI
pub fn new_endpoint(scheme: &str, host: &str, secure: bool) -> String {
    if secure {
        format!("{scheme}://{host}?{SECURE_QUERY_KEY}=true")
    } else {
        format!("{scheme}://{host}")
    }
}

/// 从端点列表中找出 scheme 与安全标记都匹配的第一个地址
///
/// 没有匹配时返回 `None`；任一端点不是合法 URI 时返回 `InvalidEndpoint`。
pub fn parse_endpoint(endpoints: &[String], scheme: &str, secure: bool) -> Result<Option<String>> {
    for raw in endpoints {
        let uri: Uri = raw
            .parse()
            .map_err(|_| Error::InvalidEndpoint(raw.clone()))?;
        if uri.scheme_str() != Some(scheme) || is_secure(&uri) != secure {
            continue;
        }
        if let Some(authority) = uri.authority() {
            return Ok(Some(authority.as_str().to_string()));
        }
    }
    Ok(None)
}

/// 读取 `isSecure` 查询参数，无法解析时视为 false
pub fn is_secure(uri: &Uri) -> bool {
    uri.query()
        .into_iter()
        .flat_map(|query| query.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == SECURE_QUERY_KEY)
        .and_then(|(_, value)| parse_bool(value))
        .unwrap_or(false)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
