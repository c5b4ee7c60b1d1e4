//! 对外地址提取
//!
//! 配置中的 host 为空或为通配地址时，用本机出口 IP 替换；端口总是取实际绑定的端口。

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// 计算应当公布给注册中心的 host:port
pub fn extract(configured: &str, bound: SocketAddr) -> String {
    let host = split_host(configured);
    let port = bound.port();

    if host.is_empty() {
        return SocketAddr::new(local_ip().unwrap_or(Ipv4Addr::LOCALHOST.into()), port).to_string();
    }
    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => {
            SocketAddr::new(local_ip().unwrap_or(Ipv4Addr::LOCALHOST.into()), port).to_string()
        }
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{host}:{port}"),
    }
}

fn split_host(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        return rest.split_once(']').map(|(host, _)| host).unwrap_or(rest);
    }
    match address.rsplit_once(':') {
        // 未加方括号的 IPv6
        Some((host, _)) if host.contains(':') => address,
        Some((host, _)) => host,
        None => address,
    }
}

/// 通过 UDP connect 获取默认路由的本机地址，不会发送任何数据
fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
