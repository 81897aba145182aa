use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;

use super::fakeip::{FakeIpPool, DEFAULT_IPV4_RANGE};
use super::server::{
    DohNameServer, FakeIpAllocator, FakeNameServer, LocalNameServer, TcpNameServer, UdpNameServer,
};
use super::NameServer;

/// 解析后的服务器地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    /// `https://host[:port]/path`
    Https(String),
    /// `h3://host[:port]/path`
    H3(String),
    Local,
    Fake,
}

impl ServerAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.eq_ignore_ascii_case("localhost") || address.eq_ignore_ascii_case("local") {
            return Ok(Self::Local);
        }
        if address.eq_ignore_ascii_case("fakedns") || address.eq_ignore_ascii_case("fake-ip") {
            return Ok(Self::Fake);
        }
        if let Some(rest) = address.strip_prefix("udp://") {
            return Ok(Self::Udp(parse_socket_addr(rest, 53)?));
        }
        if let Some(rest) = address.strip_prefix("tcp://") {
            return Ok(Self::Tcp(parse_socket_addr(rest, 53)?));
        }
        if address.starts_with("https://") {
            check_url(address)?;
            return Ok(Self::Https(address.to_string()));
        }
        if let Some(rest) = address.strip_prefix("h3://") {
            check_url(&format!("https://{}", rest))?;
            return Ok(Self::H3(address.to_string()));
        }
        if address.contains("://") {
            anyhow::bail!("unsupported DNS server scheme: {}", address);
        }
        // 裸地址按 UDP 处理
        Ok(Self::Udp(parse_socket_addr(address, 53)?))
    }
}

/// 校验 URL 带主机名
fn check_url(url: &str) -> Result<()> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid DoH URL '{}': {}", url, e))?;
    if uri.host().map_or(true, |h| h.is_empty()) {
        anyhow::bail!("DoH URL missing host: {}", url);
    }
    Ok(())
}

/// 解析 "ip" / "ip:port" / "[ipv6]" / "[ipv6]:port"
fn parse_socket_addr(s: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let stripped = s.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = stripped.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    anyhow::bail!("invalid DNS address: {}", s)
}

/// 按地址字符串构建后端
///
/// `fakedns` 使用传入的分配器；未提供时用默认 IPv4 范围新建一个池。
pub async fn build_name_server(
    address: &str,
    fake_pool: Option<Arc<dyn FakeIpAllocator>>,
) -> Result<Arc<dyn NameServer>> {
    let server: Arc<dyn NameServer> = match ServerAddress::parse(address)? {
        ServerAddress::Udp(addr) => Arc::new(UdpNameServer::new(addr).await?),
        ServerAddress::Tcp(addr) => Arc::new(TcpNameServer::new(addr)),
        ServerAddress::Https(url) => Arc::new(DohNameServer::https(&url)?),
        ServerAddress::H3(url) => Arc::new(DohNameServer::h3(&url)?),
        ServerAddress::Local => Arc::new(LocalNameServer::new()),
        ServerAddress::Fake => {
            let pool = match fake_pool {
                Some(pool) => pool,
                None => Arc::new(FakeIpPool::parse(DEFAULT_IPV4_RANGE, None)?),
            };
            Arc::new(FakeNameServer::new(pool))
        }
    };
    Ok(server)
}
