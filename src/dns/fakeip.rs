use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::{Ipv4Net, Ipv6Net};
use tokio::sync::RwLock;
use tracing::debug;

use super::message::fqdn;
use super::server::fakedns::FakeIpAllocator;

pub const DEFAULT_IPV4_RANGE: &str = "198.18.0.0/15";
pub const DEFAULT_IPV6_RANGE: &str = "fc00::/18";

#[derive(Debug, Default, Clone, Copy)]
struct FakeEntry {
    v4: Option<Ipv4Addr>,
    v6: Option<Ipv6Addr>,
}

#[derive(Debug, Default)]
struct Mappings {
    by_domain: HashMap<String, FakeEntry>,
    by_ip: HashMap<IpAddr, String>,
    /// 下一个分配偏移；0 为网络地址，跳过
    next_v4: u64,
    next_v6: u64,
}

/// FakeIP 池：按域名分配虚拟地址并维护双向映射
///
/// 地址池用尽后环绕复用，被复用地址的旧域名映射随之移除。
pub struct FakeIpPool {
    ipv4: Ipv4Net,
    ipv6: Option<Ipv6Net>,
    mappings: RwLock<Mappings>,
}

impl FakeIpPool {
    pub fn new(ipv4: Ipv4Net, ipv6: Option<Ipv6Net>) -> Self {
        Self {
            ipv4: ipv4.trunc(),
            ipv6: ipv6.map(|net| net.trunc()),
            mappings: RwLock::new(Mappings {
                next_v4: 1,
                next_v6: 1,
                ..Mappings::default()
            }),
        }
    }

    /// 从 CIDR 字符串构建
    pub fn parse(ipv4: &str, ipv6: Option<&str>) -> Result<Self> {
        let v4: Ipv4Net = ipv4
            .parse()
            .with_context(|| format!("invalid fake-ip ipv4 range: {}", ipv4))?;
        let v6 = ipv6
            .map(|s| {
                s.parse::<Ipv6Net>()
                    .with_context(|| format!("invalid fake-ip ipv6 range: {}", s))
            })
            .transpose()?;
        Ok(Self::new(v4, v6))
    }

    fn v4_capacity(&self) -> u64 {
        1u64 << (32 - self.ipv4.prefix_len())
    }

    fn v6_capacity(net: &Ipv6Net) -> u64 {
        // 偏移限制在 u64 内
        let host_bits = 128 - net.prefix_len() as u32;
        if host_bits >= 64 {
            u64::MAX
        } else {
            1u64 << host_bits
        }
    }

    /// 取域名对应的地址，不存在时分配；IPv6 未配置时只返回 IPv4
    pub async fn allocate(&self, domain: &str) -> Vec<IpAddr> {
        let key = fqdn(domain);
        {
            let mappings = self.mappings.read().await;
            if let Some(entry) = mappings.by_domain.get(&key) {
                if entry.v4.is_some() && (self.ipv6.is_none() || entry.v6.is_some()) {
                    return entry_addrs(entry);
                }
            }
        }

        let mut guard = self.mappings.write().await;
        let mappings = &mut *guard;
        let mut entry = mappings.by_domain.get(&key).copied().unwrap_or_default();

        if entry.v4.is_none() {
            let offset = next_offset(&mut mappings.next_v4, self.v4_capacity());
            let addr = Ipv4Addr::from(u32::from(self.ipv4.network()).wrapping_add(offset as u32));
            release(mappings, IpAddr::V4(addr));
            mappings.by_ip.insert(IpAddr::V4(addr), key.clone());
            entry.v4 = Some(addr);
        }

        if let (None, Some(net)) = (entry.v6, self.ipv6.as_ref()) {
            let offset = next_offset(&mut mappings.next_v6, Self::v6_capacity(net));
            let addr = Ipv6Addr::from(u128::from(net.network()).wrapping_add(offset as u128));
            release(mappings, IpAddr::V6(addr));
            mappings.by_ip.insert(IpAddr::V6(addr), key.clone());
            entry.v6 = Some(addr);
        }

        mappings.by_domain.insert(key.clone(), entry);
        debug!(domain = %key, v4 = ?entry.v4, v6 = ?entry.v6, "FakeIP allocated");
        entry_addrs(&entry)
    }

    /// 反查：FakeIP → 域名（带末尾点）
    pub async fn lookup(&self, ip: IpAddr) -> Option<String> {
        self.mappings.read().await.by_ip.get(&ip).cloned()
    }

    /// 地址是否落在池范围内
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.ipv4.contains(&v4),
            IpAddr::V6(v6) => self.ipv6.as_ref().is_some_and(|net| net.contains(&v6)),
        }
    }

    pub async fn len(&self) -> usize {
        self.mappings.read().await.by_domain.len()
    }
}

fn next_offset(counter: &mut u64, capacity: u64) -> u64 {
    let mut offset = *counter % capacity;
    if offset == 0 && capacity > 1 {
        offset = 1;
    }
    *counter = offset.wrapping_add(1);
    offset
}

fn entry_addrs(entry: &FakeEntry) -> Vec<IpAddr> {
    entry
        .v4
        .map(IpAddr::V4)
        .into_iter()
        .chain(entry.v6.map(IpAddr::V6))
        .collect()
}

/// 地址被环绕复用时，清掉它原先所属域名的对应槽位
fn release(mappings: &mut Mappings, ip: IpAddr) {
    let Some(old) = mappings.by_ip.remove(&ip) else {
        return;
    };
    if let Some(entry) = mappings.by_domain.get_mut(&old) {
        match ip {
            IpAddr::V4(_) => entry.v4 = None,
            IpAddr::V6(_) => entry.v6 = None,
        }
        if entry.v4.is_none() && entry.v6.is_none() {
            mappings.by_domain.remove(&old);
        }
    }
}

#[async_trait]
impl FakeIpAllocator for FakeIpPool {
    async fn allocate(&self, domain: &str) -> Vec<IpAddr> {
        FakeIpPool::allocate(self, domain).await
    }
}
