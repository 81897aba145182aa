use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use serde::Deserialize;

use crate::dns::builder::ServerAddress;
use crate::dns::fakeip::{FakeIpPool, DEFAULT_IPV4_RANGE};
use crate::dns::IpOption;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    pub dns: DnsConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.dns.validate()
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DnsConfig {
    pub servers: Vec<String>,
    /// EDNS0 client-subnet 来源地址
    #[serde(default)]
    pub client_ip: Option<IpAddr>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub fake_ip: Option<FakeIpConfig>,
    /// `serve` 子命令的监听地址
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

fn default_timeout_ms() -> u64 {
    5000
}

impl DnsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            anyhow::bail!("at least one dns server is required");
        }
        for server in &self.servers {
            ServerAddress::parse(server)?;
        }
        if self.timeout_ms == 0 {
            anyhow::bail!("dns timeout-ms must be positive");
        }
        if let Some(fake) = &self.fake_ip {
            fake.build_pool()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    PreferIpv4,
    Ipv4Only,
    Ipv6Only,
    #[default]
    Dual,
}

impl Strategy {
    pub fn ip_option(self) -> IpOption {
        match self {
            Strategy::Ipv4Only => IpOption::ipv4_only(),
            Strategy::Ipv6Only => IpOption::ipv6_only(),
            Strategy::PreferIpv4 | Strategy::Dual => IpOption::dual(),
        }
    }

    /// 按策略排序结果；prefer-ipv4 把 IPv4 排在前面
    pub fn order(self, addrs: &mut [IpAddr]) {
        if self == Strategy::PreferIpv4 {
            addrs.sort_by_key(|ip| ip.is_ipv6());
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FakeIpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ipv4_range")]
    pub ipv4_range: String,
    #[serde(default)]
    pub ipv6_range: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_ipv4_range() -> String {
    DEFAULT_IPV4_RANGE.to_string()
}

impl FakeIpConfig {
    pub fn build_pool(&self) -> Result<FakeIpPool> {
        FakeIpPool::parse(&self.ipv4_range, self.ipv6_range.as_deref())
    }
}
