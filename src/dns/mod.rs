pub mod builder;
pub mod client;
pub mod ecs;
pub mod fakeip;
pub mod listener;
pub mod merge;
pub mod message;
pub mod record;
pub mod server;
pub mod signal;
pub mod state;

use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;

use crate::common::context::QueryContext;
use crate::common::error::DnsError;

pub use builder::build_name_server;
pub use client::NameServerChain;
pub use record::IpAnswer;

/// 地址族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn qtype(self) -> u16 {
        match self {
            Family::V4 => message::TYPE_A,
            Family::V6 => message::TYPE_AAAA,
        }
    }

    /// 信号总线 topic 后缀
    pub fn tag(self) -> &'static str {
        match self {
            Family::V4 => "4",
            Family::V6 => "6",
        }
    }

    pub fn matches(self, addr: &IpAddr) -> bool {
        matches!(
            (self, addr),
            (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_))
        )
    }
}

/// 查询选项：启用哪些地址族，以及是否允许 FakeIP
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpOption {
    pub ipv4_enable: bool,
    pub ipv6_enable: bool,
    pub fake_enable: bool,
}

impl IpOption {
    pub fn ipv4_only() -> Self {
        Self {
            ipv4_enable: true,
            ..Self::default()
        }
    }

    pub fn ipv6_only() -> Self {
        Self {
            ipv6_enable: true,
            ..Self::default()
        }
    }

    pub fn dual() -> Self {
        Self {
            ipv4_enable: true,
            ipv6_enable: true,
            fake_enable: false,
        }
    }

    pub fn with_fake(mut self, enable: bool) -> Self {
        self.fake_enable = enable;
        self
    }

    pub fn any_family(&self) -> bool {
        self.ipv4_enable || self.ipv6_enable
    }

    /// 启用的地址族，IPv4 在前
    pub fn families(&self) -> impl Iterator<Item = Family> {
        [
            self.ipv4_enable.then_some(Family::V4),
            self.ipv6_enable.then_some(Family::V6),
        ]
        .into_iter()
        .flatten()
    }
}

/// 单个 DNS 后端（UDP / TCP / DoH / DoH3 / 本地 / FakeIP）对外的统一契约
#[async_trait]
pub trait NameServer: Send + Sync {
    /// 用于日志与诊断的稳定标识
    fn name(&self) -> &str;

    /// 解析域名，同时返回结果的到期时间
    async fn query_ip_with_ttl(
        &self,
        ctx: &QueryContext,
        domain: &str,
        client_ip: Option<IpAddr>,
        option: IpOption,
        bypass_cache: bool,
    ) -> Result<IpAnswer, DnsError>;

    async fn query_ip(
        &self,
        ctx: &QueryContext,
        domain: &str,
        client_ip: Option<IpAddr>,
        option: IpOption,
        bypass_cache: bool,
    ) -> Result<Vec<IpAddr>, DnsError> {
        self.query_ip_with_ttl(ctx, domain, client_ip, option, bypass_cache)
            .await
            .map(|answer| answer.addrs)
    }

    /// 原始报文透传，供对外暴露的 DNS 监听器使用
    async fn query_raw(&self, _ctx: &QueryContext, _query: &[u8]) -> Result<Vec<u8>, DnsError> {
        Err(DnsError::Unsupported(format!(
            "{} does not support raw queries",
            self.name()
        )))
    }

    /// 下一个线路请求 ID
    fn new_req_id(&self) -> u16;
}

/// DNS 解析器 trait，供路由与拨号层使用
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// 将域名解析为 IP 地址列表
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}
