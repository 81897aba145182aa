use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::builder::build_name_server;
use super::record::IpAnswer;
use super::server::FakeIpAllocator;
use super::state::DEFAULT_QUERY_TIMEOUT;
use super::{DnsResolver, IpOption, NameServer};
use crate::common::context::QueryContext;
use crate::common::error::DnsError;
use crate::config::types::{DnsConfig, Strategy};

/// 按顺序尝试多个后端：空结果或失败时继续下一个
pub struct NameServerChain {
    servers: Vec<Arc<dyn NameServer>>,
    strategy: Strategy,
    fake_enable: bool,
    client_ip: Option<IpAddr>,
    timeout: Duration,
}

impl NameServerChain {
    pub fn new(servers: Vec<Arc<dyn NameServer>>) -> Self {
        Self {
            servers,
            strategy: Strategy::default(),
            fake_enable: false,
            client_ip: None,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_fake(mut self, enable: bool) -> Self {
        self.fake_enable = enable;
        self
    }

    pub fn with_client_ip(mut self, client_ip: Option<IpAddr>) -> Self {
        self.client_ip = client_ip;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 根据配置构建全部后端
    pub async fn from_config(config: &DnsConfig) -> Result<Self> {
        let (fake_pool, fake_enable) = match &config.fake_ip {
            Some(fake) => {
                let pool: Arc<dyn FakeIpAllocator> = Arc::new(fake.build_pool()?);
                (Some(pool), fake.enabled)
            }
            None => (None, false),
        };

        let mut servers = Vec::with_capacity(config.servers.len());
        for address in &config.servers {
            servers.push(build_name_server(address, fake_pool.clone()).await?);
        }
        info!(
            servers = ?servers.iter().map(|s| s.name()).collect::<Vec<_>>(),
            strategy = ?config.strategy,
            "DNS name server chain created"
        );

        Ok(Self::new(servers)
            .with_strategy(config.strategy)
            .with_fake(fake_enable)
            .with_client_ip(config.client_ip)
            .with_timeout(Duration::from_millis(config.timeout_ms)))
    }

    pub fn servers(&self) -> &[Arc<dyn NameServer>] {
        &self.servers
    }

    pub fn ip_option(&self) -> IpOption {
        self.strategy.ip_option().with_fake(self.fake_enable)
    }

    /// 逐个后端查询；每个后端单独计时，调用方已给截止时间时沿用
    pub async fn lookup(
        &self,
        ctx: &QueryContext,
        domain: &str,
        option: IpOption,
    ) -> Result<IpAnswer, DnsError> {
        let mut last_err = None;
        for server in &self.servers {
            let attempt = match ctx.deadline() {
                Some(_) => ctx.clone(),
                None => ctx.clone().with_timeout(self.timeout),
            };
            match server
                .query_ip_with_ttl(&attempt, domain, self.client_ip, option, false)
                .await
            {
                Ok(mut answer) if !answer.addrs.is_empty() => {
                    self.strategy.order(&mut answer.addrs);
                    debug!(server = server.name(), domain = domain, addrs = ?answer.addrs, "DNS resolved");
                    return Ok(answer);
                }
                Ok(_) => debug!(server = server.name(), domain = domain, "DNS server skipped"),
                Err(DnsError::Cancelled) => return Err(DnsError::Cancelled),
                Err(e) => {
                    warn!(server = server.name(), domain = domain, kind = ?e.kind(), error = %e, "DNS query failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(DnsError::EmptyResponse))
    }
}

#[async_trait]
impl DnsResolver for NameServerChain {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let answer = self
            .lookup(&QueryContext::new(), host, self.ip_option())
            .await
            .map_err(|e| anyhow::anyhow!("DNS resolution failed for {}: {}", host, e))?;
        Ok(answer.addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    enum Outcome {
        Addrs(&'static [&'static str]),
        Fail(fn() -> DnsError),
    }

    /// 固定结果的后端
    struct Fixed {
        name: &'static str,
        outcome: Outcome,
    }

    #[async_trait]
    impl NameServer for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn query_ip_with_ttl(
            &self,
            _ctx: &QueryContext,
            _domain: &str,
            _client_ip: Option<IpAddr>,
            _option: IpOption,
            _bypass_cache: bool,
        ) -> Result<IpAnswer, DnsError> {
            match &self.outcome {
                Outcome::Addrs(addrs) => Ok(IpAnswer {
                    addrs: addrs.iter().map(|a| a.parse().unwrap()).collect(),
                    expire_at: Instant::now(),
                }),
                Outcome::Fail(err) => Err(err()),
            }
        }

        fn new_req_id(&self) -> u16 {
            0
        }
    }

    fn chain(servers: Vec<(&'static str, Outcome)>) -> NameServerChain {
        NameServerChain::new(
            servers
                .into_iter()
                .map(|(name, outcome)| Arc::new(Fixed { name, outcome }) as Arc<dyn NameServer>)
                .collect(),
        )
    }

    #[tokio::test]
    async fn falls_through_empty_and_errors() {
        let chain = chain(vec![
            ("fake", Outcome::Addrs(&[])),
            ("broken", Outcome::Fail(|| DnsError::Timeout)),
            ("good", Outcome::Addrs(&["::1", "9.9.9.9"])),
        ])
        .with_strategy(Strategy::PreferIpv4);

        let addrs = chain.resolve("example.com").await.unwrap();
        assert_eq!(addrs, vec!["9.9.9.9".parse::<IpAddr>().unwrap(), "::1".parse().unwrap()]);
    }

    #[tokio::test]
    async fn last_error_surfaces() {
        let chain = chain(vec![
            ("a", Outcome::Fail(|| DnsError::Timeout)),
            ("b", Outcome::Fail(|| DnsError::Transport("refused".into()))),
        ]);
        let err = chain
            .lookup(&QueryContext::new(), "example.com", IpOption::dual())
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Transport(_)));

        let empty = NameServerChain::new(Vec::new());
        assert!(matches!(
            empty.lookup(&QueryContext::new(), "x.com", IpOption::dual()).await,
            Err(DnsError::EmptyResponse)
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_chain() {
        let chain = chain(vec![
            ("a", Outcome::Fail(|| DnsError::Cancelled)),
            ("b", Outcome::Addrs(&["1.1.1.1"])),
        ]);
        assert!(matches!(
            chain.lookup(&QueryContext::new(), "example.com", IpOption::dual()).await,
            Err(DnsError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn ip_literal_short_circuits() {
        let chain = chain(vec![("a", Outcome::Fail(|| DnsError::Timeout))]);
        assert_eq!(
            chain.resolve("10.0.0.1").await.unwrap(),
            vec!["10.0.0.1".parse::<IpAddr>().unwrap()]
        );
        assert_eq!(
            chain.resolve("[::1]").await.unwrap(),
            vec!["::1".parse::<IpAddr>().unwrap()]
        );
    }
}
