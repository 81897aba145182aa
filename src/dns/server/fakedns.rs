//! FakeIP 后端：不做网络 I/O，地址来自注入的分配器

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::common::context::QueryContext;
use crate::common::error::DnsError;
use crate::dns::message::{build_response, fqdn, parse_query};
use crate::dns::record::{AnswerRecord, IpAnswer};
use crate::dns::state::ResolverState;
use crate::dns::{IpOption, NameServer};

/// 映射只在极短时间内有效
pub const FAKE_TTL: u32 = 1;

/// 域名 → 虚拟地址分配器；返回的地址可包含两个地址族
#[async_trait]
pub trait FakeIpAllocator: Send + Sync {
    async fn allocate(&self, domain: &str) -> Vec<IpAddr>;
}

pub struct FakeNameServer {
    name: String,
    pool: Arc<dyn FakeIpAllocator>,
    state: Arc<ResolverState>,
}

impl FakeNameServer {
    pub fn new(pool: Arc<dyn FakeIpAllocator>) -> Self {
        let name = "fakedns".to_string();
        info!("FakeIP name server created");
        Self {
            state: ResolverState::new(name.clone()),
            name,
            pool,
        }
    }

    /// 分配并按地址族写入缓存，随后唤醒等待者
    async fn allocate_and_store(&self, domain: &str, option: IpOption) {
        let addrs = self.pool.allocate(domain).await;
        for family in option.families() {
            let matched: Vec<IpAddr> = addrs.iter().copied().filter(|ip| family.matches(ip)).collect();
            debug!(domain = domain, family = ?family, addrs = ?matched, "FakeIP answer");
            self.state
                .store(domain, family, AnswerRecord::new(matched, FAKE_TTL))
                .await;
        }
    }
}

#[async_trait]
impl NameServer for FakeNameServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query_ip_with_ttl(
        &self,
        ctx: &QueryContext,
        domain: &str,
        _client_ip: Option<IpAddr>,
        option: IpOption,
        bypass_cache: bool,
    ) -> Result<IpAnswer, DnsError> {
        // 未启用：空结果且无错误，由调用方继续下一个解析器
        if !option.fake_enable {
            return Ok(IpAnswer {
                addrs: Vec::new(),
                expire_at: tokio::time::Instant::now(),
            });
        }
        self.state
            .resolve(ctx, domain, option, bypass_cache, |fqdn| async move {
                self.allocate_and_store(&fqdn, option).await;
                Ok(())
            })
            .await
    }

    async fn query_raw(&self, _ctx: &QueryContext, query: &[u8]) -> Result<Vec<u8>, DnsError> {
        let parsed = parse_query(query)?;
        let addrs = self.pool.allocate(&fqdn(&parsed.name)).await;
        Ok(build_response(&parsed, &addrs, FAKE_TTL))
    }

    fn new_req_id(&self) -> u16 {
        0
    }
}
