//! 系统解析器后端
//!
//! 系统接口不暴露 TTL，统一按固定 TTL 缓存。

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::common::context::QueryContext;
use crate::common::error::DnsError;
use crate::dns::record::{AnswerRecord, IpAnswer};
use crate::dns::state::ResolverState;
use crate::dns::{IpOption, NameServer};

pub const LOCAL_TTL: u32 = 600;

pub struct LocalNameServer {
    name: String,
    state: Arc<ResolverState>,
}

impl LocalNameServer {
    pub fn new() -> Self {
        let name = "localhost".to_string();
        info!("local DNS name server created");
        Self {
            state: ResolverState::new(name.clone()),
            name,
        }
    }

    async fn lookup_and_store(&self, domain: &str, option: IpOption) -> Result<(), DnsError> {
        let host = domain.trim_end_matches('.');
        let addrs: Vec<IpAddr> = match tokio::net::lookup_host((host, 0)).await {
            Ok(iter) => iter.map(|sa| sa.ip()).collect(),
            Err(e) => {
                warn!(domain = domain, error = %e, "system DNS lookup failed");
                return Err(DnsError::Transport(format!("system lookup {}: {}", host, e)));
            }
        };
        debug!(domain = domain, addrs = ?addrs, "system DNS lookup");

        for family in option.families() {
            let mut matched: Vec<IpAddr> = Vec::new();
            for ip in addrs.iter().filter(|ip| family.matches(ip)) {
                if !matched.contains(ip) {
                    matched.push(*ip);
                }
            }
            self.state
                .store(domain, family, AnswerRecord::new(matched, LOCAL_TTL))
                .await;
        }
        Ok(())
    }
}

impl Default for LocalNameServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NameServer for LocalNameServer {
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
        self.state
            .resolve(ctx, domain, option, bypass_cache, |fqdn| async move {
                self.lookup_and_store(&fqdn, option).await
            })
            .await
    }

    fn new_req_id(&self) -> u16 {
        0
    }
}
