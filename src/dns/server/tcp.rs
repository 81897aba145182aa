//! DNS-over-TCP 后端
//!
//! 每次查询新建一条连接：写入全部带 2 字节大端长度前缀的报文，同步读取应答后关闭。
//! 同一连接上收发，无需待答请求表。

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::common::context::QueryContext;
use crate::common::error::DnsError;
use crate::dns::message::{build_queries, parse_answer, OutgoingQuery};
use crate::dns::record::IpAnswer;
use crate::dns::state::{ResolverState, DEFAULT_QUERY_TIMEOUT};
use crate::dns::{IpOption, NameServer};

/// 单次 TCP 往返：连接、写入、读取
pub async fn tcp_exchange(server: SocketAddr, timeout: Duration, msg: &[u8]) -> Result<Vec<u8>> {
    let mut responses = tcp_exchange_batch(server, timeout, &[msg]).await?;
    responses
        .pop()
        .ok_or_else(|| anyhow::anyhow!("no TCP DNS response"))
}

/// 同一条连接上依次写入全部查询，再读取同样数量的应答（顺序不保证与查询一致）
pub async fn tcp_exchange_batch(
    server: SocketAddr,
    timeout: Duration,
    msgs: &[&[u8]],
) -> Result<Vec<Vec<u8>>> {
    let mut framed = Vec::new();
    for msg in msgs {
        if msg.is_empty() || msg.len() > u16::MAX as usize {
            anyhow::bail!("invalid DNS message length: {}", msg.len());
        }
        framed.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        framed.extend_from_slice(msg);
    }

    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(server))
        .await
        .context("TCP DNS connect timeout")?
        .with_context(|| format!("connect {} failed", server))?;

    let responses = tokio::time::timeout(timeout, async {
        stream.write_all(&framed).await?;
        stream.flush().await?;

        let mut responses = Vec::with_capacity(msgs.len());
        for _ in 0..msgs.len() {
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = u16::from_be_bytes(len_buf) as usize;
            if len == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "zero-length DNS response",
                ));
            }
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            responses.push(buf);
        }
        Ok(responses)
    })
    .await
    .context("TCP DNS exchange timeout")?
    .context("TCP DNS exchange failed")?;

    let _ = stream.shutdown().await;
    Ok(responses)
}

pub struct TcpNameServer {
    name: String,
    server: SocketAddr,
    timeout: Duration,
    req_id: AtomicU16,
    state: Arc<ResolverState>,
}

impl TcpNameServer {
    pub fn new(server: SocketAddr) -> Self {
        let name = format!("tcp://{}", server);
        info!(server = %server, "TCP DNS name server created");
        Self {
            state: ResolverState::new(name.clone()),
            name,
            server,
            timeout: DEFAULT_QUERY_TIMEOUT,
            req_id: AtomicU16::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// 原样发送报文并返回应答（UDP 截断回退也走这里）
    pub async fn exchange(&self, msg: &[u8]) -> Result<Vec<u8>> {
        tcp_exchange(self.server, self.timeout, msg).await
    }

    /// 一次查询的各地址族共用一条连接
    fn send_query(&self, domain: &str, client_ip: Option<IpAddr>, option: IpOption) -> Result<(), DnsError> {
        let queries = build_queries(domain, option, || self.new_req_id(), client_ip)?;
        let state = self.state.clone();
        let (server, timeout, name) = (self.server, self.timeout, self.name.clone());
        tokio::spawn(async move {
            let msgs: Vec<&[u8]> = queries.iter().map(|q| q.msg.as_ref()).collect();
            debug!(server = %name, domain = %domain_of(&queries), queries = msgs.len(), "TCP DNS query sent");
            let responses = match tcp_exchange_batch(server, timeout, &msgs).await {
                Ok(responses) => responses,
                Err(e) => {
                    warn!(server = %name, domain = %domain_of(&queries), error = %e, "TCP DNS exchange failed");
                    return;
                }
            };
            for resp in responses {
                let record = match parse_answer(&resp).and_then(|p| p.into_record()) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(server = %name, domain = %domain_of(&queries), error = %e, "failed to parse TCP DNS response");
                        continue;
                    }
                };
                match queries.iter().find(|q| q.id == record.req_id) {
                    Some(query) => state.store(&query.domain, query.family, record).await,
                    None => debug!(server = %name, id = record.req_id, "TCP DNS response with unknown id"),
                }
            }
        });
        Ok(())
    }
}

fn domain_of(queries: &[OutgoingQuery]) -> &str {
    queries.first().map(|q| q.domain.as_str()).unwrap_or_default()
}

#[async_trait]
impl NameServer for TcpNameServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query_ip_with_ttl(
        &self,
        ctx: &QueryContext,
        domain: &str,
        client_ip: Option<IpAddr>,
        option: IpOption,
        bypass_cache: bool,
    ) -> Result<IpAnswer, DnsError> {
        self.state
            .resolve(ctx, domain, option, bypass_cache, |fqdn| async move {
                self.send_query(&fqdn, client_ip, option)
            })
            .await
    }

    async fn query_raw(&self, ctx: &QueryContext, query: &[u8]) -> Result<Vec<u8>, DnsError> {
        let deadline = ctx.deadline_or(self.timeout);
        tokio::select! {
            _ = ctx.cancelled() => Err(DnsError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(DnsError::Timeout),
            result = self.exchange(query) => result.map_err(|e| {
                warn!(server = %self.name, error = %e, "TCP DNS raw query failed");
                DnsError::transport(e)
            }),
        }
    }

    fn new_req_id(&self) -> u16 {
        self.req_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}
