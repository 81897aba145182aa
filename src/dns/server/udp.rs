//! 经典 UDP DNS 后端
//!
//! 查询发出后即返回，由后台接收任务按报文 ID 匹配待答请求并写入缓存；
//! 截断的应答通过内部的 TCP 后端重发原始查询。

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::tcp::TcpNameServer;
use crate::common::context::QueryContext;
use crate::common::error::DnsError;
use crate::dns::message::{build_queries, message_id, parse_answer, set_message_id};
use crate::dns::record::IpAnswer;
use crate::dns::state::{PendingRequest, ResolverState, DEFAULT_QUERY_TIMEOUT};
use crate::dns::{IpOption, NameServer};

const MAX_DATAGRAM: usize = 65535;

struct UdpInner {
    name: String,
    server: SocketAddr,
    socket: UdpSocket,
    state: Arc<ResolverState>,
    /// 截断回退
    tcp: TcpNameServer,
    req_id: AtomicU16,
    /// 原始透传查询的应答投递表，按线路 ID 索引
    raw_waiters: Mutex<HashMap<u16, oneshot::Sender<Vec<u8>>>>,
}

pub struct UdpNameServer {
    inner: Arc<UdpInner>,
    recv_task: JoinHandle<()>,
}

impl UdpNameServer {
    pub async fn new(server: SocketAddr) -> Result<Self> {
        let bind: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;

        let name = format!("udp://{}", server);
        let inner = Arc::new(UdpInner {
            state: ResolverState::new(name.clone()),
            name,
            server,
            socket,
            tcp: TcpNameServer::new(server),
            req_id: AtomicU16::new(rand::random()),
            raw_waiters: Mutex::new(HashMap::new()),
        });

        let recv_task = tokio::spawn(recv_loop(inner.clone()));
        info!(server = %server, "UDP DNS name server created");
        Ok(Self { inner, recv_task })
    }

    pub fn server(&self) -> SocketAddr {
        self.inner.server
    }

    pub fn state(&self) -> &Arc<ResolverState> {
        &self.inner.state
    }
}

impl Drop for UdpNameServer {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

impl UdpInner {
    fn next_id(&self) -> u16 {
        self.req_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    async fn send_query(
        &self,
        domain: &str,
        client_ip: Option<IpAddr>,
        option: IpOption,
    ) -> Result<(), DnsError> {
        let queries = build_queries(domain, option, || self.next_id(), client_ip)?;
        for query in queries {
            self.state
                .insert_pending(PendingRequest::new(
                    query.id,
                    query.family,
                    query.domain.clone(),
                    query.msg.clone(),
                ))
                .await;
            if let Err(e) = self.socket.send(&query.msg).await {
                warn!(server = %self.name, domain = %query.domain, error = %e, "UDP DNS send failed");
                self.state.take_pending(query.id).await;
                return Err(DnsError::Io(e));
            }
            debug!(server = %self.name, domain = %query.domain, id = query.id, family = ?query.family, "UDP DNS query sent");
        }
        Ok(())
    }

    async fn handle_response(self: &Arc<Self>, data: &[u8]) {
        let Some(id) = message_id(data) else {
            return;
        };

        if let Some(tx) = self.raw_waiters.lock().await.remove(&id) {
            let _ = tx.send(data.to_vec());
            return;
        }

        let parsed = match parse_answer(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(server = %self.name, id = id, error = %e, "failed to parse UDP DNS response");
                return;
            }
        };

        let Some(req) = self.state.take_pending(id).await else {
            debug!(server = %self.name, id = id, "UDP DNS response without pending request");
            return;
        };

        if !parsed.truncated {
            self.state.store(&req.domain, req.family, parsed.record).await;
            return;
        }

        debug!(server = %self.name, domain = %req.domain, id = id, "UDP DNS response truncated, retrying over TCP");
        let inner = self.clone();
        tokio::spawn(async move {
            let record = match inner.tcp.exchange(&req.msg).await {
                Ok(resp) => parse_answer(&resp).and_then(|p| p.into_record()),
                Err(e) => Err(DnsError::transport(e)),
            };
            match record {
                Ok(mut record) => {
                    record.req_id = req.id;
                    inner.state.store(&req.domain, req.family, record).await;
                }
                Err(e) => {
                    warn!(server = %inner.name, domain = %req.domain, error = %e, "TCP fallback for truncated response failed")
                }
            }
        });
    }
}

async fn recv_loop(inner: Arc<UdpInner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match inner.socket.recv(&mut buf).await {
            Ok(n) => inner.handle_response(&buf[..n]).await,
            Err(e) => {
                // 已连接的 UDP socket 会把 ICMP 不可达报告为接收错误
                debug!(server = %inner.name, error = %e, "UDP DNS recv error");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

#[async_trait]
impl NameServer for UdpNameServer {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn query_ip_with_ttl(
        &self,
        ctx: &QueryContext,
        domain: &str,
        client_ip: Option<IpAddr>,
        option: IpOption,
        bypass_cache: bool,
    ) -> Result<IpAnswer, DnsError> {
        let inner = &self.inner;
        inner
            .state
            .resolve(ctx, domain, option, bypass_cache, |fqdn| async move {
                inner.send_query(&fqdn, client_ip, option).await
            })
            .await
    }

    async fn query_raw(&self, ctx: &QueryContext, query: &[u8]) -> Result<Vec<u8>, DnsError> {
        let original_id =
            message_id(query).ok_or_else(|| DnsError::Malformed("query too short".into()))?;
        let id = self.new_req_id();
        let mut msg = query.to_vec();
        set_message_id(&mut msg, id);

        let (tx, rx) = oneshot::channel();
        self.inner.raw_waiters.lock().await.insert(id, tx);
        if let Err(e) = self.inner.socket.send(&msg).await {
            self.inner.raw_waiters.lock().await.remove(&id);
            return Err(DnsError::Io(e));
        }

        let deadline = ctx.deadline_or(DEFAULT_QUERY_TIMEOUT);
        let result = tokio::select! {
            _ = ctx.cancelled() => Err(DnsError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(DnsError::Timeout),
            resp = rx => resp.map_err(|_| DnsError::Transport("UDP receiver closed".into())),
        };

        match result {
            Ok(mut resp) => {
                set_message_id(&mut resp, original_id);
                Ok(resp)
            }
            Err(e) => {
                self.inner.raw_waiters.lock().await.remove(&id);
                Err(e)
            }
        }
    }

    fn new_req_id(&self) -> u16 {
        self.inner.next_id()
    }
}
