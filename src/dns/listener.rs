//! 对外暴露的 UDP DNS 监听器
//!
//! 每个报文原样交给后端的 `query_raw`，应答写回来源地址。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::NameServer;
use crate::common::context::QueryContext;

const MAX_DATAGRAM: usize = 65535;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub struct DnsListener {
    socket: Arc<UdpSocket>,
    server: Arc<dyn NameServer>,
    timeout: Duration,
}

impl DnsListener {
    pub async fn bind(
        listen: SocketAddr,
        server: Arc<dyn NameServer>,
        timeout: Duration,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(listen).await?;
        info!(listen = %socket.local_addr()?, upstream = server.name(), "DNS listener started");
        Ok(Self {
            socket: Arc::new(socket),
            server,
            timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 运行直到 `cancel` 触发；每个查询在独立任务中处理
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("DNS listener stopped");
                    return Ok(());
                }
                result = self.socket.recv_from(&mut buf) => match received_or_backoff(result).await {
                    Some(received) => received,
                    None => continue,
                },
            };

            let query = buf[..n].to_vec();
            let socket = self.socket.clone();
            let server = self.server.clone();
            let ctx = QueryContext::with_cancel(cancel.child_token()).with_timeout(self.timeout);
            tokio::spawn(async move {
                match server.query_raw(&ctx, &query).await {
                    Ok(resp) => {
                        if let Err(e) = socket.send_to(&resp, peer).await {
                            warn!(peer = %peer, error = %e, "DNS listener send failed");
                        }
                    }
                    Err(e) => debug!(peer = %peer, error = %e, "raw DNS query failed"),
                }
            });
        }
    }
}

/// 接收出错时短暂退避，持续出错的 socket 不会空转
async fn received_or_backoff<T>(result: std::io::Result<T>) -> Option<T> {
    match result {
        Ok(received) => Some(received),
        Err(e) => {
            debug!(error = %e, "DNS listener recv error");
            tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            None
        }
    }
}
