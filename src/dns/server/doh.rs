//! DNS-over-HTTPS 与 DNS-over-HTTP/3 后端
//!
//! 两者共用查询流程，只在传输层不同：HTTPS 走 reqwest，HTTP/3 走 quinn + h3。
//! 请求与应答一一对应，报文 ID 恒为 0。

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::context::QueryContext;
use crate::common::error::DnsError;
use crate::common::tls::build_client_config;
use crate::dns::message::{build_queries, message_id, parse_answer, set_message_id};
use crate::dns::record::IpAnswer;
use crate::dns::state::{ResolverState, DEFAULT_QUERY_TIMEOUT};
use crate::dns::{IpOption, NameServer};

pub const DNS_MESSAGE_MIME: &str = "application/dns-message";

/// 一次 HTTP 往返：POST 报文，返回应答体
#[async_trait]
pub trait DnsExchange: Send + Sync {
    async fn exchange(&self, msg: Bytes) -> Result<Vec<u8>>;
}

/// HTTPS（HTTP/1.1 或 HTTP/2）
pub struct ReqwestExchange {
    client: reqwest::Client,
    url: String,
}

impl ReqwestExchange {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .use_rustls_tls()
            .build()
            .context("failed to build DoH HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DnsExchange for ReqwestExchange {
    async fn exchange(&self, msg: Bytes) -> Result<Vec<u8>> {
        let resp = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_MIME)
            .header(reqwest::header::ACCEPT, DNS_MESSAGE_MIME)
            .body(msg)
            .send()
            .await
            .with_context(|| format!("DoH request to {} failed", self.url))?;

        if resp.status() != reqwest::StatusCode::OK {
            anyhow::bail!("DoH server returned status {}", resp.status());
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/// 一条 QUIC 连接上唯一的 h3 会话；`SendRequest` 可克隆，供并发查询共用
struct H3Session {
    _endpoint: quinn::Endpoint,
    conn: quinn::Connection,
    send_request: h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>,
    driver: JoinHandle<()>,
}

impl H3Session {
    fn is_alive(&self) -> bool {
        self.conn.close_reason().is_none() && !self.driver.is_finished()
    }
}

impl Drop for H3Session {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// 本地绑定地址与服务器地址族一致
fn bind_addr_for(server: &SocketAddr) -> SocketAddr {
    match server {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

/// HTTP/3 over QUIC；连接与 h3 会话一起复用，连接关闭后整体重建
pub struct H3Exchange {
    uri: http::Uri,
    host: String,
    port: u16,
    timeout: Duration,
    client_config: quinn::ClientConfig,
    session: Mutex<Option<H3Session>>,
}

impl H3Exchange {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        Self::with_tls_config(url, timeout, build_client_config(&["h3"])?)
    }

    /// 使用自定义 TLS 配置（如私有根证书）；ALPN 需包含 `h3`
    pub fn with_tls_config(
        url: &str,
        timeout: Duration,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self> {
        let uri: http::Uri = url.parse().with_context(|| format!("invalid DoH3 url: {}", url))?;
        let host = uri
            .host()
            .ok_or_else(|| anyhow::anyhow!("DoH3 url without host: {}", url))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(443);

        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_idle_timeout(Some(quinn::IdleTimeout::try_from(
            Duration::from_secs(30),
        )?));
        client_config.transport_config(Arc::new(transport_config));

        Ok(Self {
            uri,
            host,
            port,
            timeout,
            client_config,
            session: Mutex::new(None),
        })
    }

    /// 取可用会话的 `SendRequest`；没有或已失效时重新建立连接和会话
    async fn send_request(&self) -> Result<h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.is_alive() {
                return Ok(session.send_request.clone());
            }
            debug!(host = %self.host, "DoH3 session closed, reconnecting");
        }
        *guard = None;

        let addr_str = format!("{}:{}", self.host, self.port);
        let server_addr = tokio::net::lookup_host(&addr_str)
            .await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("failed to resolve {}", addr_str))?;

        let mut endpoint = quinn::Endpoint::client(bind_addr_for(&server_addr))?;
        endpoint.set_default_client_config(self.client_config.clone());
        let connecting = endpoint.connect(server_addr, &self.host)?;
        let conn = tokio::time::timeout(self.timeout, connecting)
            .await
            .context("DoH3 connect timeout")??;

        let (mut driver, send_request) =
            h3::client::new(h3_quinn::Connection::new(conn.clone())).await?;
        let driver = tokio::spawn(async move {
            let _err = futures_lite::future::poll_fn(|cx| driver.poll_close(cx)).await;
            debug!("DoH3 h3 driver closed");
        });
        debug!(addr = %server_addr, "DoH3 QUIC connection established");

        *guard = Some(H3Session {
            _endpoint: endpoint,
            conn,
            send_request: send_request.clone(),
            driver,
        });
        Ok(send_request)
    }
}

#[async_trait]
impl DnsExchange for H3Exchange {
    async fn exchange(&self, msg: Bytes) -> Result<Vec<u8>> {
        let mut send_request = self.send_request().await?;

        tokio::time::timeout(self.timeout, async {
            let req = http::Request::post(self.uri.clone())
                .header(http::header::CONTENT_TYPE, DNS_MESSAGE_MIME)
                .header(http::header::ACCEPT, DNS_MESSAGE_MIME)
                .body(())?;
            let mut stream = send_request.send_request(req).await?;
            stream.send_data(msg).await?;
            stream.finish().await?;

            let resp = stream.recv_response().await?;
            if resp.status() != http::StatusCode::OK {
                anyhow::bail!("DoH3 server returned status {}", resp.status());
            }

            let mut body = Vec::new();
            while let Some(mut chunk) = stream.recv_data().await? {
                while chunk.has_remaining() {
                    let part = chunk.chunk();
                    let n = part.len();
                    body.extend_from_slice(part);
                    chunk.advance(n);
                }
            }
            Ok::<_, anyhow::Error>(body)
        })
        .await
        .context("DoH3 exchange timeout")?
    }
}

pub struct DohNameServer {
    name: String,
    transport: Arc<dyn DnsExchange>,
    state: Arc<ResolverState>,
}

impl DohNameServer {
    pub fn new(name: impl Into<String>, transport: Arc<dyn DnsExchange>) -> Self {
        let name = name.into();
        info!(server = %name, "DoH name server created");
        Self {
            state: ResolverState::new(name.clone()),
            name,
            transport,
        }
    }

    /// `https://host[:port]/path`
    pub fn https(url: &str) -> Result<Self> {
        let transport = ReqwestExchange::new(url, DEFAULT_QUERY_TIMEOUT)?;
        Ok(Self::new(url, Arc::new(transport)))
    }

    /// `h3://host[:port]/path`，实际请求使用 https scheme
    pub fn h3(url: &str) -> Result<Self> {
        let https_url = match url.strip_prefix("h3://") {
            Some(rest) => format!("https://{}", rest),
            None => url.to_string(),
        };
        let transport = H3Exchange::new(&https_url, DEFAULT_QUERY_TIMEOUT)?;
        Ok(Self::new(url, Arc::new(transport)))
    }

    fn send_query(
        &self,
        domain: &str,
        client_ip: Option<IpAddr>,
        option: IpOption,
    ) -> Result<(), DnsError> {
        let queries = build_queries(domain, option, || self.new_req_id(), client_ip)?;
        for query in queries {
            let state = self.state.clone();
            let transport = self.transport.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                debug!(server = %name, domain = %query.domain, family = ?query.family, "DoH query sent");
                let record = match transport.exchange(query.msg.clone()).await {
                    Ok(resp) => parse_answer(&resp).and_then(|p| p.into_record()),
                    Err(e) => {
                        warn!(server = %name, domain = %query.domain, error = %e, "DoH exchange failed");
                        return;
                    }
                };
                match record {
                    Ok(record) => state.store(&query.domain, query.family, record).await,
                    Err(e) => {
                        warn!(server = %name, domain = %query.domain, error = %e, "failed to parse DoH response")
                    }
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NameServer for DohNameServer {
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
        let original_id =
            message_id(query).ok_or_else(|| DnsError::Malformed("query too short".into()))?;
        let mut msg = query.to_vec();
        set_message_id(&mut msg, self.new_req_id());

        let deadline = ctx.deadline_or(DEFAULT_QUERY_TIMEOUT);
        let mut resp = tokio::select! {
            _ = ctx.cancelled() => return Err(DnsError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(DnsError::Timeout),
            result = self.transport.exchange(Bytes::from(msg)) => result.map_err(|e| {
                warn!(server = %self.name, error = %e, "DoH raw query failed");
                DnsError::transport(e)
            })?,
        };
        set_message_id(&mut resp, original_id);
        Ok(resp)
    }

    fn new_req_id(&self) -> u16 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::message::testing::ResponseBuilder;
    use crate::dns::message::{parse_query, RCode, TYPE_A};
    use crate::dns::Family;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 进程内的假传输，按 qtype 作答
    struct StubExchange {
        calls: AtomicUsize,
        status_ok: bool,
    }

    impl StubExchange {
        fn new(status_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                status_ok,
            })
        }
    }

    #[async_trait]
    impl DnsExchange for StubExchange {
        async fn exchange(&self, msg: Bytes) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.status_ok {
                anyhow::bail!("DoH server returned status 503 Service Unavailable");
            }
            assert_eq!(message_id(&msg), Some(0));
            let query = parse_query(&msg)?;
            let builder = ResponseBuilder::for_query(&msg);
            Ok(if query.qtype == TYPE_A {
                builder.answer("203.0.113.7".parse()?, 90).build()
            } else {
                builder.rcode(RCode::NoError).soa(60, 60).build()
            })
        }
    }

    #[tokio::test]
    async fn query_over_stub_transport() {
        let stub = StubExchange::new(true);
        let ns = DohNameServer::new("https://stub/dns-query", stub.clone());
        let ips = ns
            .query_ip(&QueryContext::new(), "doh.example", None, IpOption::dual(), false)
            .await
            .unwrap();
        // AAAA 无答案，合并后只剩 IPv4
        assert_eq!(ips, vec!["203.0.113.7".parse::<IpAddr>().unwrap()]);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);

        let record = ns.state.cached("doh.example", Family::V4).await.unwrap();
        assert_eq!(record.req_id, 0);

        ns.query_ip(&QueryContext::new(), "doh.example", None, IpOption::dual(), false)
            .await
            .unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bad_status_fails_attempt() {
        let stub = StubExchange::new(false);
        let ns = DohNameServer::new("https://stub/dns-query", stub.clone());
        let ctx = QueryContext::new().with_timeout(Duration::from_millis(100));
        let err = ns
            .query_ip(&ctx, "down.example", None, IpOption::ipv4_only(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Timeout));

        let queries = build_queries("down.example", IpOption::ipv4_only(), || 9, None).unwrap();
        let err = ns
            .query_raw(&QueryContext::new(), &queries[0].msg)
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Transport(_)));
    }

    #[tokio::test]
    async fn raw_query_uses_zero_id_on_wire() {
        let stub = StubExchange::new(true);
        let ns = DohNameServer::new("https://stub/dns-query", stub);
        let queries = build_queries("raw.example", IpOption::ipv4_only(), || 4321, None).unwrap();
        let resp = ns.query_raw(&QueryContext::new(), &queries[0].msg).await.unwrap();
        assert_eq!(message_id(&resp), Some(4321));
        assert_eq!(ns.new_req_id(), 0);
    }

    /// 回环 HTTP/3 DoH 服务器：返回 (地址, CA 证书, 已接受的 QUIC 连接数)
    async fn spawn_h3_server() -> (SocketAddr, rustls::pki_types::CertificateDer<'static>, Arc<AtomicUsize>) {
        use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, KeyUsagePurpose, PKCS_ED25519};
        use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        ca_params.distinguished_name.push(rcgen::DnType::CommonName, "OpenWorld DNS Test CA");
        let ca_key = KeyPair::generate_for(&PKCS_ED25519).unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let mut server_params = CertificateParams::new(vec!["127.0.0.1".to_string()]).unwrap();
        server_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        let server_key = KeyPair::generate_for(&PKCS_ED25519).unwrap();
        let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

        let ca_der = CertificateDer::from(ca_cert.der().to_vec());
        let chain = vec![CertificateDer::from(server_cert.der().to_vec()), ca_der.clone()];
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(server_key.serialize_der()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut tls = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .unwrap();
        tls.alpn_protocols = vec![b"h3".to_vec()];
        let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from(tls).unwrap();
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_tls));
        let endpoint = quinn::Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = endpoint.local_addr().unwrap();

        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let Ok(conn) = incoming.await else { continue };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut h3_conn = h3::server::builder()
                        .build::<_, Bytes>(h3_quinn::Connection::new(conn))
                        .await
                        .unwrap();
                    while let Ok(Some(resolver)) = h3_conn.accept().await {
                        tokio::spawn(async move {
                            let (_req, mut stream) = resolver.resolve_request().await.unwrap();
                            let mut body = Vec::new();
                            while let Some(mut chunk) = stream.recv_data().await.unwrap() {
                                while chunk.has_remaining() {
                                    let n = chunk.chunk().len();
                                    body.extend_from_slice(chunk.chunk());
                                    chunk.advance(n);
                                }
                            }
                            let builder = ResponseBuilder::for_query(&body);
                            let reply = if parse_query(&body).unwrap().qtype == TYPE_A {
                                builder.answer("203.0.113.7".parse().unwrap(), 90).build()
                            } else {
                                builder.answer("2001:db8::53".parse().unwrap(), 90).build()
                            };
                            let resp = http::Response::builder().status(200).body(()).unwrap();
                            stream.send_response(resp).await.unwrap();
                            stream.send_data(Bytes::from(reply)).await.unwrap();
                            stream.finish().await.unwrap();
                        });
                    }
                });
            }
        });
        (addr, ca_der, connections)
    }

    #[tokio::test]
    async fn h3_queries_share_one_session() {
        let (addr, ca, connections) = spawn_h3_server().await;
        let mut roots = rustls::RootCertStore::empty();
        roots.add(ca).unwrap();
        let mut tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        tls.alpn_protocols = vec![b"h3".to_vec()];

        let url = format!("https://127.0.0.1:{}/dns-query", addr.port());
        let exchange = H3Exchange::with_tls_config(&url, Duration::from_secs(5), tls).unwrap();
        let ns = DohNameServer::new("h3://127.0.0.1/dns-query", Arc::new(exchange));
        let ctx = QueryContext::new().with_timeout(Duration::from_secs(5));

        // A 与 AAAA 并发发出，随后的查询继续复用同一会话
        let ips = ns
            .query_ip(&ctx, "h3.example", None, IpOption::dual(), false)
            .await
            .unwrap();
        assert_eq!(ips.len(), 2);
        let ips = ns
            .query_ip(&ctx, "again.example", None, IpOption::dual(), false)
            .await
            .unwrap();
        assert!(ips.contains(&"2001:db8::53".parse::<IpAddr>().unwrap()));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn h3_binds_to_server_family() {
        let v4: SocketAddr = "9.9.9.9:443".parse().unwrap();
        let v6: SocketAddr = "[2620:fe::fe]:443".parse().unwrap();
        assert_eq!(bind_addr_for(&v4), "0.0.0.0:0".parse::<SocketAddr>().unwrap());
        assert_eq!(bind_addr_for(&v6), "[::]:0".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn h3_session_established_lazily() {
        let exchange = H3Exchange::new("https://[::1]:8443/dns-query", Duration::from_millis(200)).unwrap();
        assert_eq!(exchange.host, "::1");
        assert_eq!(exchange.port, 8443);
        assert!(exchange.session.lock().await.is_none());
    }

    #[tokio::test]
    async fn h3_url_is_rewritten() {
        let ns = DohNameServer::h3("h3://dns.example:8443/dns-query").unwrap();
        assert_eq!(ns.name(), "h3://dns.example:8443/dns-query");
    }
}
