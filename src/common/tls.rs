use std::sync::Arc;

use anyhow::Result;
use rustls::crypto::ring as ring_provider;
use rustls::ClientConfig;

/// 构建 DNS 客户端使用的 TLS 配置（webpki 根证书）
///
/// - `alpn`: ALPN 协议列表，DoH3 传 `["h3"]`
pub fn build_client_config(alpn: &[&str]) -> Result<ClientConfig> {
    let provider = Arc::new(ring_provider::default_provider());
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(config)
}
