use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use openworld_dns::common::QueryContext;
use openworld_dns::dns::listener::DnsListener;
use openworld_dns::dns::NameServerChain;

#[derive(Parser)]
#[command(name = "openworld-dns", version, about = "OpenWorld DNS resolver")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 解析域名并打印结果
    Resolve {
        domain: String,
    },
    /// 启动 UDP DNS 监听，转发到第一个上游
    Serve {
        /// 覆盖配置中的 listen
        #[arg(short, long)]
        listen: Option<std::net::SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = openworld_dns::config::load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .init();

    info!(config = %cli.config, "config loaded");
    let chain = NameServerChain::from_config(&config.dns).await?;
    let timeout = Duration::from_millis(config.dns.timeout_ms);

    match cli.command {
        Command::Resolve { domain } => {
            let answer = chain
                .lookup(&QueryContext::new(), &domain, chain.ip_option())
                .await?;
            for ip in &answer.addrs {
                println!("{}", ip);
            }
        }
        Command::Serve { listen } => {
            let listen = listen
                .or(config.dns.listen)
                .ok_or_else(|| anyhow::anyhow!("no listen address configured"))?;
            let upstream = chain
                .servers()
                .first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no dns server configured"))?;

            let listener = DnsListener::bind(listen, upstream, timeout).await?;
            let cancel = CancellationToken::new();
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    shutdown.cancel();
                }
            });
            listener.run(cancel).await?;
        }
    }

    Ok(())
}
