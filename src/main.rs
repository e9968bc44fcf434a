use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaymux::registry::probe_loop;
use relaymux::{build_context, config, router};

#[derive(Parser)]
#[command(name = "relaymux")]
#[command(about = "Multi-provider LLM gateway", long_about = None)]
struct Cli {
    /// Path to the routing config file
    #[arg(
        short,
        long,
        env = "RELAYMUX_CONFIG",
        default_value = "~/.relaymux/config.json"
    )]
    config: String,

    /// Override the configured server host
    #[arg(long)]
    host: Option<String>,

    /// Override the configured server port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relaymux=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let (gateway_config, table, credentials) = config::load(&cli.config)?;
    tracing::info!("loaded routing table from {}", cli.config);
    tracing::info!(
        pipelines = table.all_entries().len(),
        default_category = %table.default_category(),
        "routing table built"
    );

    let host = cli
        .host
        .unwrap_or_else(|| gateway_config.host().to_string());
    let port = cli.port.unwrap_or_else(|| gateway_config.port());

    let ctx = build_context(gateway_config, table, credentials);

    // Background health probes.
    {
        let registry = ctx.registry.clone();
        let upstream = ctx.upstream.clone();
        let timeout = registry.probe_timeout();
        tokio::spawn(probe_loop(registry, move |entry| {
            let upstream = upstream.clone();
            async move { upstream.probe(&entry, timeout).await }
        }));
    }

    let app = router(ctx);
    let addr = SocketAddr::from((host.parse::<std::net::IpAddr>()?, port));
    tracing::info!("relaymux listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
