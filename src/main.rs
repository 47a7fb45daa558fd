//! Gateway Mesh - Entry Point

use gateway_mesh::{server, Config, Gateway, HttpUpstream};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Gateway Mesh v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: gateway-mesh");
        println!();
        println!("Environment variables:");
        println!("  GATEWAY_BIND              HTTP bind address (default: 127.0.0.1:8787)");
        println!("  GATEWAY_NODES             Comma list of id=url[@model]");
        println!("  GATEWAY_EXTREME_MODE      Widen every tier's limits");
        println!("  GATEWAY_COST_CEILING_USD  Session cost ceiling");
        println!("  GATEWAY_BUDGET_HARD_FAIL  Deny requests at the ceiling");
        println!("  GATEWAY_LOG_JSON          JSON logs on stderr");
        println!("  RUST_LOG                  trace, debug, info, warn, error");
        return Ok(());
    }

    let config = Config::from_env()?;

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if config.log_json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Gateway Mesh v{}", env!("CARGO_PKG_VERSION"));
    for node in &config.nodes {
        info!(node = %node.id, url = %node.url, model = %node.model, "Node registered");
    }

    let upstream = Arc::new(HttpUpstream::new(config.connect_timeout)?);
    let gateway = Gateway::new(&config, upstream);

    server::run(gateway, config.bind).await
}
