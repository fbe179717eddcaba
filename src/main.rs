//! echod entry point
//!
//! Parses the CLI surface, initializes logging and starts the server.

use clap::Parser;
use echod::config::{CliArgs, ServerConfig};
use echod::server::EchoServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("echod={}", args.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_args(&args);
    info!(
        protocol = if config.http2 { "HTTP/2" } else { "HTTP/1.1" },
        port = config.port,
        boss_threads = config.boss_threads,
        worker_threads = config.worker_threads,
        ssl = config.ssl,
        delay_ms = config.response_delay.as_millis() as u64,
        aggregate = config.h2_aggregate_content,
        "Echo server starting"
    );

    let server = EchoServer::bind(config)?;
    server.run();
    Ok(())
}
