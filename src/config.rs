//! Server configuration
//!
//! Command-line arguments resolve into an immutable [`ServerConfig`] that is
//! shared read-only with the listener and every connection pipeline.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8688;

/// Maximum aggregated request body size for plain HTTP/1.1 connections
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 1024 * 1024;

/// Maximum aggregated body size for connections that went through protocol
/// negotiation (ALPN or h2c upgrade), applied per HTTP/2 stream as well
pub const NEGOTIATED_MAX_CONTENT_LENGTH: usize = 100 * 1024;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "echod")]
#[command(version = "0.1.0")]
#[command(about = "HTTP/1.1 and HTTP/2 echo server for load testing", long_about = None)]
pub struct CliArgs {
    /// Server port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Number of acceptor threads
    #[arg(long)]
    pub boss_threads: Option<usize>,

    /// Number of I/O worker threads
    #[arg(long)]
    pub worker_threads: Option<usize>,

    /// Use HTTP/2 protocol instead of HTTP/1.1
    #[arg(long)]
    pub http2: bool,

    /// Enable TLS
    #[arg(long)]
    pub ssl: bool,

    /// PKCS#12 keystore file (a self-signed certificate is generated when absent)
    #[arg(long)]
    pub key_store_file: Option<PathBuf>,

    /// Keystore password
    #[arg(long, default_value = "")]
    pub key_store_password: String,

    /// Response delay in milliseconds
    #[arg(long, default_value_t = 0)]
    pub delay: u64,

    /// Enable HTTP/2 content aggregation
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub h2_aggregate_content: bool,

    /// Pass timing headers (Backend-IN-time and friends) through to the response
    #[arg(long)]
    pub timestamp_headers: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Certificate source for the TLS context
#[derive(Debug, Clone)]
pub enum CertSource {
    /// Generate a self-signed certificate in process
    SelfSigned,
    /// Load a PKCS#12 keystore from disk
    Keystore { path: PathBuf, password: String },
}

/// Resolved server configuration, immutable after startup
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub boss_threads: usize,
    pub worker_threads: usize,
    pub http2: bool,
    pub ssl: bool,
    pub cert_source: CertSource,
    pub response_delay: Duration,
    pub h2_aggregate_content: bool,
    pub timestamp_passthrough: bool,
    /// Aggregation limit for plain HTTP/1.1 connections
    pub max_content_length: usize,
    /// Aggregation limit after protocol negotiation (per HTTP/2 stream)
    pub h2_max_content_length: usize,
}

impl ServerConfig {
    /// Resolve CLI arguments into a configuration
    pub fn from_args(args: &CliArgs) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let cert_source = match &args.key_store_file {
            Some(path) => CertSource::Keystore {
                path: path.clone(),
                password: args.key_store_password.clone(),
            },
            None => CertSource::SelfSigned,
        };

        ServerConfig {
            port: args.port,
            boss_threads: args.boss_threads.unwrap_or(1).max(1),
            worker_threads: args.worker_threads.unwrap_or(parallelism).max(1),
            http2: args.http2,
            ssl: args.ssl,
            cert_source,
            response_delay: Duration::from_millis(args.delay),
            h2_aggregate_content: args.h2_aggregate_content,
            timestamp_passthrough: args.timestamp_headers,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            h2_max_content_length: NEGOTIATED_MAX_CONTENT_LENGTH,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: DEFAULT_PORT,
            boss_threads: 1,
            worker_threads: 1,
            http2: false,
            ssl: false,
            cert_source: CertSource::SelfSigned,
            response_delay: Duration::ZERO,
            h2_aggregate_content: true,
            timestamp_passthrough: false,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            h2_max_content_length: NEGOTIATED_MAX_CONTENT_LENGTH,
        }
    }
}
