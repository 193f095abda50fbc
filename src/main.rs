//! # chatsync - update synchronization server for chat clients
//!
//! This is the main entry point for the chatsync server. It serves per-entity update logs to
//! clients catching up after being offline, and streams new updates to connected clients.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use chatsync::server::{ServerConfig, SyncServer};
use chatsync::updates::EngineConfig;

/// Update synchronization server for chat clients.
///
/// chatsync keeps a strictly ordered update log per user, chat and space. Clients catch up by
/// asking for everything after the last sequence number they have seen, and connected clients
/// receive new updates as soon as they commit.
#[derive(Parser, Debug)]
#[command(
    name = "chatsync",
    version,
    about = "Update synchronization server for chat clients",
    long_about = "chatsync keeps a durable, gap-free update log per user, chat and space and serves catch-up and realtime delivery over gRPC."
)]
struct Args {
    /// Human-readable name for this server.
    /// This is used to identify the server in logs.
    #[arg(long, default_value = "default")]
    name: String,

    /// Path to the data directory where chatsync stores all persistent data.
    #[arg(long, default_value = "default.chatsync")]
    data_dir: String,

    /// List of URLs to listen on for client traffic.
    /// Format: http://host:port[,http://host:port,...]
    #[arg(long, default_value = "http://localhost:7400")]
    listen_client_urls: String,

    /// Backend page cache size in megabytes.
    #[arg(long, default_value_t = 256)]
    cache_size_mb: u64,

    /// How often the backend flushes to disk, in milliseconds (0 disables periodic flushing).
    #[arg(long, default_value_t = 1000)]
    flush_interval_ms: u64,

    /// Largest catch-up span served incrementally.
    /// Longer spans are answered with TOO_LONG and the client resynchronizes from a snapshot.
    #[arg(long, default_value_t = 1000)]
    max_total_updates: usize,

    /// Page size used when a catch-up request does not specify one.
    #[arg(long, default_value_t = 100)]
    default_page_size: usize,

    /// Upper bound on the page size a client may request.
    #[arg(long, default_value_t = 1000)]
    max_page_size: usize,

    /// How many times a conflicting write is retried before it fails.
    #[arg(long, default_value_t = 16)]
    max_allocation_attempts: u32,

    /// Milliseconds a write waits for another write's entity lock before retrying.
    #[arg(long, default_value_t = 2000)]
    lock_wait_ms: u64,

    /// Per-subscriber buffer of live updates, in commits.
    /// Subscribers that fall further behind are disconnected.
    #[arg(long, default_value_t = 256)]
    subscriber_buffer: usize,

    /// Rows kept per bucket by the retention pruner (0 disables pruning).
    #[arg(long, default_value_t = 0)]
    retention_updates: u64,

    /// Seconds between retention passes.
    #[arg(long, default_value_t = 300)]
    retention_interval_secs: u64,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    /// 'info' is recommended for production.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing/logging
    initialize_tracing(&args.log_level)?;

    print_startup_banner(&args);

    let config = build_server_config(&args)?;

    let server = SyncServer::new(config).await?;

    // Set up signal handlers for graceful shutdown
    let shutdown = setup_signal_handlers();

    info!("Starting chatsync server...");
    match server.run(shutdown).await {
        Ok(()) => {
            info!("Server shut down gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {:?}", e);
            Err(e)
        }
    }
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" => EnvFilter::new("trace"),
        "debug" => EnvFilter::new("debug"),
        "info" => EnvFilter::new("info"),
        "warn" => EnvFilter::new("warn"),
        "error" => EnvFilter::new("error"),
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            EnvFilter::new("info")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

fn print_startup_banner(args: &Args) {
    println!("chatsync v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Configuration:");
    println!("  Name:                  {}", args.name);
    println!("  Data directory:        {}", args.data_dir);
    println!("  Client URLs:           {}", args.listen_client_urls);
    println!("  Max total updates:     {}", args.max_total_updates);
    if args.retention_updates > 0 {
        println!(
            "  Retention:             {} updates every {}s",
            args.retention_updates, args.retention_interval_secs
        );
    } else {
        println!("  Retention:             disabled");
    }
    println!("  Log level:             {}", args.log_level);
    println!();
}

/// Build ServerConfig from CLI arguments.
fn build_server_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let listen_client_urls = parse_urls(&args.listen_client_urls);
    if listen_client_urls.is_empty() {
        return Err(anyhow::anyhow!("--listen-client-urls must not be empty"));
    }
    if args.retention_updates > 0 && args.retention_interval_secs == 0 {
        return Err(anyhow::anyhow!(
            "--retention-interval-secs must be positive when retention is enabled"
        ));
    }

    Ok(ServerConfig {
        name: args.name.clone(),
        data_dir: PathBuf::from(&args.data_dir),
        listen_client_urls,
        cache_size_mb: args.cache_size_mb,
        flush_interval_ms: args.flush_interval_ms,
        engine: EngineConfig {
            max_total_updates: args.max_total_updates,
            default_page_size: args.default_page_size,
            max_page_size: args.max_page_size,
            max_allocation_attempts: args.max_allocation_attempts,
            lock_wait: Duration::from_millis(args.lock_wait_ms),
            subscriber_buffer: args.subscriber_buffer,
        },
        retention_updates: args.retention_updates,
        retention_interval: Duration::from_secs(args.retention_interval_secs),
    })
}

/// Parse comma-separated URLs into a vector, trimming whitespace.
fn parse_urls(urls_str: &str) -> Vec<String> {
    urls_str
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Set up signal handlers for graceful shutdown (SIGTERM, SIGINT).
fn setup_signal_handlers() -> impl std::future::Future<Output = ()> {
    async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT signal");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_urls_multiple() {
        let urls = parse_urls("http://localhost:7400 , http://localhost:7401");
        assert_eq!(urls, vec!["http://localhost:7400", "http://localhost:7401"]);
    }

    #[test]
    fn test_parse_urls_empty() {
        assert!(parse_urls("").is_empty());
        assert!(parse_urls(" , ").is_empty());
    }

    #[test]
    fn test_build_server_config() {
        let args = Args::parse_from([
            "chatsync",
            "--data-dir",
            "/tmp/sync",
            "--max-total-updates",
            "50",
            "--retention-updates",
            "500",
            "--lock-wait-ms",
            "250",
        ]);
        let config = build_server_config(&args).unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/sync"));
        assert_eq!(config.engine.max_total_updates, 50);
        assert_eq!(config.engine.default_page_size, 100);
        assert_eq!(config.engine.lock_wait, Duration::from_millis(250));
        assert_eq!(config.retention_updates, 500);
        assert_eq!(config.retention_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_build_server_config_rejects_zero_interval() {
        let args = Args::parse_from([
            "chatsync",
            "--retention-updates",
            "10",
            "--retention-interval-secs",
            "0",
        ]);
        assert!(build_server_config(&args).is_err());
    }
}
