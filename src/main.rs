//! Dockstream CLI - follow dashboard events and container logs from a terminal.
//!
//! This is the main binary entry point. See the `dockstream` library for the
//! core functionality.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dockstream::consumer::EntryHook;
use dockstream::env::Environment;
use dockstream::ws::http_to_ws_scheme;
use dockstream::{Config, FooterPanel, LogEntry, LogViewer, StreamConnection};
use mimalloc::MiMalloc;

/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Time allowed for queued control frames to reach the server on exit.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

// CLI
#[derive(Parser)]
#[command(name = "dockstream")]
#[command(version)]
#[command(about = "Follow container dashboard events and logs")]
struct Cli {
    /// Streaming endpoint (overrides the configured base URL and path)
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print backend activity (log, system, installation events)
    Watch,
    /// Stream logs for one container
    Logs {
        /// Container ID
        container: String,
        /// Lines kept in memory (100-10000)
        #[arg(long)]
        max_lines: Option<usize>,
        /// Only print lines containing this text (case-insensitive)
        #[arg(long)]
        grep: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let environment = Environment::current();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(environment.default_log_filter()),
    )
    .format_timestamp_secs()
    .init();
    log::debug!("Running in {environment} mode");

    let cli = Cli::parse();
    let config = Config::load()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;

    match cli.command {
        Commands::Watch => runtime.block_on(watch(connection(&config, cli.url), &config)),
        Commands::Logs {
            container,
            max_lines,
            grep,
        } => runtime.block_on(follow_logs(
            connection(&config, cli.url),
            &container,
            max_lines.unwrap_or(config.viewer_max_lines),
            grep,
        )),
        Commands::Config => {
            println!("# {}", Config::config_path()?.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("# endpoint: {}", cli.url.unwrap_or_else(|| config.ws_url()));
            Ok(())
        }
    }
}

fn connection(config: &Config, url: Option<String>) -> StreamConnection {
    match url {
        Some(url) => StreamConnection::new(http_to_ws_scheme(&url), config.reconnect_policy()),
        None => StreamConnection::from_config(config),
    }
}

fn print_entry(entry: &LogEntry) {
    println!(
        "[{}] {}: {}",
        entry.timestamp,
        entry.level.as_str().to_uppercase(),
        entry.message
    );
}

async fn watch(conn: StreamConnection, config: &Config) -> Result<()> {
    log::info!("Watching {}", conn.url());
    let hook: EntryHook = Arc::new(print_entry);
    let panel = FooterPanel::mount_with_hook(&conn, config.footer_capacity, Some(hook));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    log::info!("Shutting down ({} entries buffered)", panel.len());
    drop(panel);
    conn.disconnect();
    Ok(())
}

async fn follow_logs(
    conn: StreamConnection,
    container: &str,
    max_lines: usize,
    grep: Option<String>,
) -> Result<()> {
    let needle = grep.map(|g| g.to_lowercase());
    let hook: EntryHook = Arc::new(move |entry: &LogEntry| {
        let matches = needle
            .as_deref()
            .is_none_or(|n| entry.message.to_lowercase().contains(n));
        if matches {
            print_entry(entry);
        }
    });

    let mut viewer = LogViewer::mount_with_hook(&conn, max_lines, Some(hook));
    conn.connect()
        .await
        .with_context(|| format!("Could not connect to {}", conn.url()))?;
    viewer.start_streaming(container);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    viewer.stop_streaming();
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    drop(viewer);
    conn.disconnect();
    Ok(())
}
