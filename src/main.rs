//! sqcache - A local disk-backed content cache
//!
//! Serves the JSON line protocol on stdin/stdout. Logs go to stderr.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sqcache::api::{serve, AppState};
use sqcache::{CacheEngine, Config};

#[derive(Parser, Debug)]
#[command(name = "sqcache", version, about = "Local disk-backed content cache")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the line protocol on stdin/stdout (default)
    Serve {
        /// Initialise the cache in this directory at start-up
        #[arg(long, env = "SQCACHE_BASE_DIR")]
        base_dir: Option<std::path::PathBuf>,
    },
    /// Print version information
    Version,
}

/// Main entry point for the sqcache server.
///
/// # Startup Sequence
/// 1. Parse the command line
/// 2. Initialize tracing subscriber (stderr)
/// 3. Load configuration from environment variables
/// 4. Optionally initialise the engine from configuration
/// 5. Serve requests until end of input or a shutdown signal
/// 6. Close a ready engine
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let base_dir = match cli.command {
        Some(Commands::Version) => {
            println!("sqcache {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(Commands::Serve { base_dir }) => base_dir,
        None => None,
    };

    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sqcache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting sqcache {}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env();
    if base_dir.is_some() {
        config.base_dir = base_dir;
    }
    info!(
        "Configuration loaded: max_size={}MB, cap={}, sync={}",
        config.max_size_mb, config.cap_ratio, config.sync_writes
    );

    let engine = Arc::new(CacheEngine::new());
    if let Some(cache_config) = config.startup_cache() {
        engine
            .init(cache_config)
            .context("failed to initialise cache at start-up")?;
    }

    let state = AppState::new(Arc::clone(&engine)).with_sync_writes(config.sync_writes);

    let interrupted = tokio::select! {
        result = serve(tokio::io::stdin(), tokio::io::stdout(), state) => {
            let handled = result.context("line protocol session failed")?;
            info!("End of input after {} requests", handled);
            false
        }
        _ = shutdown_signal() => true,
    };

    if engine.is_ready() {
        let closing = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || closing.close())
            .await
            .context("close task failed")?
            .context("failed to close cache")?;
    }

    info!("Shutdown complete");
    if interrupted {
        // a pending stdin read cannot be cancelled and would block runtime shutdown
        std::process::exit(0);
    }
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
