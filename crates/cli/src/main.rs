//! Tailcast CLI - tailcast command

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tailcast_core::{Engine, EngineConfig, Generator};
use tailcast_watcher::{WatchConfig, WatchService};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_FILE: &str = "tailcast.log";

/// Tailcast - forward the newest record of changing JSON dumps to a renderer
#[derive(Parser)]
#[command(name = "tailcast")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory of newline-delimited JSON dump files to watch
    #[arg(long, default_value = "dumps")]
    watch_directory: PathBuf,

    /// Rendering script invoked with each dispatched record
    #[arg(long, default_value = "renderer/generate.js")]
    generator_script: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging();

    // Both paths must resolve before any watching begins.
    let watch_dir = match cli.watch_directory.canonicalize() {
        Ok(dir) if dir.is_dir() => dir,
        _ => {
            error!(
                "Watch directory not found: {}",
                cli.watch_directory.display()
            );
            anyhow::bail!(
                "watch directory {} does not exist",
                cli.watch_directory.display()
            );
        }
    };
    let script = match cli.generator_script.canonicalize() {
        Ok(path) if path.is_file() => path,
        _ => {
            error!(
                "Generator script not found: {}",
                cli.generator_script.display()
            );
            anyhow::bail!(
                "generator script {} does not exist",
                cli.generator_script.display()
            );
        }
    };

    info!("Using generator script {}", script.display());

    let generator = Generator::new(script);
    let engine = Arc::new(Engine::new(Arc::new(generator), EngineConfig::default()));
    let service = WatchService::start(watch_dir, engine, WatchConfig::default())
        .context("Failed to start watch service")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt")?;
    info!("Interrupt received, shutting down");
    service.shutdown().await;

    Ok(())
}

/// Dual-sink logging: everything goes to stdout and to `tailcast.log` in
/// the working directory. The returned guard flushes the file writer and
/// must live for the whole process.
fn init_logging() -> WorkerGuard {
    let file_appender = tracing_appender::rolling::never(".", LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("tailcast=info,tailcast_core=info,tailcast_watcher=info")
        })
    };

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter());
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}
