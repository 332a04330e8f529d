//! Filesystem watching for Tailcast
//!
//! This crate provides:
//! - A notify-backed event listener (create/modify/delete, debounced)
//! - A polling fallback that catches missed growth and vanished files
//! - The service binding both drivers to one shared engine

pub mod listener;
pub mod poll;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tailcast_core::Engine;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

// Re-exports
pub use listener::{DebounceWindow, DirListener, FileEvent, WatchError};
pub use poll::PollScanner;

/// Tunables for the dual change drivers. Defaults match the production
/// contract.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Window of the raw modify-notification debounce.
    pub debounce_window: Duration,
    /// Polling fallback interval.
    pub poll_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(2),
            poll_interval: Duration::from_secs(3),
        }
    }
}

/// Whether `path` names a JSON dump file.
pub(crate) fn is_dump_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "json").unwrap_or(false)
}

/// Both change drivers bound to one engine and one watch directory.
///
/// All spawned tasks are owned here, so shutdown is deterministic: the
/// listener bridge is joined, the poller aborted, and the event consumer
/// drains out once the listener's channel closes.
pub struct WatchService {
    listener: DirListener,
    consumer: JoinHandle<()>,
    poller: JoinHandle<()>,
}

impl WatchService {
    /// Seed every pre-existing dump file, then start both drivers.
    ///
    /// Must run inside a tokio runtime. The watch directory is
    /// canonicalized first so event paths, poll paths and tracker keys all
    /// agree.
    pub fn start(
        watch_dir: PathBuf,
        engine: Arc<Engine>,
        config: WatchConfig,
    ) -> Result<Self, WatchError> {
        let watch_dir = match watch_dir.canonicalize() {
            Ok(dir) => dir,
            Err(_) => return Err(WatchError::MissingDirectory(watch_dir)),
        };

        seed_existing(&watch_dir, &engine);

        let (listener, mut events) = DirListener::start(watch_dir.clone(), config.debounce_window)?;
        info!("Watching directory {}", watch_dir.display());

        let consumer = tokio::spawn({
            let engine = engine.clone();
            async move {
                while let Some(event) = events.recv().await {
                    match event {
                        FileEvent::Created(path) => {
                            engine.handle_change(&path, true).await;
                        }
                        FileEvent::Modified(path) => {
                            engine.handle_change(&path, false).await;
                        }
                        FileEvent::Removed(path) => {
                            engine.forget(&path);
                        }
                    }
                }
                debug!("Event stream closed");
            }
        });

        let poller = tokio::spawn(PollScanner::new(watch_dir, config.poll_interval, engine).run());

        Ok(Self {
            listener,
            consumer,
            poller,
        })
    }

    /// Stop both drivers and wait for them.
    pub async fn shutdown(self) {
        info!("Stopping watch service");
        self.poller.abort();
        let _ = self.poller.await;
        self.listener.shutdown().await;
        if let Err(err) = self.consumer.await {
            warn!("Event consumer ended abnormally: {}", err);
        }
        info!("Watch service stopped");
    }
}

/// Track every dump file already present in the directory, recording line
/// counts and final records so startup content is not re-dispatched.
fn seed_existing(watch_dir: &Path, engine: &Engine) {
    for entry in WalkDir::new(watch_dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                let path = entry.into_path();
                if is_dump_file(&path) {
                    engine.seed_file(&path);
                }
            }
            Ok(_) => {}
            Err(err) => warn!("Startup scan error: {}", err),
        }
    }
}
