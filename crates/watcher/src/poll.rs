//! Polling fallback scanner
//!
//! Periodically rescans the watch directory for growth the event listener
//! may have missed (lost notifications, writers that bypass the OS event
//! stream) and for files that vanished without a delete event.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tailcast_core::Engine;
use tokio::time::interval;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::is_dump_file;

/// Polling fallback scanner
///
/// Only strict line-count growth triggers a dispatch from here; rewrites
/// and shrinks are the event listener's problem. Unseen files are lazily
/// tracked at their current size so discovery never replays old content.
pub struct PollScanner {
    /// Directory being watched
    watch_dir: PathBuf,

    /// Scan interval (default: 3 seconds)
    interval: Duration,

    /// Shared change-handling engine
    engine: Arc<Engine>,
}

impl PollScanner {
    pub fn new(watch_dir: PathBuf, interval: Duration, engine: Arc<Engine>) -> Self {
        Self {
            watch_dir,
            interval,
            engine,
        }
    }

    /// Run the polling loop. Never returns; the owning service aborts this
    /// task on shutdown. A failed pass is logged and the loop carries on.
    pub async fn run(self) {
        let mut timer = interval(self.interval);

        info!("Starting polling fallback (interval: {:?})", self.interval);

        loop {
            timer.tick().await;

            match self.scan_pass().await {
                Ok(scanned) => debug!("Polling pass covered {} files", scanned),
                Err(err) => warn!("Polling pass failed: {:#}", err),
            }
        }
    }

    /// One pass: probe every dump file, then prune the tracked paths that
    /// are no longer on disk.
    async fn scan_pass(&self) -> Result<usize> {
        let mut scanned = 0;

        for entry in WalkDir::new(&self.watch_dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            if !is_dump_file(&path) {
                continue;
            }

            self.engine.poll_file(&path).await;
            scanned += 1;
        }

        // Pruning checks existence directly; by the time the dispatches
        // above have finished, the walk is a stale snapshot and files
        // created mid-pass would look missing.
        self.engine.prune_absent();
        Ok(scanned)
    }
}
