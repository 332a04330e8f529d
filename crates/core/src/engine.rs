//! Change-handling engine: probes, gates and dispatches for one watch dir

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dispatch::RecordSink;
use crate::gate::{DispatchTrigger, GateDecision};
use crate::ndjson;
use crate::state::FileTracker;

/// Tunables for the engine. Defaults match the production contract.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum spacing between dispatches for one file.
    pub cooldown: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
        }
    }
}

/// What handling one observed change amounted to. Returned for the callers'
/// logging and for tests; the engine has already logged the detail.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOutcome {
    /// The file is gone (or was forgotten by a racing delete).
    Missing,
    /// Suppressed by the per-file cooldown.
    Throttled,
    /// Nothing effectively changed.
    Unchanged,
    /// Newly tracked at its current size, nothing dispatched.
    Seeded { line_count: usize },
    /// Line count caught up without a dispatchable record.
    TrackedOnly { line_count: usize },
    /// A record went out (or at least was attempted).
    Dispatched {
        trigger: DispatchTrigger,
        delivered: bool,
    },
}

/// Ties the tracker, the gate and the sink together.
///
/// Both change drivers funnel into [`Engine::handle_change`]; the gate
/// claims state under the tracker's per-key lock before the sink runs, so
/// redundant observations of one change collapse into one dispatch.
pub struct Engine {
    files: FileTracker,
    sink: Arc<dyn RecordSink>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(sink: Arc<dyn RecordSink>, config: EngineConfig) -> Self {
        Self {
            files: FileTracker::new(),
            sink,
            config,
        }
    }

    /// Track a pre-existing file with a full observation (line count and
    /// final record), so startup content is neither replayed nor treated as
    /// a rewrite on the first event. Returns the observed line count.
    pub fn seed_file(&self, path: &Path) -> usize {
        let lines = ndjson::count_lines(path);
        let record = ndjson::last_record(path);
        if self.files.seed(path, lines, record) {
            info!("Tracking {} at {} lines", label(path), lines);
        }
        lines
    }

    /// Handle one observed change on `path`.
    ///
    /// `new_file` seeds an untracked entry at zero lines (creation: the
    /// current content counts as growth); otherwise an untracked entry seeds
    /// at the probed count and only the final record can differ.
    pub async fn handle_change(&self, path: &Path, new_file: bool) -> ChangeOutcome {
        if !path.exists() {
            warn!("Ignoring change for missing file {}", path.display());
            return ChangeOutcome::Missing;
        }

        let probed = ndjson::count_lines(path);
        let inserted = self
            .files
            .ensure(path, if new_file { 0 } else { probed });
        if inserted && !new_file {
            debug!("Lazily tracking {} at {} lines", label(path), probed);
        }

        // Cooldown peek before paying for record extraction; the gate
        // re-checks under the lock.
        if let Some(remaining) =
            self.files
                .in_cooldown(path, Instant::now(), self.config.cooldown)
        {
            info!(
                "Skipping {}: cooldown for another {:.1}s",
                label(path),
                remaining.as_secs_f64()
            );
            return ChangeOutcome::Throttled;
        }

        let current_last = ndjson::last_record(path);
        let decision = match self.files.decide(
            path,
            probed,
            current_last,
            Instant::now(),
            self.config.cooldown,
        ) {
            Some(decision) => decision,
            None => {
                debug!("{} was forgotten while handling a change", label(path));
                return ChangeOutcome::Missing;
            }
        };

        match decision {
            GateDecision::Throttled { remaining } => {
                info!(
                    "Skipping {}: cooldown for another {:.1}s",
                    label(path),
                    remaining.as_secs_f64()
                );
                ChangeOutcome::Throttled
            }
            GateDecision::Unchanged => {
                debug!("No effective change in {}", label(path));
                ChangeOutcome::Unchanged
            }
            GateDecision::TrackedOnly { line_count } => {
                warn!(
                    "No parseable records in {}; tracking {} lines without dispatch",
                    label(path),
                    line_count
                );
                ChangeOutcome::TrackedOnly { line_count }
            }
            GateDecision::Dispatch { record, trigger } => {
                match trigger {
                    DispatchTrigger::LineDelta { from, to } => {
                        info!("Line count changed in {}: {} -> {}", label(path), from, to)
                    }
                    DispatchTrigger::Rewrite => {
                        info!(
                            "Final record rewritten in {} (line count unchanged)",
                            label(path)
                        )
                    }
                }
                let delivered = self.deliver(path, &record).await;
                ChangeOutcome::Dispatched { trigger, delivered }
            }
        }
    }

    /// Poll-driven probe of one file: lazily track unseen files at their
    /// current size, feed strict growth through the normal change path.
    /// Shrinks and rewrites are left to the event driver.
    pub async fn poll_file(&self, path: &Path) -> ChangeOutcome {
        match self.files.line_count(path) {
            None => {
                let lines = ndjson::count_lines(path);
                self.files.ensure(path, lines);
                info!("Tracking {} at {} lines", label(path), lines);
                ChangeOutcome::Seeded { line_count: lines }
            }
            Some(tracked) => {
                let current = ndjson::count_lines(path);
                if current > tracked {
                    info!(
                        "Polling detected growth in {}: {} -> {}",
                        label(path),
                        tracked,
                        current
                    );
                    self.handle_change(path, false).await
                } else {
                    ChangeOutcome::Unchanged
                }
            }
        }
    }

    /// Drop a deleted file from tracking.
    pub fn forget(&self, path: &Path) -> bool {
        let removed = self.files.forget(path);
        if removed {
            info!("Stopped tracking deleted file {}", label(path));
        }
        removed
    }

    /// Drop every tracked path that no longer exists on disk (poll-detected
    /// absence). Returns the dropped paths.
    pub fn prune_absent(&self) -> Vec<PathBuf> {
        let dropped = self.files.prune_absent();
        for path in &dropped {
            info!("Stopped tracking missing file {}", label(path));
        }
        dropped
    }

    pub fn tracked_files(&self) -> usize {
        self.files.len()
    }

    pub fn tracked_lines(&self, path: &Path) -> Option<usize> {
        self.files.line_count(path)
    }

    pub fn failure_count(&self, path: &Path) -> Option<u32> {
        self.files.failure_count(path)
    }

    async fn deliver(&self, path: &Path, record: &Value) -> bool {
        let outcome = self.sink.dispatch(record, path).await;
        let success = outcome.is_success();
        match self.files.record_outcome(path, success) {
            Some(failures) if !success => {
                warn!(
                    "Dispatch for {} failed: {} ({} consecutive failures)",
                    label(path),
                    outcome,
                    failures
                );
            }
            Some(_) => {}
            None => debug!("{} was forgotten while dispatching", label(path)),
        }
        success
    }
}

fn label(path: &Path) -> Cow<'_, str> {
    match path.file_name() {
        Some(name) => name.to_string_lossy(),
        None => path.to_string_lossy(),
    }
}
