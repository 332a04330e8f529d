//! Filesystem event listener
//!
//! Bridges notify's callback world into the async engine: raw notifications
//! flow through a crossbeam channel into a blocking bridge loop that
//! filters, classifies and debounces them before handing typed events to
//! the consumer over a tokio channel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::is_dump_file;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Listener setup failures. Everything after setup degrades to log lines.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch directory {0} does not exist or is not a directory")]
    MissingDirectory(PathBuf),
    #[error("failed to initialize filesystem watcher: {0}")]
    Notify(#[from] notify::Error),
}

/// A change the listener considers relevant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

/// Admits at most one notification per window.
///
/// The clock is global rather than per file and only advances on admitted
/// notifications; rejected ones do not stretch the window. Distinct from the
/// per-file dispatch cooldown, which lives in the gate.
#[derive(Debug)]
pub struct DebounceWindow {
    window: Duration,
    last_admitted: Option<Instant>,
}

impl DebounceWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_admitted: None,
        }
    }

    pub fn admit(&mut self, now: Instant) -> bool {
        match self.last_admitted {
            Some(last) if now.saturating_duration_since(last) < self.window => false,
            _ => {
                self.last_admitted = Some(now);
                true
            }
        }
    }
}

/// notify-backed watcher on one directory, non-recursive.
pub struct DirListener {
    shutdown: Arc<AtomicBool>,
    bridge: JoinHandle<()>,
}

impl DirListener {
    /// Start watching `watch_dir` and return the classified event stream.
    ///
    /// `watch_dir` must already be canonical so event paths line up with
    /// tracker keys.
    pub fn start(
        watch_dir: PathBuf,
        debounce_window: Duration,
    ) -> Result<(Self, mpsc::Receiver<FileEvent>), WatchError> {
        if !watch_dir.is_dir() {
            return Err(WatchError::MissingDirectory(watch_dir));
        }

        let (raw_tx, raw_rx) = unbounded();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                // A dropped receiver means the bridge is gone; nothing to do.
                let _ = raw_tx.send(result);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let bridge = tokio::task::spawn_blocking({
            let shutdown = shutdown.clone();
            move || bridge_loop(watcher, watch_dir, raw_rx, tx, debounce_window, shutdown)
        });

        Ok((Self { shutdown, bridge }, rx))
    }

    /// Stop the OS watcher and join the bridge.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Err(err) = self.bridge.await {
            warn!("Listener bridge ended abnormally: {}", err);
        }
    }
}

fn bridge_loop(
    watcher: RecommendedWatcher,
    watch_dir: PathBuf,
    raw_rx: Receiver<notify::Result<Event>>,
    tx: mpsc::Sender<FileEvent>,
    debounce_window: Duration,
    shutdown: Arc<AtomicBool>,
) {
    // Holds the OS watcher alive for the lifetime of the loop.
    let _watcher = watcher;
    let mut debounce = DebounceWindow::new(debounce_window);

    loop {
        match raw_rx.recv_timeout(SHUTDOWN_POLL) {
            Ok(Ok(event)) => {
                for file_event in classify(&watch_dir, event, &mut debounce) {
                    if tx.blocking_send(file_event).is_err() {
                        debug!("Event consumer dropped; stopping listener bridge");
                        return;
                    }
                }
            }
            Ok(Err(err)) => warn!("Filesystem watcher error: {}", err),
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Classify one raw notification into relevant file events.
///
/// Only `.json` files directly inside the watch directory pass. The
/// debounce applies to modify notifications alone and runs after the
/// relevance filter, so only admitted dump-file modifies advance the
/// clock; irrelevant paths never consume the window.
fn classify(watch_dir: &Path, event: Event, debounce: &mut DebounceWindow) -> Vec<FileEvent> {
    let Event { kind, paths, .. } = event;
    let mut out = Vec::new();

    for path in paths {
        match &kind {
            EventKind::Create(_) => {
                if is_relevant(watch_dir, &path) {
                    out.push(FileEvent::Created(path));
                }
            }
            EventKind::Modify(_) => {
                if path.is_dir() || !is_relevant(watch_dir, &path) {
                    continue;
                }
                if !debounce.admit(Instant::now()) {
                    debug!("Debounced modify notification for {}", path.display());
                    continue;
                }
                out.push(FileEvent::Modified(path));
            }
            EventKind::Remove(_) => {
                if is_relevant(watch_dir, &path) {
                    out.push(FileEvent::Removed(path));
                }
            }
            _ => {}
        }
    }
    out
}

fn is_relevant(watch_dir: &Path, path: &Path) -> bool {
    path.parent() == Some(watch_dir) && is_dump_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use std::fs;
    use tempfile::TempDir;

    fn event(kind: EventKind, path: PathBuf) -> Event {
        Event::new(kind).add_path(path)
    }

    #[test]
    fn test_debounce_admits_first_and_after_window() {
        let mut debounce = DebounceWindow::new(Duration::from_secs(2));
        let t0 = Instant::now();

        assert!(debounce.admit(t0));
        assert!(!debounce.admit(t0 + Duration::from_secs(1)));
        assert!(debounce.admit(t0 + Duration::from_secs(2)));
    }

    #[test]
    fn test_debounce_rejections_do_not_stretch_the_window() {
        let mut debounce = DebounceWindow::new(Duration::from_secs(2));
        let t0 = Instant::now();

        assert!(debounce.admit(t0));
        assert!(!debounce.admit(t0 + Duration::from_millis(1500)));
        // Measured from the admitted event, not the rejected one.
        assert!(debounce.admit(t0 + Duration::from_millis(2100)));
    }

    #[test]
    fn test_classify_filters_to_dump_files_in_dir() {
        let dir = TempDir::new().unwrap();
        let watch_dir = dir.path().to_path_buf();
        let mut debounce = DebounceWindow::new(Duration::ZERO);

        let inside = watch_dir.join("a.json");
        let wrong_ext = watch_dir.join("a.txt");
        let nested = watch_dir.join("sub").join("b.json");

        let got = classify(
            &watch_dir,
            event(EventKind::Create(CreateKind::File), inside.clone()),
            &mut debounce,
        );
        assert_eq!(got, vec![FileEvent::Created(inside)]);

        assert!(classify(
            &watch_dir,
            event(EventKind::Create(CreateKind::File), wrong_ext),
            &mut debounce,
        )
        .is_empty());

        assert!(classify(
            &watch_dir,
            event(EventKind::Create(CreateKind::File), nested),
            &mut debounce,
        )
        .is_empty());
    }

    #[test]
    fn test_modify_notifications_are_debounced() {
        let dir = TempDir::new().unwrap();
        let watch_dir = dir.path().to_path_buf();
        let path = watch_dir.join("a.json");
        fs::write(&path, "{}\n").unwrap();
        let mut debounce = DebounceWindow::new(Duration::from_secs(2));

        let first = classify(
            &watch_dir,
            event(EventKind::Modify(ModifyKind::Any), path.clone()),
            &mut debounce,
        );
        assert_eq!(first, vec![FileEvent::Modified(path.clone())]);

        let second = classify(
            &watch_dir,
            event(EventKind::Modify(ModifyKind::Any), path),
            &mut debounce,
        );
        assert!(second.is_empty());
    }

    #[test]
    fn test_remove_is_not_debounced() {
        let dir = TempDir::new().unwrap();
        let watch_dir = dir.path().to_path_buf();
        let path = watch_dir.join("a.json");
        fs::write(&path, "{}\n").unwrap();
        let mut debounce = DebounceWindow::new(Duration::from_secs(2));

        assert!(!classify(
            &watch_dir,
            event(EventKind::Modify(ModifyKind::Any), path.clone()),
            &mut debounce,
        )
        .is_empty());

        // A delete right after an admitted modify still goes through.
        let got = classify(
            &watch_dir,
            event(EventKind::Remove(RemoveKind::File), path.clone()),
            &mut debounce,
        );
        assert_eq!(got, vec![FileEvent::Removed(path)]);
    }

    #[test]
    fn test_irrelevant_modify_leaves_the_clock_alone() {
        let dir = TempDir::new().unwrap();
        let watch_dir = dir.path().to_path_buf();
        let noise = watch_dir.join("noise.txt");
        let dump = watch_dir.join("a.json");
        fs::write(&noise, "x").unwrap();
        fs::write(&dump, "{}\n").unwrap();
        let mut debounce = DebounceWindow::new(Duration::from_secs(2));

        // A modify for a non-dump file is filtered out before the debounce.
        assert!(classify(
            &watch_dir,
            event(EventKind::Modify(ModifyKind::Any), noise),
            &mut debounce,
        )
        .is_empty());

        // The window was not consumed, so a dump modify right after passes.
        let got = classify(
            &watch_dir,
            event(EventKind::Modify(ModifyKind::Any), dump.clone()),
            &mut debounce,
        );
        assert_eq!(got, vec![FileEvent::Modified(dump)]);
    }

    #[test]
    fn test_directory_modify_leaves_the_clock_alone() {
        let dir = TempDir::new().unwrap();
        let watch_dir = dir.path().to_path_buf();
        let path = watch_dir.join("a.json");
        fs::write(&path, "{}\n").unwrap();
        let mut debounce = DebounceWindow::new(Duration::from_secs(2));

        // A modify event for the directory itself is skipped entirely.
        assert!(classify(
            &watch_dir,
            event(EventKind::Modify(ModifyKind::Any), watch_dir.clone()),
            &mut debounce,
        )
        .is_empty());

        // The window was not consumed by it.
        let got = classify(
            &watch_dir,
            event(EventKind::Modify(ModifyKind::Any), path.clone()),
            &mut debounce,
        );
        assert_eq!(got, vec![FileEvent::Modified(path)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_reports_create_modify_remove() {
        let dir = TempDir::new().unwrap();
        let watch_dir = dir.path().canonicalize().unwrap();
        let path = watch_dir.join("events.json");

        let (listener, mut rx) =
            DirListener::start(watch_dir.clone(), Duration::ZERO).unwrap();
        // Give the OS watcher a moment to register.
        tokio::time::sleep(Duration::from_millis(100)).await;

        fs::write(&path, "{\"n\":1}\n").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&path, "{\"n\":1}\n{\"n\":2}\n").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::remove_file(&path).unwrap();

        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(250), rx.recv()).await {
                Ok(Some(event)) => {
                    let done = matches!(event, FileEvent::Removed(_));
                    seen.push(event);
                    if done {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }

        assert!(
            seen.contains(&FileEvent::Created(path.clone())),
            "no create event in {seen:?}"
        );
        assert!(
            seen.contains(&FileEvent::Modified(path.clone())),
            "no modify event in {seen:?}"
        );
        assert!(
            seen.contains(&FileEvent::Removed(path.clone())),
            "no remove event in {seen:?}"
        );

        listener.shutdown().await;
    }

    #[test]
    fn test_start_rejects_missing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");

        // Validation runs before any watcher or task is created, so this is
        // safe to call outside a runtime.
        match DirListener::start(missing.clone(), Duration::from_secs(2)) {
            Err(WatchError::MissingDirectory(path)) => assert_eq!(path, missing),
            other => panic!("expected MissingDirectory, got {:?}", other.map(|_| ())),
        }
    }
}
