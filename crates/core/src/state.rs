//! Per-file tracking state shared by the event and polling drivers

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

use crate::gate::{self, GateDecision};

/// Everything remembered about one watched file.
#[derive(Debug, Clone)]
pub struct FileState {
    /// Last observed count of non-blank lines.
    pub line_count: usize,
    /// Last dispatched (or seeded at startup) record.
    pub last_record: Option<Value>,
    /// When the last dispatch was claimed for this file. `None` means never.
    pub last_dispatch: Option<Instant>,
    /// Dispatch failures since the last success. Diagnostic only; it never
    /// gates dispatching.
    pub consecutive_failures: u32,
}

impl FileState {
    /// State for a file known only by its line count.
    pub fn new(line_count: usize) -> Self {
        Self {
            line_count,
            last_record: None,
            last_dispatch: None,
            consecutive_failures: 0,
        }
    }

    /// State seeded from a full startup observation.
    pub fn seeded(line_count: usize, last_record: Option<Value>) -> Self {
        Self {
            line_count,
            last_record,
            last_dispatch: None,
            consecutive_failures: 0,
        }
    }

    /// Time left in the cooldown window at `now`, if any.
    pub fn cooldown_remaining(&self, now: Instant, cooldown: Duration) -> Option<Duration> {
        let last = self.last_dispatch?;
        let elapsed = now.saturating_duration_since(last);
        if elapsed < cooldown {
            Some(cooldown - elapsed)
        } else {
            None
        }
    }
}

/// Concurrent map of tracked files.
///
/// Both change drivers share one tracker; every read-modify-write runs under
/// the map's per-key entry lock and never holds it across an await.
#[derive(Debug, Default)]
pub struct FileTracker {
    files: DashMap<PathBuf, FileState>,
}

impl FileTracker {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
        }
    }

    /// Track `path` if unseen, seeding the line count only. Returns true if
    /// the entry was inserted.
    ///
    /// New files seed zero (their first content counts as growth); files
    /// discovered mid-flight seed the current probe so existing content is
    /// not replayed.
    pub fn ensure(&self, path: &Path, initial_lines: usize) -> bool {
        let mut inserted = false;
        self.files.entry(path.to_path_buf()).or_insert_with(|| {
            inserted = true;
            FileState::new(initial_lines)
        });
        inserted
    }

    /// Track `path` with a full startup observation (count and final
    /// record). Returns true if the entry was inserted.
    pub fn seed(&self, path: &Path, lines: usize, record: Option<Value>) -> bool {
        let mut inserted = false;
        self.files.entry(path.to_path_buf()).or_insert_with(|| {
            inserted = true;
            FileState::seeded(lines, record)
        });
        inserted
    }

    /// Drop `path` from tracking. Returns true if it was tracked.
    pub fn forget(&self, path: &Path) -> bool {
        self.files.remove(path).is_some()
    }

    /// Run the dispatch gate for `path` under its entry lock. `None` if the
    /// path is not tracked (forgotten by a racing delete).
    pub fn decide(
        &self,
        path: &Path,
        current_lines: usize,
        current_last: Option<Value>,
        now: Instant,
        cooldown: Duration,
    ) -> Option<GateDecision> {
        let mut entry = self.files.get_mut(path)?;
        Some(gate::evaluate(
            entry.value_mut(),
            current_lines,
            current_last,
            now,
            cooldown,
        ))
    }

    /// Cheap cooldown probe that claims nothing.
    pub fn in_cooldown(&self, path: &Path, now: Instant, cooldown: Duration) -> Option<Duration> {
        self.files.get(path)?.cooldown_remaining(now, cooldown)
    }

    /// Fold a finished dispatch into the failure counter. Returns the new
    /// counter value, or `None` if the file was forgotten mid-dispatch.
    pub fn record_outcome(&self, path: &Path, success: bool) -> Option<u32> {
        let mut entry = self.files.get_mut(path)?;
        if success {
            entry.consecutive_failures = 0;
        } else {
            entry.consecutive_failures += 1;
        }
        Some(entry.consecutive_failures)
    }

    /// Drop every tracked path that no longer exists on disk; returns what
    /// was dropped. Existence is checked per entry at prune time rather
    /// than against a caller-built snapshot, so a file tracked after the
    /// snapshot was taken keeps its state.
    pub fn prune_absent(&self) -> Vec<PathBuf> {
        let mut dropped = Vec::new();
        self.files.retain(|path, _| {
            if path.exists() {
                true
            } else {
                dropped.push(path.clone());
                false
            }
        });
        dropped
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn line_count(&self, path: &Path) -> Option<usize> {
        self.files.get(path).map(|state| state.line_count)
    }

    pub fn failure_count(&self, path: &Path) -> Option<u32> {
        self.files.get(path).map(|state| state.consecutive_failures)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const COOLDOWN: Duration = Duration::from_secs(5);

    #[test]
    fn test_ensure_inserts_once() {
        let tracker = FileTracker::new();
        let path = Path::new("a.json");

        assert!(tracker.ensure(path, 3));
        assert!(!tracker.ensure(path, 99));
        assert_eq!(tracker.line_count(path), Some(3));
    }

    #[test]
    fn test_seed_keeps_record() {
        let tracker = FileTracker::new();
        let path = Path::new("a.json");

        assert!(tracker.seed(path, 2, Some(json!({"v": 1}))));
        // An unchanged observation of the seeded state is a no-op.
        let decision = tracker.decide(path, 2, Some(json!({"v": 1})), Instant::now(), COOLDOWN);
        assert_eq!(decision, Some(GateDecision::Unchanged));
    }

    #[test]
    fn test_forget_removes_entry() {
        let tracker = FileTracker::new();
        let path = Path::new("a.json");
        tracker.ensure(path, 1);

        assert!(tracker.forget(path));
        assert!(!tracker.forget(path));
        assert!(!tracker.contains(path));
    }

    #[test]
    fn test_decide_untracked_is_none() {
        let tracker = FileTracker::new();
        let decision = tracker.decide(
            Path::new("ghost.json"),
            1,
            Some(json!(1)),
            Instant::now(),
            COOLDOWN,
        );
        assert_eq!(decision, None);
    }

    #[test]
    fn test_record_outcome_counts_and_resets() {
        let tracker = FileTracker::new();
        let path = Path::new("a.json");
        tracker.ensure(path, 1);

        assert_eq!(tracker.record_outcome(path, false), Some(1));
        assert_eq!(tracker.record_outcome(path, false), Some(2));
        assert_eq!(tracker.record_outcome(path, true), Some(0));
        assert_eq!(tracker.record_outcome(Path::new("ghost.json"), false), None);
    }

    #[test]
    fn test_prune_absent_drops_deleted_paths() {
        let dir = TempDir::new().unwrap();
        let keep = dir.path().join("keep.json");
        let gone = dir.path().join("gone.json");
        std::fs::write(&keep, "{}\n").unwrap();

        let tracker = FileTracker::new();
        tracker.ensure(&keep, 1);
        tracker.ensure(&gone, 1);

        let dropped = tracker.prune_absent();

        assert_eq!(dropped, vec![gone]);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.contains(&keep));
    }

    #[test]
    fn test_concurrent_observers_claim_once() {
        use std::sync::Arc;
        use std::thread;

        // Two drivers observing the same growth race through the gate; the
        // per-key lock lets exactly one claim the dispatch.
        let tracker = Arc::new(FileTracker::new());
        let path = PathBuf::from("a.json");
        tracker.ensure(&path, 0);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let tracker = tracker.clone();
            let path = path.clone();
            handles.push(thread::spawn(move || {
                tracker
                    .decide(&path, 1, Some(json!({"n": 1})), Instant::now(), COOLDOWN)
                    .unwrap()
            }));
        }

        let decisions: Vec<GateDecision> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let dispatched = decisions
            .iter()
            .filter(|d| matches!(d, GateDecision::Dispatch { .. }))
            .count();
        assert_eq!(dispatched, 1, "exactly one observer claims: {decisions:?}");
    }
}
