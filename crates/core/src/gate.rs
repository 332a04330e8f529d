//! Dispatch gate: decides whether an observed file state warrants a dispatch

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::state::FileState;

/// What caused a dispatch to be claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTrigger {
    /// The non-blank line count moved. Appends, truncations and wholesale
    /// replacements are deliberately not distinguished.
    LineDelta { from: usize, to: usize },
    /// Same line count, different final record.
    Rewrite,
}

/// Outcome of running the gate against one file's tracked state.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// A dispatch was claimed. The tracked state already reflects it, so a
    /// concurrent observer of the same change lands in the cooldown.
    Dispatch {
        record: Value,
        trigger: DispatchTrigger,
    },
    /// The line count moved but no record could be extracted. The count is
    /// tracked anyway so the same unparseable tail cannot re-trigger.
    TrackedOnly { line_count: usize },
    /// Nothing effectively changed.
    Unchanged,
    /// Within the per-file cooldown window. State is untouched.
    Throttled { remaining: Duration },
}

/// Run the gate for one file.
///
/// `current_lines` and `current_last` are fresh probes of the file on disk.
/// Mutates `state` only when a dispatch is claimed or the line count is
/// brought up to date; callers run this under the tracker's per-key lock and
/// perform the actual dispatch afterwards, outside the lock.
pub fn evaluate(
    state: &mut FileState,
    current_lines: usize,
    current_last: Option<Value>,
    now: Instant,
    cooldown: Duration,
) -> GateDecision {
    // 1. Cooldown check: suppressed observations leave no trace.
    if let Some(remaining) = state.cooldown_remaining(now, cooldown) {
        return GateDecision::Throttled { remaining };
    }

    // 2. Line count moved.
    if current_lines != state.line_count {
        let from = state.line_count;
        state.line_count = current_lines;
        return match current_last {
            Some(record) => {
                state.last_record = Some(record.clone());
                state.last_dispatch = Some(now);
                GateDecision::Dispatch {
                    record,
                    trigger: DispatchTrigger::LineDelta {
                        from,
                        to: current_lines,
                    },
                }
            }
            None => GateDecision::TrackedOnly {
                line_count: current_lines,
            },
        };
    }

    // 3. Same count, different final record: in-place rewrite.
    if let Some(record) = current_last {
        if state.last_record.as_ref() != Some(&record) {
            state.last_record = Some(record.clone());
            state.last_dispatch = Some(now);
            return GateDecision::Dispatch {
                record,
                trigger: DispatchTrigger::Rewrite,
            };
        }
    }

    // 4. No-op.
    GateDecision::Unchanged
}
