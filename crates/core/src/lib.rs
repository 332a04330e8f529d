//! Change detection and dispatch engine for Tailcast
//!
//! This crate provides:
//! - Newline-delimited JSON probing (line counts, lazy record extraction)
//! - Per-file tracking state shared by the event and polling drivers
//! - The dispatch gate (cooldown, growth and rewrite detection)
//! - The external dispatcher (handoff file + generator invocation)
//! - The engine tying them together behind one change-handling path

pub mod dispatch;
pub mod engine;
pub mod gate;
pub mod ndjson;
pub mod state;

// Re-exports
pub use dispatch::{DispatchOutcome, Generator, RecordSink, GENERATOR_TIMEOUT};
pub use engine::{ChangeOutcome, Engine, EngineConfig};
pub use gate::{DispatchTrigger, GateDecision};
pub use state::{FileState, FileTracker};
