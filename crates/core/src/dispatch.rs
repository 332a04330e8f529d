//! External dispatcher: hands one record to the rendering process

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Default ceiling on one generator invocation.
pub const GENERATOR_TIMEOUT: Duration = Duration::from_secs(30);

/// How one dispatch attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The generator exited with status zero.
    Completed,
    /// The generator exited with a non-zero status (`None` when killed by a
    /// signal).
    ExitFailure { code: Option<i32> },
    /// The generator ran past the timeout and was killed.
    TimedOut,
    /// The invocation never produced an exit status (spawn, IO or
    /// serialisation failure).
    Error(String),
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Completed)
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchOutcome::Completed => write!(f, "completed"),
            DispatchOutcome::ExitFailure { code: Some(code) } => {
                write!(f, "exit status {}", code)
            }
            DispatchOutcome::ExitFailure { code: None } => write!(f, "killed by signal"),
            DispatchOutcome::TimedOut => write!(f, "timed out"),
            DispatchOutcome::Error(msg) => write!(f, "{}", msg),
        }
    }
}

/// Downstream delivery seam for the engine.
///
/// The production implementation is [`Generator`]; tests substitute their
/// own sink so engine behaviour can be exercised without spawning anything.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Deliver one record extracted from `source`.
    async fn dispatch(&self, record: &Value, source: &Path) -> DispatchOutcome;
}

/// Invokes the rendering script with one record via a transient handoff
/// file.
///
/// The record is written pretty-printed to a uniquely named file next to the
/// script, the script is run as `<program> <script> --input-file <handoff>`
/// with the script's directory as working directory, and the handoff file is
/// removed afterwards (twice: once as soon as the child finishes, once as a
/// final best-effort sweep covering the timeout and error paths).
pub struct Generator {
    program: PathBuf,
    script: PathBuf,
    workdir: PathBuf,
    timeout: Duration,
    sequence: AtomicU64,
}

impl Generator {
    pub fn new(script: PathBuf) -> Self {
        let workdir = script
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            program: PathBuf::from("node"),
            script,
            workdir,
            timeout: GENERATOR_TIMEOUT,
            sequence: AtomicU64::new(0),
        }
    }

    /// Replace the interpreter the script is run with.
    pub fn with_program(mut self, program: PathBuf) -> Self {
        self.program = program;
        self
    }

    /// Replace the invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// A fresh handoff path beside the script. The millisecond timestamp
    /// plus a process-local sequence keeps concurrent dispatches apart.
    fn handoff_path(&self) -> PathBuf {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.workdir
            .join(format!("temp_data_{}_{}.json", Utc::now().timestamp_millis(), seq))
    }

    async fn invoke(&self, handoff: &Path) -> Result<std::process::Output> {
        let child = Command::new(&self.program)
            .arg(&self.script)
            .arg("--input-file")
            .arg(handoff)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?;

        child
            .wait_with_output()
            .await
            .context("Failed to collect generator output")
    }

    async fn remove_handoff(handoff: &Path) {
        match tokio::fs::remove_file(handoff).await {
            Ok(()) => debug!("Removed handoff file {}", handoff.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "Failed to remove handoff file {}: {}",
                handoff.display(),
                err
            ),
        }
    }

    async fn run(&self, record: &Value, source: &Path) -> DispatchOutcome {
        let payload = match serde_json::to_string_pretty(record) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Failed to serialize record from {}: {}", source.display(), err);
                return DispatchOutcome::Error(err.to_string());
            }
        };
        info!(
            "Dispatching record from {} ({} characters)",
            source.display(),
            payload.len()
        );

        let handoff = self.handoff_path();
        if let Err(err) = tokio::fs::write(&handoff, payload).await {
            error!(
                "Failed to write handoff file {}: {}",
                handoff.display(),
                err
            );
            // A partial write still leaves a file behind; nothing ever
            // reuses the unique name, so sweep it now.
            Self::remove_handoff(&handoff).await;
            return DispatchOutcome::Error(err.to_string());
        }

        let waited = timeout(self.timeout, self.invoke(&handoff)).await;
        // First removal, as soon as the child finishes. On timeout the
        // future was dropped (killing the child) and the sweep below picks
        // the file up instead.
        if waited.is_ok() {
            Self::remove_handoff(&handoff).await;
        }

        let outcome = match waited {
            Ok(Ok(output)) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if stdout.trim().is_empty() {
                    info!("Generator completed for {}", source.display());
                } else {
                    info!(
                        "Generator completed for {}: {}",
                        source.display(),
                        stdout.trim()
                    );
                }
                DispatchOutcome::Completed
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                error!(
                    "Generator exited with {:?} for {}: {}",
                    output.status.code(),
                    source.display(),
                    stderr.trim()
                );
                DispatchOutcome::ExitFailure {
                    code: output.status.code(),
                }
            }
            Ok(Err(err)) => {
                error!("Generator invocation failed for {}: {:#}", source.display(), err);
                DispatchOutcome::Error(format!("{err:#}"))
            }
            Err(_) => {
                error!(
                    "Generator timed out after {:?} for {}",
                    self.timeout,
                    source.display()
                );
                DispatchOutcome::TimedOut
            }
        };

        // Final best-effort sweep; nothing left here is the normal case.
        Self::remove_handoff(&handoff).await;
        outcome
    }
}

#[async_trait]
impl RecordSink for Generator {
    async fn dispatch(&self, record: &Value, source: &Path) -> DispatchOutcome {
        self.run(record, source).await
    }
}
