//! Newline-delimited JSON probing and record extraction

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

/// Maximum number of characters of a malformed line echoed into the log.
const PREVIEW_CHARS: usize = 200;

/// Count the lines with non-whitespace content in `path`.
///
/// A missing file counts as zero lines. An unreadable file is logged and
/// also counts as zero, so probing never fails the caller.
pub fn count_lines(path: &Path) -> usize {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(err) => {
            warn!("Failed to open {} for line count: {}", path.display(), err);
            return 0;
        }
    };

    let mut count = 0;
    for line in BufReader::new(file).lines() {
        match line {
            Ok(line) => {
                if !line.trim().is_empty() {
                    count += 1;
                }
            }
            Err(err) => {
                warn!(
                    "Failed to read {} while counting lines: {}",
                    path.display(),
                    err
                );
                return 0;
            }
        }
    }
    count
}

/// Iterator over the JSON records of one newline-delimited file.
///
/// Blank lines are skipped. A line that fails to parse is logged with its
/// line number and a truncated preview, then skipped, so a single corrupt
/// write cannot hide the records after it.
pub struct RecordLines {
    lines: Option<Lines<BufReader<File>>>,
    path: PathBuf,
    line_no: usize,
}

impl Iterator for RecordLines {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        loop {
            let line = match self.lines.as_mut()?.next() {
                None => return None,
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    warn!(
                        "Failed to read {} past line {}: {}",
                        self.path.display(),
                        self.line_no,
                        err
                    );
                    self.lines = None;
                    return None;
                }
            };
            self.line_no += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str(trimmed) {
                Ok(value) => return Some(value),
                Err(err) => {
                    let preview: String = trimmed.chars().take(PREVIEW_CHARS).collect();
                    warn!(
                        "Skipping invalid JSON at {}:{}: {} (line starts: {})",
                        self.path.display(),
                        self.line_no,
                        err,
                        preview
                    );
                }
            }
        }
    }
}

/// Lazily read the records of `path`, one JSON value per non-blank line.
///
/// Each call re-opens the file and restarts the sequence. An absent or
/// unopenable file yields an empty iterator.
pub fn records(path: &Path) -> RecordLines {
    let lines = match File::open(path) {
        Ok(file) => Some(BufReader::new(file).lines()),
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to open {}: {}", path.display(), err);
            }
            None
        }
    };
    RecordLines {
        lines,
        path: path.to_path_buf(),
        line_no: 0,
    }
}

/// The record on the final parseable line of `path`, if any.
pub fn last_record(path: &Path) -> Option<Value> {
    records(path).last()
}
