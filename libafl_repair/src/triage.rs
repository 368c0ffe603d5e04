//! Crash triage: turn the first few crashing inputs into stack traces.
//!
//! Triage is best-effort. An input that does not crash again, an extractor that
//! times out or a trace that comes back empty all end up as an explicit
//! "no backtrace" result, never as a dropped record or an error.

use core::{hash::BuildHasher, time::Duration};
use std::{
    path::{Path, PathBuf},
    process::Command,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    corpus::{CrashCorpus, CrashRecord},
    process::run_captured,
    target::InputMode,
    Error,
};

/// What the prompt shows for a crash we could not explain
pub const NO_BACKTRACE: &str = "<no backtrace>";

/// Default time a single extractor run may take
pub const DEFAULT_EXTRACTOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Sanitizer settings for re-running a crashing input
const ASAN_OPTIONS: &str = "abort_on_error=1:symbolize=1:detect_leaks=0";

/// Produces a textual backtrace for one crashing input
pub trait StackTraceExtractor {
    /// Runs `binary` on `input`, delivered the way `mode` says, and returns the
    /// captured trace. An empty string means "no backtrace".
    fn extract(&mut self, binary: &Path, input: &Path, mode: InputMode) -> Result<String, Error>;
}

/// One triaged crash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageResult {
    record: CrashRecord,
    backtrace: Option<String>,
}

impl TriageResult {
    /// A crash with a usable trace. Blank traces become [`TriageResult::missing`].
    #[must_use]
    pub fn with_backtrace(record: CrashRecord, backtrace: String) -> Self {
        if backtrace.trim().is_empty() {
            Self::missing(record)
        } else {
            Self {
                record,
                backtrace: Some(backtrace),
            }
        }
    }

    /// Keeps `backtrace` as given, even when a budget cut it down to nothing
    pub(crate) fn with_cut_backtrace(record: CrashRecord, backtrace: String) -> Self {
        Self {
            record,
            backtrace: Some(backtrace),
        }
    }

    /// A crash we have the input for, but could not explain
    #[must_use]
    pub fn missing(record: CrashRecord) -> Self {
        Self {
            record,
            backtrace: None,
        }
    }

    /// The crashing input
    #[must_use]
    pub fn record(&self) -> &CrashRecord {
        &self.record
    }

    /// The trace, or `None` for the "no backtrace" marker
    #[must_use]
    pub fn backtrace(&self) -> Option<&str> {
        self.backtrace.as_deref()
    }

    /// The trace as it should appear in a prompt
    #[must_use]
    pub fn evidence(&self) -> &str {
        self.backtrace.as_deref().unwrap_or(NO_BACKTRACE)
    }

    /// Address-insensitive hash of the trace, to spot crashes in the same place
    #[must_use]
    pub fn hash(&self) -> Option<u64> {
        self.backtrace.as_deref().map(hash_frames)
    }
}

/// Hashes the frames of a trace, ignoring addresses so ASLR does not split buckets
#[must_use]
pub fn hash_frames(trace: &str) -> u64 {
    let addr = Regex::new(r"0x[0-9a-fA-F]+").unwrap();
    let normalized = addr.replace_all(trace, "");
    ahash::RandomState::with_seeds(0, 0, 0, 0).hash_one(normalized.as_ref())
}

/// Keeps the `#N ...` frame lines of gdb or sanitizer output
#[must_use]
pub fn extract_frames(output: &str) -> String {
    let frame = Regex::new(r"^\s*#\d+\s+\S").unwrap();
    output
        .lines()
        .filter(|line| frame.is_match(line))
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Triage the `limit` earliest crashes of `corpus`.
///
/// `mode` must be the mode the campaign ran with, or the traces describe a
/// different execution than the one that crashed.
pub fn triage<X>(
    extractor: &mut X,
    binary: &Path,
    mode: InputMode,
    corpus: &CrashCorpus,
    limit: usize,
) -> Vec<TriageResult>
where
    X: StackTraceExtractor + ?Sized,
{
    let results = corpus
        .first(limit)
        .iter()
        .map(|record| match extractor.extract(binary, record.path(), mode) {
            Ok(trace) => TriageResult::with_backtrace(record.clone(), trace),
            Err(err) => {
                log::warn!("No backtrace for {}: {err}", record.id());
                TriageResult::missing(record.clone())
            }
        })
        .collect::<Vec<_>>();

    let mut hashes = results.iter().filter_map(TriageResult::hash).collect::<Vec<_>>();
    hashes.sort_unstable();
    hashes.dedup();
    log::info!(
        "Triaged {}/{} crashes: {} with backtrace, {} distinct crash sites",
        results.len(),
        corpus.len(),
        results.iter().filter(|r| r.backtrace().is_some()).count(),
        hashes.len()
    );
    results
}

/// Re-runs the crash under `gdb` and collects `bt`
#[derive(Debug, Clone)]
pub struct GdbExtractor {
    gdb: PathBuf,
    timeout: Duration,
}

impl GdbExtractor {
    /// Uses `gdb` from `$PATH`
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        Ok(Self::with_gdb(which::which("gdb")?, timeout))
    }

    /// Uses the given `gdb` binary
    #[must_use]
    pub fn with_gdb(gdb: PathBuf, timeout: Duration) -> Self {
        Self { gdb, timeout }
    }

    fn command(&self, binary: &Path, input: &Path, mode: InputMode) -> Command {
        let mut cmd = Command::new(&self.gdb);
        cmd.args(["-q", "-batch", "-nx", "-ex", "set pagination off"])
            .env("ASAN_OPTIONS", ASAN_OPTIONS);
        match mode {
            InputMode::Stdin => {
                cmd.arg("-ex")
                    .arg(format!("run < '{}'", input.display()))
                    .args(["-ex", "bt"])
                    .arg(binary);
            }
            InputMode::FileArg => {
                cmd.args(["-ex", "run", "-ex", "bt", "--args"])
                    .arg(binary)
                    .arg(input);
            }
        }
        cmd
    }
}

impl StackTraceExtractor for GdbExtractor {
    fn extract(&mut self, binary: &Path, input: &Path, mode: InputMode) -> Result<String, Error> {
        let mut cmd = self.command(binary, input, mode);
        log::debug!("Extracting backtrace: {cmd:?}");
        let captured = run_captured(&mut cmd, None, self.timeout)?;
        Ok(extract_frames(&captured.stdout))
    }
}

/// Re-runs the crash natively and keeps the sanitizer's stack from stderr.
///
/// Only useful for binaries built with `-fsanitize=address` or similar.
#[derive(Debug, Clone)]
pub struct SanitizerExtractor {
    timeout: Duration,
}

impl SanitizerExtractor {
    /// Creates a new [`SanitizerExtractor`]
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl StackTraceExtractor for SanitizerExtractor {
    fn extract(&mut self, binary: &Path, input: &Path, mode: InputMode) -> Result<String, Error> {
        let mut cmd = Command::new(binary);
        cmd.env("ASAN_OPTIONS", ASAN_OPTIONS);
        let stdin = match mode {
            InputMode::Stdin => Some(input),
            InputMode::FileArg => {
                cmd.arg(input);
                None
            }
        };
        let captured = run_captured(&mut cmd, stdin, self.timeout)?;
        if captured.status.success() {
            return Ok(String::new());
        }
        Ok(extract_frames(&captured.stderr))
    }
}

/// Whichever extractor the configuration picked
#[derive(Debug, Clone)]
pub enum AnyExtractor {
    /// Backtraces from `gdb`
    Gdb(GdbExtractor),
    /// Backtraces from the sanitizer report
    Sanitizer(SanitizerExtractor),
}

impl StackTraceExtractor for AnyExtractor {
    fn extract(&mut self, binary: &Path, input: &Path, mode: InputMode) -> Result<String, Error> {
        match self {
            Self::Gdb(gdb) => gdb.extract(binary, input, mode),
            Self::Sanitizer(sanitizer) => sanitizer.extract(binary, input, mode),
        }
    }
}
