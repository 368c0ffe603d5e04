/*!
Welcome to `LibAFL_repair`.

Fuzz a single C/C++ target with `afl-fuzz`, triage the crashes it finds, and
drive a bounded repair loop that asks a completion endpoint for patches until
a fuzz campaign comes back clean or the retry budget is spent.

The entry point is [`controller::RepairLoop`]. Every external collaborator
(compiler, fuzz engine, stack-trace extractor, patch proposer, seed
generator) sits behind a trait so the loop can be driven without any of the
real tools installed.
*/
#![warn(clippy::cargo)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
))]

pub mod campaign;
pub mod compiler;
pub mod config;
pub mod controller;
pub mod corpus;
pub mod memory;
pub mod preprocess;
pub mod process;
pub mod proposer;
pub mod seeds;
pub mod target;
pub mod triage;

use core::{fmt, num::ParseIntError};
use std::io;

pub use campaign::{AflFuzzEngine, Campaign, CampaignManager, FuzzEngine};
pub use compiler::{BuildOutcome, CcCompiler, Compiler};
pub use config::RepairConfig;
pub use controller::{RepairLoop, RepairReport, SessionOutcome};
pub use corpus::{CrashCorpus, CrashRecord};
pub use memory::{Attempt, ConversationMemory, Outcome};
pub use proposer::{OpenAiProposer, PatchProposer, Proposal};
pub use seeds::{LlmSeedGenerator, SeedGenerator, SeedRecipe};
pub use target::{InputMode, Language, Target};
pub use triage::{GdbExtractor, SanitizerExtractor, StackTraceExtractor, TriageResult};

/// Maximum number of repair attempts per session
pub const MAX_ATTEMPTS: usize = 3;
/// Maximum number of crashes triaged per iteration
pub const TRIAGE_LIMIT: usize = 5;
/// Time the fuzz engine gets to come up before it is checked for an early exit (in ms)
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 1000;

#[cfg(feature = "errors_backtrace")]
/// Error Backtrace type when `errors_backtrace` feature is enabled (== [`backtrace::Backtrace`])
pub type ErrorBacktrace = backtrace::Backtrace;

#[cfg(not(feature = "errors_backtrace"))]
#[derive(Debug, Default)]
/// Empty struct to use when `errors_backtrace` is disabled
pub struct ErrorBacktrace {}
#[cfg(not(feature = "errors_backtrace"))]
impl ErrorBacktrace {
    /// Nop
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }
}

#[cfg(feature = "errors_backtrace")]
fn display_error_backtrace(f: &mut fmt::Formatter, err: &ErrorBacktrace) -> fmt::Result {
    write!(f, "\nBacktrace: {err:?}")
}
#[cfg(not(feature = "errors_backtrace"))]
#[allow(clippy::unnecessary_wraps)]
fn display_error_backtrace(_f: &mut fmt::Formatter, _err: &ErrorBacktrace) -> fmt::Result {
    fmt::Result::Ok(())
}

/// Main error struct for `LibAFL_repair`
#[derive(Debug)]
pub enum Error {
    /// Serialization error
    Serialize(String, ErrorBacktrace),
    /// File related error
    File(io::Error, ErrorBacktrace),
    /// You're holding it wrong
    IllegalState(String, ErrorBacktrace),
    /// The argument passed to this method or function is not valid
    IllegalArgument(String, ErrorBacktrace),
    /// The environment is broken: a tool is missing, the original target does not build,
    /// or the fuzz engine died while starting up. Never retried.
    Setup(String, ErrorBacktrace),
    /// The completion endpoint could not be reached or answered with garbage
    Transport(String, ErrorBacktrace),
    /// An external process did not finish in time
    Timeout(String, ErrorBacktrace),
    /// Something else happened
    Unknown(String, ErrorBacktrace),
}

impl Error {
    /// Serialization error
    #[must_use]
    pub fn serialize<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Serialize(arg.into(), ErrorBacktrace::new())
    }
    /// File related error
    #[must_use]
    pub fn file(arg: io::Error) -> Self {
        Error::File(arg, ErrorBacktrace::new())
    }
    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into(), ErrorBacktrace::new())
    }
    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into(), ErrorBacktrace::new())
    }
    /// Fatal environment or setup problem
    #[must_use]
    pub fn setup<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Setup(arg.into(), ErrorBacktrace::new())
    }
    /// The completion endpoint failed
    #[must_use]
    pub fn transport<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Transport(arg.into(), ErrorBacktrace::new())
    }
    /// An external process timed out
    #[must_use]
    pub fn timeout<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Timeout(arg.into(), ErrorBacktrace::new())
    }
    /// Something else happened
    #[must_use]
    pub fn unknown<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unknown(arg.into(), ErrorBacktrace::new())
    }

    /// Returns `true` if this error means the session cannot continue at all
    #[must_use]
    pub fn is_setup(&self) -> bool {
        matches!(self, Self::Setup(..))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Serialize(s, b) => {
                write!(f, "Error in Serialization: `{0}`", &s)?;
                display_error_backtrace(f, b)
            }
            Self::File(err, b) => {
                write!(f, "File IO failed: {:?}", &err)?;
                display_error_backtrace(f, b)
            }
            Self::IllegalState(s, b) => {
                write!(f, "Illegal state: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::IllegalArgument(s, b) => {
                write!(f, "Illegal argument: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Setup(s, b) => {
                write!(f, "Setup failed: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Transport(s, b) => {
                write!(f, "Transport error: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Timeout(s, b) => {
                write!(f, "Timed out: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Unknown(s, b) => {
                write!(f, "Unknown error: {0}", &s)?;
                display_error_backtrace(f, b)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Self::File(err, _) = self {
            Some(err)
        } else {
            None
        }
    }
}

/// Create a repair Error from io Error
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::file(err)
    }
}

/// Stringify the json serializer error
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialize(format!("{err:?}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::serialize(format!("Invalid configuration: {err}"))
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::serialize(format!("{err:?}"))
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, response) => {
                let body = response.into_string().unwrap_or_default();
                Self::transport(format!("endpoint answered {code}: {body}"))
            }
            ureq::Error::Transport(transport) => Self::transport(format!("{transport}")),
        }
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Self::illegal_argument(format!("Invalid regex: {err}"))
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::unknown(format!("Unix error: {err:?}"))
    }
}

impl From<which::Error> for Error {
    fn from(err: which::Error) -> Self {
        Self::setup(format!("Tool not found: {err}"))
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Self::unknown(format!("Failed to parse Int: {err:?}"))
    }
}
