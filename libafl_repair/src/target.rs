//! The program under repair: its source, how it reads input, and where its binary lives

use core::{fmt, str::FromStr};
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Token handed to the fuzz engine for input delivered via `stdin`
pub const STDIN_TOKEN: &str = "@";
/// Token handed to the fuzz engine for input delivered as a file argument
pub const FILE_ARG_TOKEN: &str = "@@";

/// How to deliver input to the target.
///
/// Getting this wrong does not make the engine fail, it silently finds nothing,
/// so the mode is decided once per session and every later invocation reads it
/// from the same place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputMode {
    /// The target reads from stdin (`@`)
    #[serde(rename = "@")]
    Stdin,
    /// The target reads the file named by its first argument (`@@`)
    #[serde(rename = "@@")]
    FileArg,
}

impl InputMode {
    /// The engine's input-substitution token for this mode
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Stdin => STDIN_TOKEN,
            Self::FileArg => FILE_ARG_TOKEN,
        }
    }

    /// Guesses the mode from the source: anything touching `argv[1]` reads a file.
    #[must_use]
    pub fn infer(source: &str) -> Self {
        // `argv[1]` directly, or the usual `fopen(argv` spelling
        let re = Regex::new(r"argv\s*\[\s*1\s*\]|fopen\s*\(\s*argv").unwrap();
        if re.is_match(source) {
            Self::FileArg
        } else {
            Self::Stdin
        }
    }
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for InputMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            STDIN_TOKEN | "stdin" => Ok(Self::Stdin),
            FILE_ARG_TOKEN | "file" => Ok(Self::FileArg),
            other => Err(Error::illegal_argument(format!(
                "Unknown input mode `{other}`, expected `@` or `@@`"
            ))),
        }
    }
}

/// Source language of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Plain C
    #[default]
    C,
    /// C++
    Cpp,
}

impl Language {
    /// Detects the language from a file extension
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        match path.extension().and_then(OsStr::to_str) {
            Some("c") => Ok(Self::C),
            Some("cc" | "cpp" | "cxx" | "C") => Ok(Self::Cpp),
            _ => Err(Error::illegal_argument(format!(
                "Cannot tell the language of {}",
                path.display()
            ))),
        }
    }

    /// File extension used when writing sources of this language
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cpp => "cpp",
        }
    }

    /// Fence tags a proposer may use for a code block in this language
    #[must_use]
    pub fn fence_tags(self) -> &'static [&'static str] {
        match self {
            Self::C => &["c", "h"],
            Self::Cpp => &["cpp", "c++", "cxx", "cc"],
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::C => f.write_str("C"),
            Self::Cpp => f.write_str("C++"),
        }
    }
}

/// One compiled candidate.
///
/// Never mutated: every rebuild produces a new [`Target`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    source: String,
    input_mode: InputMode,
    binary: PathBuf,
    language: Language,
}

impl Target {
    /// Creates a new [`Target`]
    #[must_use]
    pub fn new(source: String, input_mode: InputMode, binary: PathBuf, language: Language) -> Self {
        Self {
            source,
            input_mode,
            binary,
            language,
        }
    }

    /// The source this binary was built from
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// How the binary reads its input
    #[must_use]
    pub fn input_mode(&self) -> InputMode {
        self.input_mode
    }

    /// Path of the compiled binary
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Language of the source
    #[must_use]
    pub fn language(&self) -> Language {
        self.language
    }
}
