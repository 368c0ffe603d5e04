//! Session configuration, read from TOML and overridden from the command line

use core::time::Duration;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    campaign::AflFuzzEngine,
    compiler::CcCompiler,
    proposer::OpenAiProposer,
    triage::{AnyExtractor, GdbExtractor, SanitizerExtractor, DEFAULT_EXTRACTOR_TIMEOUT},
    Error, DEFAULT_GRACE_PERIOD_MS, MAX_ATTEMPTS, TRIAGE_LIMIT,
};

/// Fuzz engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct AflConfig {
    /// `afl-fuzz` binary, looked up in `$PATH` when not a path
    #[builder(default = "afl-fuzz".into(), setter(into))]
    pub afl_fuzz: String,
    /// Per-execution timeout (`-t`)
    #[builder(default = None, setter(strip_option))]
    pub exec_timeout_ms: Option<u64>,
    /// Extra arguments placed before `--`
    #[builder(default)]
    pub extra_args: Vec<String>,
    /// Extra environment for the engine
    #[builder(default)]
    pub env: BTreeMap<String, String>,
    /// Time the engine gets to exit after SIGTERM
    #[builder(default = 5000)]
    pub teardown_ms: u64,
}

impl Default for AflConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl AflConfig {
    /// Creates the engine, resolving `afl_fuzz` with `which`
    pub fn engine(&self) -> Result<AflFuzzEngine, Error> {
        let afl_fuzz = which::which(&self.afl_fuzz)?;
        let mut engine =
            AflFuzzEngine::with_afl_fuzz(afl_fuzz).exec_timeout_ms(self.exec_timeout_ms);
        for arg in &self.extra_args {
            engine = engine.arg(arg.as_str());
        }
        for (key, value) in &self.env {
            engine = engine.env(key.as_str(), value.as_str());
        }
        Ok(engine)
    }

    /// Time the engine gets to exit after SIGTERM
    #[must_use]
    pub fn teardown(&self) -> Duration {
        Duration::from_millis(self.teardown_ms)
    }
}

/// Compiler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct CompilerConfig {
    /// Compiler for C targets
    #[builder(default = "afl-clang-fast".into(), setter(into))]
    pub cc: String,
    /// Compiler for C++ targets
    #[builder(default = "afl-clang-fast++".into(), setter(into))]
    pub cxx: String,
    /// Extra compiler flags
    #[builder(default)]
    pub flags: Vec<String>,
    /// Build with `-O2`
    #[builder(default = false)]
    pub optimize: bool,
    /// Build with AddressSanitizer (`AFL_USE_ASAN=1`)
    #[builder(default = false)]
    pub asan: bool,
    /// Maximum time for one build
    #[builder(default = 120)]
    pub timeout_secs: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CompilerConfig {
    /// Creates the compiler wrapper
    #[must_use]
    pub fn compiler(&self) -> CcCompiler {
        let mut compiler = CcCompiler::new(&self.cc, &self.cxx)
            .optimize(self.optimize)
            .timeout(Duration::from_secs(self.timeout_secs));
        for flag in &self.flags {
            compiler = compiler.add_arg(flag.as_str());
        }
        if self.asan {
            compiler = compiler.env("AFL_USE_ASAN", "1");
        }
        compiler
    }
}

/// Which tool explains a crash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// `gdb -batch`
    #[default]
    Gdb,
    /// The sanitizer report on stderr
    Sanitizer,
}

/// Crash triage settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct TriageConfig {
    /// The extractor to use
    #[builder(default)]
    pub extractor: ExtractorKind,
    /// `gdb` binary
    #[builder(default = "gdb".into(), setter(into))]
    pub gdb: String,
    /// Maximum time for one extractor run
    #[builder(default = DEFAULT_EXTRACTOR_TIMEOUT.as_secs())]
    pub timeout_secs: u64,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TriageConfig {
    /// Creates the configured extractor
    pub fn extractor(&self) -> Result<AnyExtractor, Error> {
        let timeout = Duration::from_secs(self.timeout_secs);
        Ok(match self.extractor {
            ExtractorKind::Gdb => {
                AnyExtractor::Gdb(GdbExtractor::with_gdb(which::which(&self.gdb)?, timeout))
            }
            ExtractorKind::Sanitizer => AnyExtractor::Sanitizer(SanitizerExtractor::new(timeout)),
        })
    }
}

/// Completion endpoint settings. The key itself never lives in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct ProposerConfig {
    /// Base URL of an OpenAI-compatible API
    #[builder(default = "https://api.openai.com/v1".into(), setter(into))]
    pub base_url: String,
    /// Model name
    #[builder(default = "gpt-4o".into(), setter(into))]
    pub model: String,
    /// Environment variable holding the API key
    #[builder(default = "OPENAI_API_KEY".into(), setter(into))]
    pub api_key_env: String,
    /// Sampling temperature
    #[builder(default = 0.2)]
    pub temperature: f32,
    /// HTTP timeout
    #[builder(default = 120)]
    pub timeout_secs: u64,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ProposerConfig {
    /// Creates the proposer, reading the key from the environment
    pub fn proposer(&self) -> Result<OpenAiProposer, Error> {
        Ok(OpenAiProposer::from_env(
            &self.base_url,
            &self.model,
            &self.api_key_env,
            Duration::from_secs(self.timeout_secs),
        )?
        .temperature(self.temperature))
    }
}

/// Seed generation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct SeedConfig {
    /// Interpreter for the generator script
    #[builder(default = "python3".into(), setter(into))]
    pub interpreter: String,
    /// Maximum time the generator script may run
    #[builder(default = 30)]
    pub timeout_secs: u64,
    /// Fall back to a single minimal seed when generation fails
    #[builder(default = true)]
    pub fallback: bool,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Everything one repair session needs to know
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct RepairConfig {
    /// Where campaigns, builds and seeds go
    #[builder(default = PathBuf::from("repair_work"), setter(into))]
    pub work_dir: PathBuf,
    /// Remove `work_dir` when the session ends
    #[builder(default = false)]
    pub cleanup: bool,
    /// Repair attempts before giving up
    #[builder(default = MAX_ATTEMPTS)]
    pub max_attempts: usize,
    /// Crashes triaged per iteration
    #[builder(default = TRIAGE_LIMIT)]
    pub triage_limit: usize,
    /// Length of every fuzz campaign
    #[builder(default = 60)]
    pub fuzz_duration_secs: u64,
    /// Startup grace period of the fuzz engine
    #[builder(default = DEFAULT_GRACE_PERIOD_MS)]
    pub grace_period_ms: u64,
    /// Character budget of the conversation memory
    #[builder(default = 24000)]
    pub memory_budget: usize,
    /// Fuzz engine settings
    #[builder(default)]
    pub afl: AflConfig,
    /// Compiler settings
    #[builder(default)]
    pub compiler: CompilerConfig,
    /// Crash triage settings
    #[builder(default)]
    pub triage: TriageConfig,
    /// Completion endpoint settings
    #[builder(default)]
    pub proposer: ProposerConfig,
    /// Seed generation settings
    #[builder(default)]
    pub seeds: SeedConfig,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RepairConfig {
    /// Parses a TOML document; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Serializes back to TOML
    pub fn to_toml_string(&self) -> Result<String, Error> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects settings the repair loop cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_attempts == 0 {
            return Err(Error::illegal_argument("max_attempts must be at least 1"));
        }
        if self.triage_limit == 0 {
            return Err(Error::illegal_argument("triage_limit must be at least 1"));
        }
        if self.fuzz_duration_secs == 0 {
            return Err(Error::illegal_argument("fuzz_duration_secs must be positive"));
        }
        if self.memory_budget == 0 {
            return Err(Error::illegal_argument("memory_budget must be positive"));
        }
        Ok(())
    }

    /// Length of every fuzz campaign
    #[must_use]
    pub fn fuzz_duration(&self) -> Duration {
        Duration::from_secs(self.fuzz_duration_secs)
    }

    /// Startup grace period of the fuzz engine
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// The seed directory every campaign of the session starts from
    #[must_use]
    pub fn seeds_dir(&self) -> PathBuf {
        self.work_dir.join("seeds")
    }

    /// Parent of the `campaign_NNN` output directories
    #[must_use]
    pub fn campaigns_dir(&self) -> PathBuf {
        self.work_dir.join("campaigns")
    }

    /// Build directory of iteration `iteration`, 0 being the original program
    #[must_use]
    pub fn build_dir(&self, iteration: usize) -> PathBuf {
        self.builds_dir().join(format!("iter_{iteration:03}"))
    }

    /// Parent of the per-iteration build directories
    #[must_use]
    pub fn builds_dir(&self) -> PathBuf {
        self.work_dir.join("builds")
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::{
        config::{ExtractorKind, RepairConfig},
        Error,
    };

    #[test]
    fn test_defaults() {
        let config = RepairConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.triage_limit, 5);
        assert_eq!(config.grace_period_ms, 1000);
        assert_eq!(config.fuzz_duration_secs, 60);
        assert_eq!(config.memory_budget, 24000);
        assert_eq!(config.proposer.api_key_env, "OPENAI_API_KEY");
        assert!(config.seeds.fallback);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RepairConfig::from_toml_str(
            r#"
            fuzz_duration_secs = 300
            work_dir = "/tmp/rw"

            [afl]
            exec_timeout_ms = 500
            env = { AFL_MAP_SIZE = "65536" }

            [triage]
            extractor = "sanitizer"

            [proposer]
            model = "local-model"
            base_url = "http://localhost:8080/v1"
            "#,
        )
        .unwrap();
        assert_eq!(config.fuzz_duration_secs, 300);
        assert_eq!(config.work_dir, PathBuf::from("/tmp/rw"));
        assert_eq!(config.afl.exec_timeout_ms, Some(500));
        assert_eq!(config.afl.env["AFL_MAP_SIZE"], "65536");
        assert_eq!(config.afl.afl_fuzz, "afl-fuzz");
        assert_eq!(config.triage.extractor, ExtractorKind::Sanitizer);
        assert_eq!(config.proposer.model, "local-model");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.compiler.cc, "afl-clang-fast");
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = RepairConfig::builder()
            .work_dir("/tmp/session")
            .max_attempts(2)
            .cleanup(true)
            .build();
        let text = config.to_toml_string().unwrap();
        assert!(!text.contains("sk-"));
        assert_eq!(RepairConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(matches!(
            RepairConfig::from_toml_str("max_attempts = 0"),
            Err(Error::IllegalArgument(..))
        ));
        assert!(matches!(
            RepairConfig::from_toml_str("fuzz_duration_secs = 0"),
            Err(Error::IllegalArgument(..))
        ));
        assert!(matches!(
            RepairConfig::from_toml_str("max_attempts = \"three\""),
            Err(Error::Serialize(..))
        ));
    }
}
