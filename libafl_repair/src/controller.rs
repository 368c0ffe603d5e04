//! The repair loop.
//!
//! ```text
//! PREPROCESS -> GENERATE_SEEDS -> FUZZ -> TRIAGE -> PROPOSE -> REBUILD -> FUZZ ...
//!                                   |                            |          |
//!                                   +-> SUCCEEDED (no crashes)   |          +-> SUCCEEDED
//!                                                                +-> FAILED (retries spent)
//! ```
//!
//! Any setup problem (the original does not build, the engine will not start,
//! a tool is missing) ends the session as FATAL right away and costs no retry.
//! Everything else that goes wrong in an iteration is recorded as an
//! [`Attempt`] and shown to the proposer next time.

use core::{fmt, time::Duration};
use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::{
    campaign::Campaign,
    compiler::{BuildOutcome, Compiler},
    config::RepairConfig,
    corpus::CrashCorpus,
    memory::{Attempt, ConversationMemory, Outcome},
    preprocess::{leading_description, strip_comments},
    proposer::{PatchProposer, Proposal},
    seeds::{materialize, write_fallback_seed, SeedGenerator},
    target::{InputMode, Language, Target},
    triage::{triage, StackTraceExtractor, TriageResult},
    Error,
};

/// Used for seed generation when the program carries no description
const NO_DESCRIPTION: &str = "A command-line program. No description is available.";

/// States of the repair loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Strip comments and build the original
    Preprocess,
    /// Write the seed corpus and settle the input mode
    GenerateSeeds,
    /// Run a campaign against the current binary
    Fuzz,
    /// Explain the first crashes of the campaign
    Triage,
    /// Ask for a patch
    Propose,
    /// Build the patch
    Rebuild,
    /// A campaign came back clean
    Succeeded,
    /// All attempts are spent
    Failed,
    /// The session cannot go on
    Fatal,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preprocess => "PREPROCESS",
            Self::GenerateSeeds => "GENERATE_SEEDS",
            Self::Fuzz => "FUZZ",
            Self::Triage => "TRIAGE",
            Self::Propose => "PROPOSE",
            Self::Rebuild => "REBUILD",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionOutcome {
    /// A campaign found no crashes
    Succeeded {
        /// The program that survived; the original when `iteration` is 0
        patched_source: String,
        /// 0 for the original program, otherwise the attempt that fixed it
        iteration: usize,
    },
    /// Every attempt still crashed, did not build, or produced no patch
    Failed,
    /// A setup problem ended the session
    Fatal {
        /// What went wrong
        reason: String,
    },
}

/// Everything a session did, in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    /// Unique id of the session
    pub session_id: Uuid,
    /// Name of the target, usually its file stem
    pub name: String,
    /// How the session ended
    pub outcome: SessionOutcome,
    /// The input mode every campaign and triage used, once decided
    pub input_mode: Option<InputMode>,
    /// Seed generation failed and a single minimal seed was used
    pub seed_fallback: bool,
    /// Crashes found by each campaign, oldest first
    pub crash_counts: Vec<usize>,
    /// Every attempt, oldest first, never trimmed
    pub attempts: Vec<Attempt>,
}

impl RepairReport {
    fn new(name: &str) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            name: name.into(),
            outcome: SessionOutcome::Failed,
            input_mode: None,
            seed_fallback: false,
            crash_counts: vec![],
            attempts: vec![],
        }
    }

    /// A session that could not even start, e.g. because a tool is missing
    #[must_use]
    pub fn fatal(name: &str, reason: String) -> Self {
        Self {
            outcome: SessionOutcome::Fatal { reason },
            ..Self::new(name)
        }
    }

    /// `true` if the session ended with a clean campaign
    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Succeeded { .. })
    }

    /// `true` if a setup problem ended the session
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Fatal { .. })
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// The opening of every conversation
#[must_use]
pub fn problem_statement(language: Language) -> String {
    let tag = language.fence_tags()[0];
    format!(
        "The following {language} program crashes when fuzzed. Find the bugs that cause the \
         crashes and fix them without changing what the program is meant to do. \
         Answer with the complete corrected program in a single ```{tag} code block.\n\
         Earlier attempts, if any, are listed below with their outcome."
    )
}

/// Puts the rendered memory, the current source and its crashes together
#[must_use]
pub fn build_prompt(
    memory: &str,
    source: &str,
    evidence: &[TriageResult],
    language: Language,
) -> String {
    let tag = language.fence_tags()[0];
    let mut prompt = format!("{memory}\n\n## Current program\n```{tag}\n{source}\n```\n\n");
    prompt.push_str("## Crashes found by the latest campaign\n");
    if evidence.is_empty() {
        prompt.push_str("(none)\n");
    }
    for result in evidence {
        prompt.push_str(&format!("[{}]\n{}\n", result.record().id(), result.evidence()));
    }
    prompt
}

/// Drives one target from its original source to a verdict
#[derive(Debug, TypedBuilder)]
pub struct RepairLoop<C, F, X, P, G> {
    /// Session settings
    config: RepairConfig,
    /// Builds the original and every patch
    compiler: C,
    /// Runs the fuzz campaigns
    campaign: F,
    /// Explains crashes
    extractor: X,
    /// Proposes patches
    proposer: P,
    /// Writes the seed recipe
    seeds: G,
    #[builder(setter(skip), default = Phase::Preprocess)]
    phase: Phase,
}

impl<C, F, X, P, G> RepairLoop<C, F, X, P, G>
where
    C: Compiler,
    F: Campaign,
    X: StackTraceExtractor,
    P: PatchProposer,
    G: SeedGenerator,
{
    /// The state the loop is in, or ended in
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The session settings
    #[must_use]
    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    /// Repairs the program in `path`; the language follows the file extension.
    ///
    /// Fails only if the file cannot be read or its language is unknown.
    pub fn repair_file<Q: AsRef<Path>>(
        &mut self,
        path: Q,
        description: Option<&str>,
    ) -> Result<RepairReport, Error> {
        let path = path.as_ref();
        let language = Language::from_path(path)?;
        let source = fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(self.run(&name, &source, language, description))
    }

    /// Runs a whole session. Never fails: setup problems end up as
    /// [`SessionOutcome::Fatal`] in the report.
    pub fn run(
        &mut self,
        name: &str,
        original: &str,
        language: Language,
        description: Option<&str>,
    ) -> RepairReport {
        self.phase = Phase::Preprocess;
        let mut report = RepairReport::new(name);
        log::info!("Repairing {name} ({language}), session {}", report.session_id);
        report.outcome = match self.drive(&mut report, original, language, description) {
            Ok(outcome) => outcome,
            Err(err) => {
                log::error!("{name}: {err}");
                self.enter(Phase::Fatal);
                SessionOutcome::Fatal {
                    reason: err.to_string(),
                }
            }
        };

        if self.config.cleanup {
            self.cleanup();
        }
        log::info!(
            "{name}: {} after {} attempt(s)",
            self.phase,
            report.attempts.len()
        );
        report
    }

    /// Removes what the session wrote; anything else in the work dir stays
    fn cleanup(&self) {
        let dirs = [
            self.config.seeds_dir(),
            self.config.campaigns_dir(),
            self.config.builds_dir(),
        ];
        for dir in dirs.iter().filter(|dir| dir.exists()) {
            if let Err(err) = fs::remove_dir_all(dir) {
                log::warn!("Could not remove {}: {err}", dir.display());
            }
        }
        // fails, and is ignored, unless the directory is now empty
        drop(fs::remove_dir(&self.config.work_dir));
    }

    fn enter(&mut self, phase: Phase) {
        log::info!("{} -> {phase}", self.phase);
        self.phase = phase;
    }

    fn drive(
        &mut self,
        report: &mut RepairReport,
        original: &str,
        language: Language,
        description: Option<&str>,
    ) -> Result<SessionOutcome, Error> {
        let stripped = strip_comments(original);
        let binary = match self
            .compiler
            .compile(&stripped, language, &self.config.build_dir(0))?
        {
            BuildOutcome::Built(binary) => binary,
            BuildOutcome::Failed { diagnostics } => {
                return Err(Error::setup(format!(
                    "The original program does not compile:\n{diagnostics}"
                )));
            }
        };

        self.enter(Phase::GenerateSeeds);
        let description = description
            .map(str::to_string)
            .or_else(|| leading_description(original))
            .unwrap_or_else(|| NO_DESCRIPTION.into());
        let input_mode = self.prepare_seeds(report, original, &stripped, &description)?;
        report.input_mode = Some(input_mode);

        let mut current = Target::new(stripped, input_mode, binary, language);
        let corpus = self.fuzz(report, &current)?;
        if corpus.is_empty() {
            self.enter(Phase::Succeeded);
            return Ok(SessionOutcome::Succeeded {
                patched_source: original.to_string(),
                iteration: 0,
            });
        }
        let mut evidence = self.triage(&current, &corpus);

        let max_attempts = self.config.max_attempts;
        let budget = self.config.memory_budget;
        let mut memory =
            ConversationMemory::new(problem_statement(language), language, max_attempts);

        for ordinal in 1..=max_attempts {
            self.enter(Phase::Propose);
            memory.trim_to_budget(budget)?;
            let rendered = memory.render(budget)?;
            let prompt = build_prompt(&rendered, current.source(), &evidence, language);
            let response = self.proposer.propose(&prompt);
            let patch = match Proposal::from_response(response, language) {
                Proposal::Patch(patch) => patch,
                Proposal::Error(reason) => {
                    log::warn!("Attempt {ordinal}: {reason}");
                    let attempt = Attempt::new(
                        ordinal,
                        current.source().to_string(),
                        evidence.clone(),
                        None,
                        Outcome::ProposerError,
                    )
                    .with_note(format!("No usable patch: {reason}."));
                    record(report, &mut memory, attempt);
                    continue;
                }
            };

            self.enter(Phase::Rebuild);
            let build = match self
                .compiler
                .compile(&patch, language, &self.config.build_dir(ordinal))
            {
                Ok(build) => build,
                Err(err) if err.is_setup() => return Err(err),
                Err(err) => BuildOutcome::Failed {
                    diagnostics: err.to_string(),
                },
            };
            let binary = match build {
                BuildOutcome::Built(binary) => binary,
                BuildOutcome::Failed { diagnostics } => {
                    log::warn!("Attempt {ordinal}: the patch does not compile");
                    let attempt = Attempt::new(
                        ordinal,
                        current.source().to_string(),
                        evidence.clone(),
                        Some(patch),
                        Outcome::CrashesRemain,
                    )
                    .with_note(format!("The patch does not compile:\n{diagnostics}"));
                    record(report, &mut memory, attempt);
                    continue;
                }
            };

            // same input mode for the whole session
            let candidate = Target::new(patch, current.input_mode(), binary, language);
            let corpus = self.fuzz(report, &candidate)?;
            if corpus.is_empty() {
                let attempt = Attempt::new(
                    ordinal,
                    current.source().to_string(),
                    evidence,
                    Some(candidate.source().to_string()),
                    Outcome::Fixed,
                );
                record(report, &mut memory, attempt);
                self.enter(Phase::Succeeded);
                return Ok(SessionOutcome::Succeeded {
                    patched_source: candidate.source().to_string(),
                    iteration: ordinal,
                });
            }

            let attempt = Attempt::new(
                ordinal,
                current.source().to_string(),
                evidence,
                Some(candidate.source().to_string()),
                Outcome::CrashesRemain,
            )
            .with_note(format!(
                "The patched program still crashes: {} crashing input(s) found.",
                corpus.len()
            ));
            record(report, &mut memory, attempt);
            evidence = self.triage(&candidate, &corpus);
            current = candidate;
        }

        self.enter(Phase::Failed);
        Ok(SessionOutcome::Failed)
    }

    /// Generates and runs the seed recipe, falling back to one minimal seed.
    ///
    /// A declared input mode is kept even if its script fails; the mode is
    /// only guessed from `stripped` when no recipe came back at all.
    fn prepare_seeds(
        &mut self,
        report: &mut RepairReport,
        source: &str,
        stripped: &str,
        description: &str,
    ) -> Result<InputMode, Error> {
        let seeds_dir = self.config.seeds_dir();
        let timeout = Duration::from_secs(self.config.seeds.timeout_secs);
        let (declared, generated) = match self.seeds.generate(source, description) {
            Ok(recipe) => {
                let mode = recipe.input_mode;
                (
                    Some(mode),
                    materialize(&recipe, &seeds_dir, timeout).map(|_| mode),
                )
            }
            Err(err) => (None, Err(err)),
        };
        match generated {
            Ok(mode) => {
                log::info!("Seed recipe declares input mode {mode}");
                Ok(mode)
            }
            Err(err) if self.config.seeds.fallback => {
                let mode = declared.unwrap_or_else(|| InputMode::infer(stripped));
                log::warn!(
                    "Seed generation failed ({err}), using a single seed and input mode {mode}"
                );
                write_fallback_seed(&seeds_dir)?;
                report.seed_fallback = true;
                Ok(mode)
            }
            Err(err) => Err(Error::setup(format!("Seed generation failed: {err}"))),
        }
    }

    fn fuzz(&mut self, report: &mut RepairReport, target: &Target) -> Result<CrashCorpus, Error> {
        self.enter(Phase::Fuzz);
        let corpus =
            self.campaign
                .run_campaign(target, target.input_mode(), self.config.fuzz_duration())?;
        report.crash_counts.push(corpus.len());
        Ok(corpus)
    }

    fn triage(&mut self, target: &Target, corpus: &CrashCorpus) -> Vec<TriageResult> {
        self.enter(Phase::Triage);
        triage(
            &mut self.extractor,
            target.binary(),
            target.input_mode(),
            corpus,
            self.config.triage_limit,
        )
    }
}

fn record(report: &mut RepairReport, memory: &mut ConversationMemory, attempt: Attempt) {
    log::info!("Attempt {} ended as {}", attempt.ordinal(), attempt.outcome());
    memory.append(attempt.clone());
    report.attempts.push(attempt);
}
