//! The conversation memory: what the proposer is told about earlier attempts.
//!
//! Memory is an ordered log of [`Attempt`]s behind a fixed problem statement.
//! It has to fit a character budget. When it does not, whole attempts are
//! dropped oldest first, so the proposer keeps a coherent story of what failed
//! and why. The newest attempt and the problem statement are never dropped;
//! if the newest attempt alone is still too large, its embedded texts are cut
//! down, longest first. Ordinals and outcome tags are never cut.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::{target::Language, triage::TriageResult, Error};

/// Appended to any text that was cut to fit the budget
pub const TRUNCATION_MARKER: &str = "\n[... truncated ...]";

/// How an attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The patch was built and fuzzed, and still crashes, or it did not build at all
    CrashesRemain,
    /// The patched target survived a full campaign
    Fixed,
    /// The proposer gave us nothing we could use
    ProposerError,
}

impl Outcome {
    /// The tag shown to the proposer
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::CrashesRemain => "crashes_remain",
            Self::Fixed => "fixed",
            Self::ProposerError => "proposer_error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One iteration of the repair loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    ordinal: usize,
    source: String,
    evidence: Vec<TriageResult>,
    patch: Option<String>,
    outcome: Outcome,
    note: Option<String>,
}

impl Attempt {
    /// Creates a new [`Attempt`]
    #[must_use]
    pub fn new(
        ordinal: usize,
        source: String,
        evidence: Vec<TriageResult>,
        patch: Option<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            ordinal,
            source,
            evidence,
            patch,
            outcome,
            note: None,
        }
    }

    /// Attaches extra context for the next prompt, like compiler diagnostics
    #[must_use]
    pub fn with_note<S: Into<String>>(mut self, note: S) -> Self {
        self.note = Some(note.into());
        self
    }

    /// 1-based index of this attempt in the session
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// The source the proposer was shown
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The triaged crashes the proposer was shown
    #[must_use]
    pub fn evidence(&self) -> &[TriageResult] {
        &self.evidence
    }

    /// The replacement source, if the proposer produced one
    #[must_use]
    pub fn patch(&self) -> Option<&str> {
        self.patch.as_deref()
    }

    /// How this attempt ended
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Compiler diagnostics or proposer failure, if any
    #[must_use]
    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    fn render(&self, max_attempts: usize, language: Language) -> String {
        let fence = language.extension();
        let mut out = format!(
            "### Attempt {} of {}: {}\n",
            self.ordinal,
            max_attempts,
            self.outcome.tag()
        );
        out.push_str(&format!("Source presented:\n```{fence}\n{}\n```\n", self.source));
        out.push_str("Crash evidence:\n");
        if self.evidence.is_empty() {
            out.push_str("(none)\n");
        }
        for result in &self.evidence {
            out.push_str(&format!("[{}]\n{}\n", result.record().id(), result.evidence()));
        }
        match &self.patch {
            Some(patch) => out.push_str(&format!("Proposed patch:\n```{fence}\n{patch}\n```")),
            None => out.push_str("Proposed patch: (none)"),
        }
        if let Some(note) = &self.note {
            out.push_str(&format!("\nNote:\n{note}"));
        }
        out
    }

    /// Every text block of this attempt that may be cut to fit a budget
    fn cuttable_texts(&mut self) -> Vec<&mut String> {
        let mut texts = vec![&mut self.source];
        texts.extend(self.patch.as_mut());
        texts.extend(self.note.as_mut());
        texts
    }

    /// Cuts the longest block of text by (at least) `excess` characters.
    /// Returns `false` once there is nothing left to cut.
    fn cut_longest(&mut self, excess: usize) -> bool {
        // traces are cut through a temporary copy, they live inside `TriageResult`s
        let mut traces = self
            .evidence
            .iter()
            .map(|r| r.backtrace().map(str::to_string))
            .collect::<Vec<_>>();

        let longest_trace = traces
            .iter()
            .enumerate()
            .filter_map(|(idx, t)| t.as_ref().map(|t| (idx, char_len(t))))
            .max_by_key(|(_, len)| *len);
        let longest_text = self
            .cuttable_texts()
            .into_iter()
            .map(|t| char_len(t))
            .max()
            .unwrap_or(0);

        match longest_trace {
            Some((idx, len)) if len > longest_text => {
                let Some(trace) = traces[idx].take() else {
                    return false;
                };
                let cut = cut_to(&trace, len.saturating_sub(excess));
                let record = self.evidence[idx].record().clone();
                self.evidence[idx] = TriageResult::with_cut_backtrace(record, cut);
                true
            }
            _ if longest_text > 0 => {
                let mut texts = self.cuttable_texts();
                let Some(text) = texts.iter_mut().max_by_key(|t| char_len(t)) else {
                    return false;
                };
                let len = char_len(text);
                **text = cut_to(text, len.saturating_sub(excess));
                true
            }
            _ => false,
        }
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Cuts `text` to at most `max` characters, marking the cut when there is room for it
fn cut_to(text: &str, max: usize) -> String {
    if char_len(text) <= max {
        return text.to_string();
    }
    let marker = char_len(TRUNCATION_MARKER);
    if max < marker {
        return text.chars().take(max).collect();
    }
    let mut out = text.chars().take(max - marker).collect::<String>();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// How to make the memory fit a budget
#[derive(Debug)]
struct Fit {
    /// Index of the first attempt that stays
    start: usize,
    /// Replacement for the newest attempt, if it had to be cut
    newest: Option<Attempt>,
}

/// The budgeted log of attempts shown to the proposer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMemory {
    problem: String,
    language: Language,
    max_attempts: usize,
    attempts: Vec<Attempt>,
    /// Attempts already dropped by earlier trims
    omitted: usize,
}

impl ConversationMemory {
    /// Creates an empty memory behind the given problem statement
    #[must_use]
    pub fn new(problem: String, language: Language, max_attempts: usize) -> Self {
        Self {
            problem,
            language,
            max_attempts,
            attempts: vec![],
            omitted: 0,
        }
    }

    /// The problem statement, never trimmed
    #[must_use]
    pub fn problem(&self) -> &str {
        &self.problem
    }

    /// Attempts still held, oldest first
    #[must_use]
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    /// How many attempts have been dropped so far
    #[must_use]
    pub fn omitted(&self) -> usize {
        self.omitted
    }

    /// Appends an attempt as the newest entry
    pub fn append(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }

    /// Renders the memory so it fits `budget` characters, without changing it.
    ///
    /// Rendering is deterministic: same memory, same budget, same text.
    pub fn render(&self, budget: usize) -> Result<String, Error> {
        let fit = self.fit(budget)?;
        Ok(self.render_fit(&fit))
    }

    /// Drops and cuts attempts for good, until the memory renders within `budget`
    pub fn trim_to_budget(&mut self, budget: usize) -> Result<(), Error> {
        let fit = self.fit(budget)?;
        if fit.start > 0 {
            log::info!(
                "Dropping {} oldest attempt(s) from memory to fit {budget} chars",
                fit.start
            );
        }
        self.attempts.drain(..fit.start);
        self.omitted += fit.start;
        if let Some(newest) = fit.newest {
            log::info!("Cutting attempt {} to fit {budget} chars", newest.ordinal());
            if let Some(last) = self.attempts.last_mut() {
                *last = newest;
            }
        }
        Ok(())
    }

    fn render_parts<'a, I>(&self, omitted: usize, attempts: I) -> String
    where
        I: IntoIterator<Item = &'a Attempt>,
    {
        let mut out = self.problem.clone();
        if omitted > 0 {
            out.push_str(&format!(
                "\n\n({omitted} earlier attempt(s) omitted to fit the context budget)"
            ));
        }
        for attempt in attempts {
            out.push_str("\n\n");
            out.push_str(&attempt.render(self.max_attempts, self.language));
        }
        out
    }

    fn render_fit(&self, fit: &Fit) -> String {
        let omitted = self.omitted + fit.start;
        match &fit.newest {
            Some(newest) => self.render_parts(omitted, core::iter::once(newest)),
            None => self.render_parts(omitted, &self.attempts[fit.start..]),
        }
    }

    fn fit(&self, budget: usize) -> Result<Fit, Error> {
        let len = self.attempts.len();
        // drop oldest first, but always keep the newest
        for start in 0..len.max(1) {
            let fit = Fit {
                start,
                newest: None,
            };
            if char_len(&self.render_fit(&fit)) <= budget {
                return Ok(fit);
            }
        }

        let Some(newest) = self.attempts.last() else {
            return Err(Error::illegal_argument(format!(
                "The problem statement alone does not fit a budget of {budget} chars"
            )));
        };
        let start = len - 1;
        let mut newest = newest.clone();
        loop {
            let rendered = self.render_parts(self.omitted + start, core::iter::once(&newest));
            let size = char_len(&rendered);
            if size <= budget {
                return Ok(Fit {
                    start,
                    newest: Some(newest),
                });
            }
            if !newest.cut_longest(size - budget) {
                return Err(Error::illegal_argument(format!(
                    "A budget of {budget} chars cannot hold the problem statement and attempt {}",
                    newest.ordinal()
                )));
            }
        }
    }
}
