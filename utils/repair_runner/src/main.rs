/*!
 * # `repair_runner`
 *
 * Fuzz a C/C++ program with `afl-fuzz`, triage its crashes and ask a
 * completion endpoint for patches until a campaign comes back clean.
 */
#![warn(clippy::cargo)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]

use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use libafl_repair::{
    config::ExtractorKind,
    controller::{RepairLoop, RepairReport, SessionOutcome},
    seeds::LlmSeedGenerator,
    CampaignManager, Error, Language, RepairConfig,
};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(
    name = "repair_runner",
    about = "Fuzz, triage and repair crashing C/C++ programs"
)]
/// The Configuration
struct Opt {
    /// TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
    /// Directory for campaigns, builds and seeds
    #[arg(short = 'w', long)]
    work_dir: Option<PathBuf>,
    /// Seconds per fuzz campaign
    #[arg(short = 'd', long)]
    duration: Option<u64>,
    /// Repair attempts before giving up
    #[arg(short = 'n', long)]
    max_attempts: Option<usize>,
    /// Crash explainer: `gdb` or `sanitizer`
    #[arg(short = 'x', long, value_parser = parse_extractor)]
    extractor: Option<ExtractorKind>,
    /// Remove the seeds, campaigns and builds of the session when done
    #[arg(long)]
    cleanup: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Repair a single program
    Repair {
        /// The `.c` or `.cpp` file to repair
        source: PathBuf,
        /// What the program does, for seed generation
        #[arg(long)]
        description: Option<String>,
        /// Where to write the JSON report
        #[arg(short = 'r', long)]
        report: Option<PathBuf>,
    },
    /// Repair every C/C++ program in a directory, one after another
    Batch {
        /// Directory holding the programs
        dir: PathBuf,
        /// Where to write one JSON report per program, plus a summary
        #[arg(short = 'r', long, default_value = "reports")]
        report_dir: PathBuf,
    },
}

fn parse_extractor(s: &str) -> Result<ExtractorKind, String> {
    match s {
        "gdb" => Ok(ExtractorKind::Gdb),
        "sanitizer" | "asan" => Ok(ExtractorKind::Sanitizer),
        other => Err(format!("unknown extractor `{other}`, expected `gdb` or `sanitizer`")),
    }
}

#[derive(Debug, Serialize)]
struct SummaryEntry {
    name: String,
    state: &'static str,
    iteration: Option<usize>,
    attempts: usize,
    seed_fallback: bool,
}

impl From<&RepairReport> for SummaryEntry {
    fn from(report: &RepairReport) -> Self {
        let (state, iteration) = match &report.outcome {
            SessionOutcome::Succeeded { iteration, .. } => ("SUCCEEDED", Some(*iteration)),
            SessionOutcome::Failed => ("FAILED", None),
            SessionOutcome::Fatal { .. } => ("FATAL", None),
        };
        Self {
            name: report.name.clone(),
            state,
            iteration,
            attempts: report.attempts.len(),
            seed_fallback: report.seed_fallback,
        }
    }
}

fn load_config(opt: &Opt) -> Result<RepairConfig, Error> {
    let mut config = match &opt.config {
        Some(path) => RepairConfig::from_toml_file(path)?,
        None => RepairConfig::default(),
    };
    if let Some(work_dir) = &opt.work_dir {
        config.work_dir.clone_from(work_dir);
    }
    if let Some(duration) = opt.duration {
        config.fuzz_duration_secs = duration;
    }
    if let Some(max_attempts) = opt.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(extractor) = opt.extractor {
        config.triage.extractor = extractor;
    }
    config.cleanup |= opt.cleanup;
    config.validate()?;
    Ok(config)
}

/// Wires the real tools together and runs one session
fn run_session(
    config: &RepairConfig,
    path: &Path,
    description: Option<&str>,
) -> Result<RepairReport, Error> {
    let compiler = config.compiler.compiler();
    compiler.check_toolchain()?;
    let campaign = CampaignManager::new(
        config.afl.engine()?,
        config.seeds_dir(),
        config.campaigns_dir(),
    )
    .grace_period(config.grace_period())
    .teardown(config.afl.teardown());
    let seeds = LlmSeedGenerator::new(config.proposer.proposer()?, &config.seeds.interpreter);

    let mut repair = RepairLoop::builder()
        .config(config.clone())
        .compiler(compiler)
        .campaign(campaign)
        .extractor(config.triage.extractor()?)
        .proposer(config.proposer.proposer()?)
        .seeds(seeds)
        .build();
    repair.repair_file(path, description)
}

fn target_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Unique per file in a directory: `bug.c` and `bug.cpp` must not share a work dir
fn target_key(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Never fails; anything that stops the session from starting is a FATAL report
fn repair_one(config: &RepairConfig, path: &Path, description: Option<&str>) -> RepairReport {
    run_session(config, path, description).unwrap_or_else(|err| {
        log::error!("{}: {err}", path.display());
        RepairReport::fatal(&target_name(path), err.to_string())
    })
}

/// All C/C++ sources directly inside `dir`, in name order
fn collect_targets(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut targets = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && Language::from_path(path).is_ok())
        .collect::<Vec<_>>();
    targets.sort();
    Ok(targets)
}

fn exit_code(report: &RepairReport) -> u8 {
    match report.outcome {
        SessionOutcome::Succeeded { .. } => 0,
        SessionOutcome::Failed => 1,
        SessionOutcome::Fatal { .. } => 2,
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn run(opt: &Opt) -> Result<u8, Error> {
    let config = load_config(opt)?;
    match &opt.command {
        Command::Repair {
            source,
            description,
            report,
        } => {
            let result = repair_one(&config, source, description.as_deref());
            let json = result.to_json()?;
            match report {
                Some(path) => write_json(path, &result)?,
                None => println!("{json}"),
            }
            Ok(exit_code(&result))
        }
        Command::Batch { dir, report_dir } => {
            let targets = collect_targets(dir)?;
            log::info!("Repairing {} programs from {}", targets.len(), dir.display());
            let mut summary = vec![];
            let mut worst = 0;
            for path in &targets {
                let key = target_key(path);
                let mut target_config = config.clone();
                target_config.work_dir = config.work_dir.join(&key);
                let report = repair_one(&target_config, path, None);
                write_json(&report_dir.join(format!("{key}.json")), &report)?;
                worst = worst.max(exit_code(&report));
                summary.push(SummaryEntry::from(&report));
            }
            for entry in &summary {
                println!(
                    "{:<24} {:<10} attempts: {}",
                    entry.name, entry.state, entry.attempts
                );
            }
            write_json(&report_dir.join("summary.json"), &summary)?;
            Ok(worst)
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let opt = Opt::parse();
    match run(&opt) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            log::error!("{err}");
            eprintln!("repair_runner: {err}");
            ExitCode::from(3)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use clap::Parser;
    use libafl_repair::{config::ExtractorKind, controller::RepairReport};

    use crate::{
        collect_targets, exit_code, load_config, target_key, Command, Opt, SummaryEntry,
    };

    #[test]
    fn test_collect_targets() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.c", "a.cpp", "notes.txt", "c.cc"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        fs::create_dir(dir.path().join("sub.c")).unwrap();
        let names = collect_targets(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, ["a.cpp", "b.c", "c.cc"]);
    }

    #[test]
    fn test_same_stem_gets_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bug.c"), "").unwrap();
        fs::write(dir.path().join("bug.cpp"), "").unwrap();
        let keys = collect_targets(dir.path())
            .unwrap()
            .iter()
            .map(|p| target_key(p))
            .collect::<Vec<_>>();
        assert_eq!(keys, ["bug.c", "bug.cpp"]);
    }

    #[test]
    fn test_cli_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("repair.toml");
        fs::write(&config_file, "fuzz_duration_secs = 120\nmax_attempts = 2\n").unwrap();
        let opt = Opt::parse_from([
            "repair_runner",
            "-c",
            config_file.to_str().unwrap(),
            "-d",
            "30",
            "-x",
            "sanitizer",
            "repair",
            "bug1.c",
        ]);
        let config = load_config(&opt).unwrap();
        assert_eq!(config.fuzz_duration_secs, 30);
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.triage.extractor, ExtractorKind::Sanitizer);
        assert!(matches!(opt.command, Command::Repair { .. }));
    }

    #[test]
    fn test_fatal_report_summary() {
        let report = RepairReport::fatal("bug3", "afl-fuzz not found".into());
        assert_eq!(exit_code(&report), 2);
        let entry = SummaryEntry::from(&report);
        assert_eq!(entry.state, "FATAL");
        assert_eq!(entry.attempts, 0);
    }
}
