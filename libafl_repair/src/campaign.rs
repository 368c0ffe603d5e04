//! Fuzz campaign lifecycle: one engine child per call, always torn down.

use core::time::Duration;
use std::{
    fs::{self, File},
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use wait_timeout::ChildExt;

use crate::{
    corpus::CrashCorpus,
    process::tail,
    target::{InputMode, Target},
    Error, DEFAULT_GRACE_PERIOD_MS,
};

/// Name of the file the engine's stdout and stderr are written to
pub const ENGINE_LOG: &str = "engine.log";
/// Lines of the engine log attached to a startup failure
const LOG_TAIL_LINES: usize = 20;

/// Builds the command line of a fuzz engine
pub trait FuzzEngine {
    /// The command that fuzzes `binary`, reading seeds from `seeds` and
    /// writing its findings below `out`.
    fn command(&self, binary: &Path, mode: InputMode, seeds: &Path, out: &Path) -> Command;
}

/// Runs AFL++'s `afl-fuzz`
#[derive(Debug, Clone)]
pub struct AflFuzzEngine {
    afl_fuzz: PathBuf,
    exec_timeout_ms: Option<u64>,
    extra_args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl AflFuzzEngine {
    /// Uses `afl-fuzz` from `$PATH`
    pub fn new() -> Result<Self, Error> {
        Ok(Self::with_afl_fuzz(which::which("afl-fuzz")?))
    }

    /// Uses the given `afl-fuzz` binary
    #[must_use]
    pub fn with_afl_fuzz(afl_fuzz: PathBuf) -> Self {
        let envs = [
            ("AFL_NO_UI", "1"),
            ("AFL_SKIP_CPUFREQ", "1"),
            ("AFL_I_DONT_CARE_ABOUT_MISSING_CRASHES", "1"),
            ("AFL_IGNORE_SEED_PROBLEMS", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            afl_fuzz,
            exec_timeout_ms: None,
            extra_args: vec![],
            envs,
        }
    }

    /// Per-execution timeout passed as `-t`
    #[must_use]
    pub fn exec_timeout_ms(mut self, timeout: Option<u64>) -> Self {
        self.exec_timeout_ms = timeout;
        self
    }

    /// Adds an argument placed before the `--` separator
    #[must_use]
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Sets (or overrides) an environment variable for the engine
    #[must_use]
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        let key = key.into();
        self.envs.retain(|(k, _)| *k != key);
        self.envs.push((key, value.into()));
        self
    }
}

impl FuzzEngine for AflFuzzEngine {
    fn command(&self, binary: &Path, mode: InputMode, seeds: &Path, out: &Path) -> Command {
        let mut cmd = Command::new(&self.afl_fuzz);
        cmd.arg("-i").arg(seeds).arg("-o").arg(out);
        if let Some(timeout) = self.exec_timeout_ms {
            cmd.arg("-t").arg(timeout.to_string());
        }
        cmd.args(&self.extra_args).arg("--").arg(binary);
        // stdin delivery needs no token at all
        if mode == InputMode::FileArg {
            cmd.arg(mode.token());
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Checks that `binary` looks like something we can fuzz
pub fn check_binary(binary: &Path) -> Result<(), Error> {
    log::debug!("Validating target binary {}", binary.display());
    let metadata = binary.metadata().map_err(|err| {
        Error::setup(format!("Program '{}' not found: {err}", binary.display()))
    })?;
    let is_reg = binary.is_file();
    let is_executable = metadata.permissions().mode() & 0o111 != 0;
    if !is_reg || !is_executable || metadata.len() < 4 {
        return Err(Error::setup(format!(
            "Program '{}' not found or not executable",
            binary.display()
        )));
    }
    Ok(())
}

/// Runs fuzz campaigns and hands back what they found
pub trait Campaign {
    /// Fuzzes `target.binary()` for `duration`, delivering inputs as `mode` says.
    ///
    /// Zero crashes is a normal result. An engine that cannot even start is an
    /// [`Error::Setup`].
    fn run_campaign(
        &mut self,
        target: &Target,
        mode: InputMode,
        duration: Duration,
    ) -> Result<CrashCorpus, Error>;
}

/// Owns the running engine; terminates it when dropped
#[derive(Debug)]
struct EngineChild {
    child: Child,
    teardown: Duration,
}

impl EngineChild {
    /// SIGTERM, give it `teardown` to exit, then SIGKILL
    fn terminate(&mut self) -> Result<ExitStatus, Error> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        match i32::try_from(self.child.id()) {
            Ok(pid) => kill(Pid::from_raw(pid), Signal::SIGTERM)?,
            Err(_) => self.child.kill()?,
        }
        if let Some(status) = self.child.wait_timeout(self.teardown)? {
            return Ok(status);
        }
        log::warn!(
            "Fuzz engine ignored SIGTERM for {}ms, killing it",
            self.teardown.as_millis()
        );
        // if this fails, the process most likely finished in the meantime
        drop(self.child.kill());
        Ok(self.child.wait()?)
    }
}

impl Drop for EngineChild {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            log::error!("Failed to tear down fuzz engine: {err}");
        }
    }
}

/// Runs one campaign after another, each into a fresh `campaign_NNN` directory
#[derive(Debug)]
pub struct CampaignManager<E> {
    engine: E,
    seeds_dir: PathBuf,
    work_dir: PathBuf,
    grace_period: Duration,
    teardown: Duration,
    campaigns: usize,
    crash_counts: Vec<usize>,
}

impl<E> CampaignManager<E>
where
    E: FuzzEngine,
{
    /// Creates a new manager. Campaign output directories are created below `work_dir`.
    #[must_use]
    pub fn new(engine: E, seeds_dir: PathBuf, work_dir: PathBuf) -> Self {
        Self {
            engine,
            seeds_dir,
            work_dir,
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            teardown: Duration::from_secs(5),
            campaigns: 0,
            crash_counts: vec![],
        }
    }

    /// How long the engine gets before it is checked for an early exit
    #[must_use]
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// How long the engine gets to exit after SIGTERM
    #[must_use]
    pub fn teardown(mut self, teardown: Duration) -> Self {
        self.teardown = teardown;
        self
    }

    /// Crash counts of all finished campaigns, oldest first
    #[must_use]
    pub fn crash_counts(&self) -> &[usize] {
        &self.crash_counts
    }

    /// The directory the next campaign will write to, emptied
    fn fresh_out_dir(&mut self) -> Result<PathBuf, Error> {
        let out = self.work_dir.join(format!("campaign_{:03}", self.campaigns));
        self.campaigns += 1;
        match fs::remove_dir_all(&out) {
            Ok(()) => log::debug!("Removed stale {}", out.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => (),
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(&out)?;
        Ok(out)
    }

    fn spawn(&self, binary: &Path, mode: InputMode, out: &Path) -> Result<EngineChild, Error> {
        let log = File::create(out.join(ENGINE_LOG))?;
        let mut cmd = self.engine.command(binary, mode, &self.seeds_dir, out);
        cmd.stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        log::info!("Starting fuzz engine: {cmd:?}");
        let child = cmd
            .spawn()
            .map_err(|err| Error::setup(format!("Could not start fuzz engine: {err}")))?;
        Ok(EngineChild {
            child,
            teardown: self.teardown,
        })
    }
}

impl<E> Campaign for CampaignManager<E>
where
    E: FuzzEngine,
{
    fn run_campaign(
        &mut self,
        target: &Target,
        mode: InputMode,
        duration: Duration,
    ) -> Result<CrashCorpus, Error> {
        if duration.is_zero() {
            return Err(Error::illegal_argument("Campaign duration must be positive"));
        }
        check_binary(target.binary())?;
        if !self.seeds_dir.is_dir() {
            return Err(Error::setup(format!(
                "Seed directory {} does not exist",
                self.seeds_dir.display()
            )));
        }

        let out = self.fresh_out_dir()?;
        let mut engine = self.spawn(target.binary(), mode, &out)?;

        let grace = self.grace_period.min(duration);
        thread::sleep(grace);
        if let Some(status) = engine.child.try_wait()? {
            let log = fs::read_to_string(out.join(ENGINE_LOG)).unwrap_or_default();
            return Err(Error::setup(format!(
                "Fuzz engine exited during startup ({status}):\n{}",
                tail(log.trim_end(), LOG_TAIL_LINES)
            )));
        }

        thread::sleep(duration - grace);
        let status = engine.terminate()?;
        log::debug!("Fuzz engine finished with {status}");
        drop(engine);

        let corpus = CrashCorpus::load(&out)?;
        log::info!(
            "Campaign {} found {} crashes in {}s",
            out.display(),
            corpus.len(),
            duration.as_secs()
        );
        self.crash_counts.push(corpus.len());
        Ok(corpus)
    }
}
