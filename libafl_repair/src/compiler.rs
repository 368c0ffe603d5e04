//! Compiler wrapper used to build the original target and every patch

use core::time::Duration;
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Command,
};

use crate::{
    process::{run_captured, tail},
    target::Language,
    Error,
};

/// File name of the source written for each build
pub const SOURCE_STEM: &str = "target";
/// File name of the binary produced by each build
pub const BINARY_NAME: &str = "target_bin";
/// Lines of compiler output kept when a build fails
const DIAGNOSTIC_LINES: usize = 40;

/// Result of building one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The binary at this path is ready to fuzz
    Built(PathBuf),
    /// The source did not compile; the diagnostics go back to the proposer
    Failed {
        /// Tail of the compiler output
        diagnostics: String,
    },
}

/// Builds a source text into a binary
pub trait Compiler {
    /// Compiles `source` into `out_dir`.
    ///
    /// A source that does not compile is a [`BuildOutcome::Failed`], not an
    /// error; errors are reserved for a broken toolchain.
    fn compile(
        &mut self,
        source: &str,
        language: Language,
        out_dir: &Path,
    ) -> Result<BuildOutcome, Error>;
}

/// Wraps `cc`/`c++`-style compilers, `afl-clang-fast` by default
#[derive(Debug, Clone)]
pub struct CcCompiler {
    wrapped_cc: String,
    wrapped_cxx: String,
    optimize: bool,
    base_args: Vec<String>,
    envs: Vec<(String, String)>,
    timeout: Duration,
}

impl Default for CcCompiler {
    fn default() -> Self {
        Self::new("afl-clang-fast", "afl-clang-fast++")
    }
}

impl CcCompiler {
    /// Creates a new wrapper for the given C and C++ compilers
    #[must_use]
    pub fn new(wrapped_cc: &str, wrapped_cxx: &str) -> Self {
        Self {
            wrapped_cc: wrapped_cc.into(),
            wrapped_cxx: wrapped_cxx.into(),
            optimize: false,
            base_args: vec!["-g".into(), "-fno-omit-frame-pointer".into()],
            envs: vec![],
            timeout: Duration::from_secs(120),
        }
    }

    /// Build with `-O2` instead of `-O0`. Harder to read backtraces, faster fuzzing.
    #[must_use]
    pub fn optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    /// Adds a compiler argument
    #[must_use]
    pub fn add_arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.base_args.push(arg.into());
        self
    }

    /// Sets an environment variable for the compiler, e.g. `AFL_USE_ASAN=1`
    #[must_use]
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Maximum time a single build may take
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks that both wrapped compilers can be found
    pub fn check_toolchain(&self) -> Result<(), Error> {
        for compiler in [&self.wrapped_cc, &self.wrapped_cxx] {
            which::which(compiler)
                .map_err(|err| Error::setup(format!("Compiler `{compiler}` not found: {err}")))?;
        }
        Ok(())
    }

    /// The full command line for one build
    #[must_use]
    pub fn command(&self, language: Language, source: &Path, binary: &Path) -> Vec<String> {
        let mut args = vec![];
        match language {
            Language::C => args.push(self.wrapped_cc.clone()),
            Language::Cpp => args.push(self.wrapped_cxx.clone()),
        }
        args.extend_from_slice(&self.base_args);
        args.push(if self.optimize { "-O2" } else { "-O0" }.into());
        args.push("-o".into());
        args.push(binary.to_string_lossy().into_owned());
        args.push(source.to_string_lossy().into_owned());
        if language == Language::C {
            // the sample targets use libm freely
            args.push("-lm".into());
        }
        args
    }
}

impl Compiler for CcCompiler {
    fn compile(
        &mut self,
        source: &str,
        language: Language,
        out_dir: &Path,
    ) -> Result<BuildOutcome, Error> {
        fs::create_dir_all(out_dir)?;
        let source_path = out_dir.join(format!("{SOURCE_STEM}.{}", language.extension()));
        let binary = out_dir.join(BINARY_NAME);
        fs::write(&source_path, source)?;
        // never let a stale artifact pass for a fresh build
        match fs::remove_file(&binary) {
            Ok(()) => (),
            Err(err) if err.kind() == io::ErrorKind::NotFound => (),
            Err(err) => return Err(err.into()),
        }

        let args = self.command(language, &source_path, &binary);
        log::debug!("Compiling: {}", args.join(" "));
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]).current_dir(out_dir);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let captured = match run_captured(&mut cmd, None, self.timeout) {
            Ok(captured) => captured,
            Err(Error::File(err, _)) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::setup(format!("Compiler `{}` not found", args[0])));
            }
            Err(Error::Timeout(msg, _)) => {
                log::info!("Build timed out");
                return Ok(BuildOutcome::Failed { diagnostics: msg });
            }
            Err(err) => return Err(err),
        };

        if captured.status.success() && binary.is_file() {
            log::info!("Built {}", binary.display());
            Ok(BuildOutcome::Built(binary))
        } else {
            let output = format!("{}{}", captured.stdout, captured.stderr);
            log::info!("Build failed with {}", captured.status);
            Ok(BuildOutcome::Failed {
                diagnostics: tail(output.trim(), DIAGNOSTIC_LINES),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt, path::Path, time::Duration};

    use serial_test::serial;

    use crate::{
        compiler::{BuildOutcome, CcCompiler, Compiler, BINARY_NAME},
        target::Language,
        Error,
    };

    #[test]
    fn test_command_picks_compiler_by_language() {
        let cc = CcCompiler::new("my-cc", "my-cxx").add_arg("-fsanitize=address");
        let c = cc.command(Language::C, Path::new("t.c"), Path::new("bin"));
        assert_eq!(c[0], "my-cc");
        assert!(c.contains(&"-fsanitize=address".to_string()));
        assert!(c.contains(&"-O0".to_string()));
        let cpp = cc.optimize(true).command(Language::Cpp, Path::new("t.cpp"), Path::new("bin"));
        assert_eq!(cpp[0], "my-cxx");
        assert!(cpp.contains(&"-O2".to_string()));
        assert!(!cpp.contains(&"-lm".to_string()));
    }

    /// A stand-in compiler: "compiles" by copying, fails on `#error`
    fn fake_cc(dir: &Path) -> String {
        let script = dir.join("fake-cc");
        fs::write(
            &script,
            "#!/bin/sh\n\
             while [ $# -gt 0 ]; do case \"$1\" in -o) out=\"$2\"; shift;; *.c) src=\"$1\";; esac; shift; done\n\
             if grep -q '#error' \"$src\"; then echo \"$src:1: error: boom\" >&2; exit 1; fi\n\
             if grep -q 'SLOW' \"$src\"; then sleep 5; fi\n\
             cp \"$src\" \"$out\"\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().into_owned()
    }

    #[test]
    #[serial]
    fn test_compile_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cc = fake_cc(dir.path());
        let mut compiler = CcCompiler::new(&cc, &cc);

        let out = dir.path().join("build_1");
        let built = compiler.compile("int main() {}", Language::C, &out).unwrap();
        assert_eq!(built, BuildOutcome::Built(out.join(BINARY_NAME)));

        // a failed rebuild in the same place must not leave the old binary behind
        let failed = compiler.compile("#error nope", Language::C, &out).unwrap();
        match failed {
            BuildOutcome::Failed { diagnostics } => assert!(diagnostics.contains("error: boom")),
            BuildOutcome::Built(_) => panic!("expected a failed build"),
        }
        assert!(!out.join(BINARY_NAME).exists());
    }

    #[test]
    #[serial]
    fn test_hanging_compiler_is_a_failed_build() {
        let dir = tempfile::tempdir().unwrap();
        let cc = fake_cc(dir.path());
        let mut compiler = CcCompiler::new(&cc, &cc).timeout(Duration::from_millis(300));
        let out = dir.path().join("build_1");
        match compiler.compile("int SLOW;", Language::C, &out).unwrap() {
            BuildOutcome::Failed { diagnostics } => assert!(diagnostics.contains("300ms")),
            BuildOutcome::Built(_) => panic!("expected a failed build"),
        }
        assert!(!out.join(BINARY_NAME).exists());
    }

    #[test]
    #[serial]
    fn test_missing_compiler_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut compiler = CcCompiler::new("/nonexistent/cc", "/nonexistent/c++");
        let res = compiler.compile("int main() {}", Language::C, dir.path());
        assert!(matches!(res, Err(Error::Setup(..))));
        assert!(compiler.check_toolchain().is_err());
    }
}
