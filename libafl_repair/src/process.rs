//! Short-lived helper processes with a deadline.
//!
//! Output goes to temporary files instead of pipes so a chatty child can never
//! block on a full pipe while we wait for it.

use std::{
    fs::File,
    io::{Read, Seek},
    path::Path,
    process::{Command, ExitStatus, Stdio},
    time::Duration,
};

use wait_timeout::ChildExt;

use crate::Error;

/// What a finished helper process left behind
#[derive(Debug)]
pub struct Captured {
    /// Exit status of the process
    pub status: ExitStatus,
    /// Everything written to stdout, lossily decoded
    pub stdout: String,
    /// Everything written to stderr, lossily decoded
    pub stderr: String,
}

/// Runs `cmd` to completion, feeding `stdin_file` (if any) and killing it after `timeout`.
pub fn run_captured(
    cmd: &mut Command,
    stdin_file: Option<&Path>,
    timeout: Duration,
) -> Result<Captured, Error> {
    let mut stdout = tempfile::tempfile()?;
    let mut stderr = tempfile::tempfile()?;

    match stdin_file {
        Some(path) => cmd.stdin(File::open(path)?),
        None => cmd.stdin(Stdio::null()),
    };
    cmd.stdout(stdout.try_clone()?).stderr(stderr.try_clone()?);

    let mut child = cmd.spawn()?;
    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            // if this fails, the process most likely finished in the meantime
            drop(child.kill());
            drop(child.wait());
            return Err(Error::timeout(format!(
                "{:?} did not finish within {}ms",
                cmd.get_program(),
                timeout.as_millis()
            )));
        }
    };

    Ok(Captured {
        status,
        stdout: read_back(&mut stdout)?,
        stderr: read_back(&mut stderr)?,
    })
}

fn read_back(file: &mut File) -> Result<String, Error> {
    file.rewind()?;
    let mut buf = vec![];
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Keeps the last `max_lines` lines of some tool output
#[must_use]
pub fn tail(text: &str, max_lines: usize) -> String {
    let lines = text.lines().collect::<Vec<_>>();
    lines[lines.len().saturating_sub(max_lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use std::{process::Command, time::Duration};

    use serial_test::serial;

    use crate::process::{run_captured, tail};

    #[test]
    #[serial]
    fn test_run_captured_output() {
        let captured = run_captured(
            Command::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(captured.status.code(), Some(3));
        assert_eq!(captured.stdout.trim(), "out");
        assert_eq!(captured.stderr.trim(), "err");
    }

    #[test]
    #[serial]
    fn test_run_captured_stdin_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        std::fs::write(&input, "from file").unwrap();
        let captured =
            run_captured(&mut Command::new("cat"), Some(&input), Duration::from_secs(5)).unwrap();
        assert_eq!(captured.stdout, "from file");
    }

    #[test]
    #[serial]
    fn test_run_captured_timeout() {
        let res = run_captured(
            Command::new("sleep").arg("10"),
            None,
            Duration::from_millis(100),
        );
        assert!(matches!(res, Err(crate::Error::Timeout(..))));
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("a\nb\nc", 2), "b\nc");
        assert_eq!(tail("a", 5), "a");
    }
}
