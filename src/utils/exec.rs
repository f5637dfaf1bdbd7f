//! Subprocesses: `git` and the documentation build engine.
//!
//! Every call spawns a fresh process. Parameters reach the child only through
//! argv and the explicit environment list, never through state shared with
//! this process.

use crate::log;
use anyhow::{Context, Result, bail};
use portable_pty::{CommandBuilder, NativePtySystem, PtySize, PtySystem};
use regex::Regex;
use std::{
    ffi::OsString,
    io::Read,
    path::Path,
    process::{Command, ExitStatus, Output},
    sync::OnceLock,
};

/// Run `git` in a directory, capturing its output.
///
/// ```ignore
/// git!(root; "ls-remote", "--heads", "--tags", "origin")?;
/// git!(target; "push", "origin", &branch)?;
/// ```
#[macro_export]
macro_rules! git {
    ($dir:expr; $($arg:expr),+ $(,)?) => {
        $crate::utils::exec::exec(
            Some(::std::path::Path::new($dir)),
            &[::std::ffi::OsString::from("git"), $(::std::ffi::OsString::from($arg)),+],
            &[],
            $crate::utils::exec::Echo::Silent,
            false,
        )
    };
}

/// What to do with the output of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    /// Keep it in the returned [`Output`] only.
    Silent,
    /// Also log stderr under the program name. Build warnings land there.
    Stderr,
}

/// Run `argv` (program first) and fail on a non-zero exit.
///
/// `env` is added on top of the inherited environment. With `pty` the child
/// gets a pseudo-terminal and its merged output is returned as stdout.
pub fn exec(
    dir: Option<&Path>,
    argv: &[OsString],
    env: &[(&str, OsString)],
    echo: Echo,
    pty: bool,
) -> Result<Output> {
    let (program, rest) = argv.split_first().context("Empty command")?;
    let name = program.to_string_lossy().into_owned();

    let output = if pty {
        run_in_pty(dir, argv, env).with_context(|| format!("Failed to run `{name}` in a pty"))?
    } else {
        let mut command = Command::new(program);
        command.args(rest).envs(env.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        command.output().with_context(|| format!("Failed to execute `{name}`"))?
    };

    if !output.status.success() {
        bail!(describe_failure(&name, &output));
    }

    if echo == Echo::Stderr {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().filter(|l| !strip_ansi(l).trim().is_empty()).collect();
        if !lines.is_empty() {
            log!(&name; "{}", lines.join("\n"));
        }
    }

    Ok(output)
}

/// Engines only color their diagnostics on a tty. The master side is drained
/// on its own thread; it reaches EOF once the master is dropped.
fn run_in_pty(dir: Option<&Path>, argv: &[OsString], env: &[(&str, OsString)]) -> Result<Output> {
    let mut builder = CommandBuilder::from_argv(argv.to_vec());
    for (key, value) in env {
        builder.env(key, value);
    }
    if let Some(dir) = dir {
        builder.cwd(dir);
    }

    let pair = NativePtySystem::default().openpty(PtySize {
        rows: 24,
        cols: 120,
        pixel_width: 0,
        pixel_height: 0,
    })?;
    let mut child = pair.slave.spawn_command(builder)?;
    drop(pair.slave);

    let mut reader = pair.master.try_clone_reader()?;
    let drain = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    });

    let status = child.wait()?;
    drop(pair.master);
    let stdout = drain
        .join()
        .map_err(|_| anyhow::anyhow!("pty reader thread panicked"))?;

    Ok(Output {
        status: exit_status(status.exit_code()),
        stdout,
        stderr: Vec::new(),
    })
}

#[cfg(unix)]
fn exit_status(code: u32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw((code as i32) << 8)
}

#[cfg(windows)]
fn exit_status(code: u32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    ExitStatus::from_raw(code)
}

fn strip_ansi(s: &str) -> std::borrow::Cow<'_, str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid ansi regex"));
    re.replace_all(s, "")
}

/// Exit status plus whatever the program printed, colors removed.
///
/// `git` reports on stderr. Sphinx prints some errors to stdout, so it is
/// appended too.
fn describe_failure(name: &str, output: &Output) -> String {
    let mut msg = format!("Command `{name}` failed with {}", output.status);
    for stream in [&output.stderr, &output.stdout] {
        let text = String::from_utf8_lossy(stream);
        let text = strip_ansi(text.trim());
        if !text.is_empty() {
            msg.push('\n');
            msg.push_str(&text);
        }
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_empty_command() {
        assert!(exec(None, &[], &[], Echo::Silent, false).is_err());
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[31mRed\x1b[0m"), "Red");
        assert_eq!(strip_ansi("\x1b[1;32mGreen Bold\x1b[0m"), "Green Bold");
        assert_eq!(strip_ansi("Plain text"), "Plain text");
    }

    #[cfg(unix)]
    #[test]
    fn test_passes_env_and_keeps_empty_args() {
        let env = [("VERSIONDOCS_CURRENT_VERSION", OsString::from("v1.0"))];
        let output = exec(
            None,
            &argv(&["sh", "-c", r#"printf '%s|%s|%s' "$VERSIONDOCS_CURRENT_VERSION" "$1" "$2""#, "sh", "", "x"]),
            &env,
            Echo::Silent,
            false,
        )
        .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "v1.0||x");
    }

    #[cfg(unix)]
    #[test]
    fn test_failure_reports_output() {
        let err = exec(
            None,
            &argv(&["sh", "-c", "echo 'fatal: no remote' >&2; echo 'Sphinx error' ; exit 3"]),
            &[],
            Echo::Silent,
            false,
        )
        .unwrap_err()
        .to_string();
        assert!(err.starts_with("Command `sh` failed with"));
        assert!(err.contains("fatal: no remote"));
        assert!(err.contains("Sphinx error"));
    }

    #[cfg(unix)]
    #[test]
    fn test_runs_in_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = exec(Some(dir.path()), &argv(&["pwd"]), &[], Echo::Stderr, false).unwrap();
        let printed = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        assert_eq!(
            std::fs::canonicalize(printed).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_git_macro() {
        if which::which("git").is_err() {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let output = git!(dir.path(); "--version").unwrap();
        assert!(String::from_utf8_lossy(&output.stdout).starts_with("git version"));
    }
}
