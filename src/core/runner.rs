//! Shell command execution for one pipeline run.
//!
//! The runner owns an explicit [`ExecutionContext`] (environment overlay plus
//! working directory). Nothing here touches the process-wide environment or
//! cwd: every spawned command receives the context explicitly.
//!
//! Commands are fire-and-continue. A nonzero exit is logged and folded into
//! [`CommandRunner::has_failure`], and the next command still runs.

use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::utils::{io, shell};

static ENV_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

static VAR_REFERENCE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

static BACKTICK_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]*)`").unwrap());

/// Environment overlay and working directory threaded through every command.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    env: BTreeMap<String, String>,
    cwd: PathBuf,
}

impl ExecutionContext {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            env: BTreeMap::new(),
            cwd: cwd.into(),
        }
    }

    /// Overlay value first, then the inherited process environment.
    pub fn var(&self, name: &str) -> Option<String> {
        self.env
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env.insert(name.into(), value.into());
    }

    pub fn overlay(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    fn shell(&self, command: &str) -> Command {
        let mut cmd = shell::combined_output_command(command);
        cmd.current_dir(&self.cwd).envs(&self.env);
        cmd
    }
}

/// One executed command as it appears in the run report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
}

impl CommandRecord {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct CommandRunner {
    context: ExecutionContext,
    transcript_file: Option<PathBuf>,
    transcript: String,
    records: Vec<CommandRecord>,
    has_failure: bool,
    echo: bool,
}

impl CommandRunner {
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            context,
            transcript_file: None,
            transcript: String::new(),
            records: Vec::new(),
            has_failure: false,
            echo: true,
        }
    }

    /// Mirror the transcript into `path` (appended, one open/close per write).
    pub fn with_transcript_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.transcript_file = Some(path.into());
        self
    }

    /// Disable console echo of the transcript.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn has_failure(&self) -> bool {
        self.has_failure
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn records(&self) -> &[CommandRecord] {
        &self.records
    }

    pub fn transcript_file(&self) -> Option<&Path> {
        self.transcript_file.as_deref()
    }

    /// Run a shell command in the current context and return its exit code.
    ///
    /// `announce` echoes the `~> command` line on the console (the transcript
    /// always records it). `report_status` logs a nonzero exit and marks the
    /// run as failed.
    pub fn run(&mut self, command: &str, announce: bool, report_status: bool) -> i32 {
        let header = format!("~> {}", command);
        if announce {
            self.echo_line(&header);
        }

        let (exit_code, raw) = match self.context.shell(command).output() {
            Ok(out) => (
                out.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&out.stdout).into_owned(),
            ),
            Err(e) => (-1, format!("Command error: {}", e)),
        };
        let output = raw.trim().to_string();

        if !output.is_empty() {
            self.echo_line(&output);
        }

        // The transcript keeps output byte for byte; the record is trimmed.
        let mut entry = header;
        entry.push('\n');
        entry.push_str(&raw);
        if !raw.is_empty() && !raw.ends_with('\n') {
            entry.push('\n');
        }

        if exit_code != 0 && report_status {
            let status = format!("Command exited with code {}", exit_code);
            self.echo_line(&status);
            entry.push_str(&status);
            entry.push('\n');
            self.has_failure = true;
        }

        entry.push('\n');
        self.append(&entry);

        self.records.push(CommandRecord {
            command: command.to_string(),
            exit_code,
            output,
        });

        exit_code
    }

    /// Run each command in order, continuing past failures.
    pub fn run_all(&mut self, commands: &[String]) {
        for command in commands {
            self.run(command, true, true);
        }
    }

    /// Apply a `NAME=VALUE` assignment to the context.
    ///
    /// `${OTHER}` references resolve against the context, then backtick
    /// sections run as commands and are replaced by their trimmed stdout.
    /// Returns the resolved value.
    pub fn put_env(&mut self, expr: &str) -> Result<String> {
        let (name, raw) = expr.split_once('=').ok_or_else(|| {
            Error::validation_invalid_argument(
                "env",
                format!("'{}' is not a NAME=VALUE assignment", expr),
                None,
                None,
            )
        })?;

        let name = name.trim();
        if !ENV_NAME_PATTERN.is_match(name) {
            return Err(Error::validation_invalid_argument(
                "env",
                format!("'{}' is not a valid environment variable name", name),
                None,
                None,
            ));
        }

        let value = self.expand(raw);
        self.set_env(name, &value);
        Ok(value)
    }

    /// Set a variable to `value` exactly, with no reference or backtick
    /// expansion. Used for values that come from outside the config file.
    pub fn set_env(&mut self, name: &str, value: &str) {
        let line = format!("~> Setting environment variable {}={}", name, value);
        self.echo_line(&line);
        self.append(&format!("{}\n\n", line));

        self.context.set_var(name, value);
    }

    /// Apply several assignments; an invalid entry is logged and skipped.
    pub fn put_env_all(&mut self, entries: &[String]) {
        for entry in entries {
            if let Err(e) = self.put_env(entry) {
                self.note(&format!("Skipping environment entry: {}", e.describe()));
                self.has_failure = true;
            }
        }
    }

    /// Change the working directory for subsequent commands.
    pub fn change_directory(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let target = self.context.resolve(path.as_ref());
        if !target.is_dir() {
            return Err(Error::internal_io(
                format!("Not a directory: {}", target.display()),
                Some("change directory".to_string()),
            ));
        }

        let line = format!("~> cd {}", target.display());
        self.echo_line(&line);
        self.append(&format!("{}\n\n", line));
        self.context.cwd = target;
        Ok(())
    }

    /// Run a command silently and return its trimmed stdout on success.
    ///
    /// Not recorded in the transcript and never affects the failure flag.
    pub fn capture(&self, command: &str) -> Option<String> {
        let out = self.context.shell(command).output().ok()?;
        if !out.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
        Some(text)
    }

    /// Add an informational line to the transcript.
    pub fn note(&mut self, message: &str) {
        self.echo_line(message);
        self.append(&format!("{}\n\n", message));
    }

    /// Record a non-command failure (a link that could not be made, ...).
    pub fn fail(&mut self, message: &str) {
        self.note(message);
        self.has_failure = true;
    }

    fn expand(&self, raw: &str) -> String {
        let with_vars = VAR_REFERENCE_PATTERN.replace_all(raw, |caps: &Captures| {
            self.context.var(&caps[1]).unwrap_or_default()
        });

        BACKTICK_PATTERN
            .replace_all(&with_vars, |caps: &Captures| {
                self.capture(&caps[1]).unwrap_or_default()
            })
            .into_owned()
    }

    fn echo_line(&self, line: &str) {
        if self.echo {
            eprintln!("{}", line);
        }
    }

    fn append(&mut self, text: &str) {
        self.transcript.push_str(text);

        if let Some(path) = &self.transcript_file {
            if let Err(e) = io::append_file(path, text, "append transcript") {
                log_status!("runner", "Transcript write failed: {}", e.describe());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn runner_in(dir: &Path) -> CommandRunner {
        CommandRunner::new(ExecutionContext::new(dir)).quiet()
    }

    #[test]
    fn run_captures_output_and_exit_code() {
        let dir = tempdir().unwrap();
        let mut runner = runner_in(dir.path());

        let code = runner.run("echo hello; echo oops >&2", true, true);

        assert_eq!(code, 0);
        assert!(!runner.has_failure());
        assert_eq!(runner.records()[0].output, "hello\noops");
        assert!(runner.transcript().starts_with("~> echo hello"));
    }

    #[test]
    fn failures_are_recorded_but_do_not_abort() {
        let dir = tempdir().unwrap();
        let mut runner = runner_in(dir.path());

        runner.run_all(&["exit 3".to_string(), "echo still-runs".to_string()]);

        assert!(runner.has_failure());
        assert_eq!(runner.records().len(), 2);
        assert_eq!(runner.records()[0].exit_code, 3);
        assert!(runner.records()[1].success());
        assert!(runner.transcript().contains("Command exited with code 3"));
    }

    #[test]
    fn unreported_failures_leave_flag_clear() {
        let dir = tempdir().unwrap();
        let mut runner = runner_in(dir.path());

        assert_eq!(runner.run("false", false, false), 1);
        assert!(!runner.has_failure());
    }

    #[test]
    fn put_env_resolves_references_and_backticks() {
        let dir = tempdir().unwrap();
        let mut runner = runner_in(dir.path());

        runner.put_env("BAR=qux").unwrap();
        let value = runner.put_env("FOO=${BAR}-`echo baz`").unwrap();

        assert_eq!(value, "qux-baz");
        assert_eq!(runner.context().var("FOO").as_deref(), Some("qux-baz"));
    }

    #[test]
    fn put_env_is_inherited_by_later_commands() {
        let dir = tempdir().unwrap();
        let mut runner = runner_in(dir.path());

        runner.put_env("DEPLOY_TARGET=staging").unwrap();
        runner.run("echo $DEPLOY_TARGET", true, true);

        assert_eq!(runner.records()[0].output, "staging");
        assert!(std::env::var("DEPLOY_TARGET").is_err());
    }

    #[test]
    fn put_env_keeps_equals_in_value_and_blanks_unknown_refs() {
        let dir = tempdir().unwrap();
        let mut runner = runner_in(dir.path());

        let value = runner
            .put_env("OPTS=a=b ${HOOKS_SURELY_UNSET_VARIABLE}")
            .unwrap();
        assert_eq!(value, "a=b ");
    }

    #[test]
    fn set_env_stores_value_literally() {
        let dir = tempdir().unwrap();
        let mut runner = runner_in(dir.path());

        runner.set_env("PULL_BRANCH", "x`touch pwned`${HOME}");
        runner.run("printf '%s' \"$PULL_BRANCH\"", true, true);

        assert_eq!(runner.records()[0].output, "x`touch pwned`${HOME}");
        assert!(!dir.path().join("pwned").exists());
    }

    #[test]
    fn transcript_keeps_untrimmed_output() {
        let dir = tempdir().unwrap();
        let mut runner = runner_in(dir.path());

        runner.run("printf '  indented\\n\\n'", true, true);

        assert_eq!(runner.records()[0].output, "indented");
        assert!(runner.transcript().contains("\n  indented\n\n"));
    }

    #[test]
    fn put_env_rejects_malformed_entries() {
        let dir = tempdir().unwrap();
        let mut runner = runner_in(dir.path());

        assert!(runner.put_env("NO_ASSIGNMENT").is_err());
        assert!(runner.put_env("1BAD=value").is_err());
    }

    #[test]
    fn change_directory_affects_relative_commands() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/marker"), "x").unwrap();
        let mut runner = runner_in(dir.path());

        runner.change_directory("sub").unwrap();
        runner.run("ls", true, true);

        assert_eq!(runner.records()[0].output, "marker");
        assert!(runner.change_directory("missing").is_err());
    }

    #[test]
    fn transcript_file_receives_every_entry() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("install.log");
        let mut runner = runner_in(dir.path()).with_transcript_file(&log);

        runner.run("echo first", true, true);
        runner.run("echo second", false, true);

        let content = std::fs::read_to_string(&log).unwrap();
        assert_eq!(content, runner.transcript());
        assert!(content.contains("~> echo first\nfirst"));
        assert!(content.contains("~> echo second\nsecond"));
    }
}
