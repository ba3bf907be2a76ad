//! Abstraction over external command execution for testability.
//!
//! Every external tool this crate sequences (`realm`, `sssctl`, `hostnamectl`,
//! `apt-get`, `systemctl`, ...) is invoked through the [`CommandRunner`] trait.
//!
//! # Production Usage
//!
//! [`RealCommandRunner`] delegates to [`std::process::Command`].
//!
//! # Testing Usage
//!
//! [`MockCommandRunner`] records all calls and returns canned responses, so the
//! step engine can be driven end to end against a temporary root without
//! touching the host.

use anyhow::{Context, Result};
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Output, Stdio};
use std::sync::Mutex;

/// Trait for abstracting external command execution.
pub trait CommandRunner: Send + Sync {
    /// Run a command and capture its full output (stdout + stderr + exit status).
    fn run_output(&self, program: &str, args: &[&str], options: &CommandOptions) -> Result<Output>;

    /// Run a command with `input` written to its stdin, capturing output.
    ///
    /// This is the only path by which secrets reach an external tool; they are
    /// never placed on the command line or in the environment.
    fn run_with_input(
        &self,
        program: &str,
        args: &[&str],
        options: &CommandOptions,
        input: &[u8],
    ) -> Result<Output>;
}

/// Options for command execution.
#[derive(Debug, Default, Clone)]
pub struct CommandOptions {
    /// Working directory for the command.
    pub cwd: Option<PathBuf>,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
}

impl CommandOptions {
    /// Create options with a single environment variable set.
    pub fn with_env(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            env: vec![(key.into(), value.into())],
            ..Default::default()
        }
    }

    fn apply(&self, cmd: &mut Command) {
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
    }
}

/// Production implementation that delegates to [`std::process::Command`].
pub struct RealCommandRunner;

impl CommandRunner for RealCommandRunner {
    fn run_output(&self, program: &str, args: &[&str], options: &CommandOptions) -> Result<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        options.apply(&mut cmd);
        cmd.output()
            .with_context(|| format!("Failed to run '{program}'"))
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[&str],
        options: &CommandOptions,
        input: &[u8],
    ) -> Result<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        options.apply(&mut cmd);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to run '{program}'"))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input)
                .with_context(|| format!("Failed to write stdin of '{program}'"))?;
        }
        child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for '{program}'"))
    }
}

/// Exit status helper for canned outputs.
pub fn exit_status(code: i32) -> ExitStatus {
    ExitStatus::from_raw(code << 8)
}

/// A single recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Number of stdin bytes supplied, if any. The bytes themselves are not kept.
    pub input_len: Option<usize>,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    fn matches(&self, program: &str, args_prefix: &[String]) -> bool {
        self.program == program
            && self.args.len() >= args_prefix.len()
            && self.args.iter().zip(args_prefix).all(|(a, b)| a == b)
    }
}

#[derive(Debug, Clone)]
struct CannedResponse {
    program: String,
    args_prefix: Vec<String>,
    code: i32,
    stdout: String,
    stderr: String,
    /// `None` answers forever; `Some(n)` answers `n` more times.
    remaining: Option<usize>,
}

/// Test double that records invocations and returns canned responses.
///
/// Unmatched commands succeed with empty output. One-shot responses take
/// precedence over permanent ones, in the order they were registered.
#[derive(Debug, Default)]
pub struct MockCommandRunner {
    calls: Mutex<Vec<Invocation>>,
    responses: Mutex<Vec<CannedResponse>>,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every matching call with `code` and `stdout`.
    pub fn respond(&self, program: &str, args_prefix: &[&str], code: i32, stdout: &str) {
        self.push(program, args_prefix, code, stdout, None);
    }

    /// Answer the next matching call only.
    pub fn respond_once(&self, program: &str, args_prefix: &[&str], code: i32, stdout: &str) {
        self.push(program, args_prefix, code, stdout, Some(1));
    }

    fn push(
        &self,
        program: &str,
        args_prefix: &[&str],
        code: i32,
        stdout: &str,
        remaining: Option<usize>,
    ) {
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        responses.push(CannedResponse {
            program: program.to_string(),
            args_prefix: args_prefix.iter().map(|s| s.to_string()).collect(),
            code,
            stdout: stdout.to_string(),
            stderr: String::new(),
            remaining,
        });
    }

    /// All invocations so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Invocations of `program`.
    pub fn calls_to(&self, program: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    /// Whether `program` was invoked with arguments starting with `args_prefix`.
    pub fn was_called(&self, program: &str, args_prefix: &[&str]) -> bool {
        let prefix: Vec<String> = args_prefix.iter().map(|s| s.to_string()).collect();
        self.calls().iter().any(|c| c.matches(program, &prefix))
    }

    fn answer(&self, program: &str, args: &[&str], input_len: Option<usize>) -> Output {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            input_len,
        };

        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        let once = responses.iter().position(|r| {
            matches!(r.remaining, Some(n) if n > 0) && invocation.matches(&r.program, &r.args_prefix)
        });
        let index = once.or_else(|| {
            responses
                .iter()
                .position(|r| r.remaining.is_none() && invocation.matches(&r.program, &r.args_prefix))
        });

        let output = match index {
            Some(i) => {
                let response = &mut responses[i];
                if let Some(n) = response.remaining.as_mut() {
                    *n -= 1;
                }
                Output {
                    status: exit_status(response.code),
                    stdout: response.stdout.clone().into_bytes(),
                    stderr: response.stderr.clone().into_bytes(),
                }
            }
            None => Output {
                status: exit_status(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            },
        };
        drop(responses);

        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation);
        output
    }
}

impl CommandRunner for MockCommandRunner {
    fn run_output(&self, program: &str, args: &[&str], _options: &CommandOptions) -> Result<Output> {
        Ok(self.answer(program, args, None))
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[&str],
        _options: &CommandOptions,
        input: &[u8],
    ) -> Result<Output> {
        Ok(self.answer(program, args, Some(input.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_options_default() {
        let opts = CommandOptions::default();
        assert!(opts.cwd.is_none());
        assert!(opts.env.is_empty());
    }

    #[test]
    fn test_command_options_with_env() {
        let opts = CommandOptions::with_env("DEBIAN_FRONTEND", "noninteractive");
        assert_eq!(opts.env.len(), 1);
        assert_eq!(opts.env[0].0, "DEBIAN_FRONTEND");
    }

    #[test]
    fn test_real_runner_output() {
        let runner = RealCommandRunner;
        let output = runner
            .run_output("echo", &["hello"], &CommandOptions::default())
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[test]
    fn test_real_runner_with_input() {
        let runner = RealCommandRunner;
        let output = runner
            .run_with_input("cat", &[], &CommandOptions::default(), b"secret\n")
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "secret\n");
    }

    #[test]
    fn test_exit_status_roundtrip() {
        assert!(exit_status(0).success());
        assert_eq!(exit_status(2).code(), Some(2));
    }

    #[test]
    fn test_mock_defaults_to_success() {
        let mock = MockCommandRunner::new();
        let out = mock
            .run_output("realm", &["list"], &CommandOptions::default())
            .unwrap();
        assert!(out.status.success());
        assert!(out.stdout.is_empty());
        assert!(mock.was_called("realm", &["list"]));
    }

    #[test]
    fn test_mock_once_takes_precedence() {
        let mock = MockCommandRunner::new();
        mock.respond("realm", &["join"], 0, "");
        mock.respond_once("realm", &["join"], 1, "");

        let first = mock
            .run_output("realm", &["join", "newco.local"], &CommandOptions::default())
            .unwrap()
            .status;
        let second = mock
            .run_output("realm", &["join", "newco.local"], &CommandOptions::default())
            .unwrap()
            .status;
        assert_eq!(first.code(), Some(1));
        assert!(second.success());
    }

    #[test]
    fn test_mock_records_input_length_only() {
        let mock = MockCommandRunner::new();
        mock.run_with_input("realm", &["join"], &CommandOptions::default(), b"hunter2")
            .unwrap();
        let calls = mock.calls_to("realm");
        assert_eq!(calls[0].input_len, Some(7));
        assert!(!calls[0].command_line().contains("hunter2"));
    }
}
