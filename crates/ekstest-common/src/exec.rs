//! Subprocess execution with timeouts and process-group kill
//!
//! Every external binary (kubectl, aws, ssh, wrk, kops, eksctl, `sh -eu -c`)
//! runs through a [`CommandRunner`]. The production [`ProcessRunner`] places
//! each child in its own process group and, when the per-call timeout expires,
//! sends SIGKILL to the negative PID so shell-forked grandchildren die too.
//! Tests substitute scripted runners behind the same trait.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::{Error, Result, COMMAND_OUTPUT_PREVIEW};

/// Default per-call timeout for short cluster-API and provider commands
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A fully described subprocess invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Executable name or path
    pub program: String,
    /// Arguments, not shell-interpreted
    pub args: Vec<String>,
    /// Data written to the child's stdin, if any
    pub stdin: Option<String>,
    /// Extra environment variables for the child
    pub env: Vec<(String, String)>,
    /// Wall-clock budget before the process group is killed
    pub timeout: Duration,
}

impl CommandSpec {
    /// Create a spec with the default timeout
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            env: Vec::new(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    /// Run a script under a POSIX shell that fails on the first error
    /// and on undefined variables
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-eu").arg("-c").arg(script)
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed data on stdin
    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Add several environment variables
    pub fn envs<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(vars);
        self
    }

    /// Override the timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns true if any argument equals `needle`
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished subprocess
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal
    pub code: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the process exited with status 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        format!("{}{}", self.stdout, self.stderr)
    }

    /// Convert a non-zero exit into [`Error::Command`]
    ///
    /// Only the first bytes of the combined output are surfaced unless
    /// `debug` is set.
    pub fn check(self, spec: &CommandSpec, debug: bool) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let combined = self.combined();
        let message = if debug {
            combined
        } else {
            preview(&combined, COMMAND_OUTPUT_PREVIEW).to_string()
        };
        Err(Error::command(
            spec.to_string(),
            format!("exit {:?}: {}", self.code, message),
        ))
    }
}

/// First `max` bytes of `s`, cut back to a char boundary
pub fn preview(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Executes subprocesses
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion or until its timeout expires
    ///
    /// A non-zero exit is not an error here; callers decide with
    /// [`CommandOutput::check`]. Spawn failures and timeouts are errors.
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput>;
}

/// Runs real processes, each in its own process group
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec, timeout_secs = spec.timeout.as_secs(), "running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::command(spec.to_string(), format!("failed to spawn: {}", e)))?;
        let pid = child.id();

        if let (Some(data), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(data.as_bytes()).await {
                    warn!(error = %e, "failed to write child stdin");
                }
            });
        }

        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(Error::command(
                spec.to_string(),
                format!("failed to wait: {}", e),
            )),
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                Err(Error::command(
                    spec.to_string(),
                    format!("timed out after {:?}", spec.timeout),
                ))
            }
        }
    }
}

/// SIGKILL the whole process group led by `pid`
pub fn kill_process_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match kill(Pid::from_raw(-raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "failed to kill process group"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // CommandSpec
    // ==========================================================================

    #[test]
    fn test_shell_spec_uses_strict_flags() {
        let spec = CommandSpec::shell("make build");
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["-eu", "-c", "make build"]);
        assert_eq!(spec.to_string(), "sh -eu -c make build");
    }

    #[test]
    fn test_builder_collects_args_env_and_stdin() {
        let spec = CommandSpec::new("kubectl")
            .arg("--kubeconfig=/tmp/kc")
            .args(["apply", "-f", "-"])
            .stdin("kind: ConfigMap")
            .env("KUBECONFIG", "/tmp/kc")
            .timeout(Duration::from_secs(10));
        assert!(spec.has_arg("apply"));
        assert_eq!(spec.stdin.as_deref(), Some("kind: ConfigMap"));
        assert_eq!(spec.env, vec![("KUBECONFIG".into(), "/tmp/kc".into())]);
        assert_eq!(spec.timeout, Duration::from_secs(10));
    }

    // ==========================================================================
    // Output handling
    // ==========================================================================

    #[test]
    fn test_check_truncates_output_outside_debug() {
        let spec = CommandSpec::new("kubectl").arg("apply");
        let out = CommandOutput::failed(1, "error: unable to recognize \"STDIN\": no matches for kind");
        let err = out.clone().check(&spec, false).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("error: unable to recognize \"ST"));
        assert!(!msg.contains("no matches"));

        let err = out.check(&spec, true).unwrap_err();
        assert!(err.to_string().contains("no matches for kind"));
    }

    #[test]
    fn test_check_passes_success_through() {
        let spec = CommandSpec::new("true");
        let out = CommandOutput::ok("fine").check(&spec, false).unwrap();
        assert_eq!(out.stdout, "fine");
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("héllo", 2), "h");
        assert_eq!(preview("short", 30), "short");
    }

    // ==========================================================================
    // Real processes
    // ==========================================================================

    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let out = ProcessRunner
            .run(CommandSpec::shell("echo out; echo err 1>&2"))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_process_runner_feeds_stdin() {
        let out = ProcessRunner
            .run(CommandSpec::new("cat").stdin("apiVersion: v1"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "apiVersion: v1");
    }

    #[tokio::test]
    async fn test_shell_fails_on_undefined_variable() {
        let out = ProcessRunner
            .run(CommandSpec::shell("echo $NOT_DEFINED_ANYWHERE"))
            .await
            .unwrap();
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let start = std::time::Instant::now();
        let result = ProcessRunner
            .run(CommandSpec::shell("sleep 30 & sleep 30").timeout(Duration::from_millis(200)))
            .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_command_error() {
        let err = ProcessRunner
            .run(CommandSpec::new("/nonexistent/ekstest-binary"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}
