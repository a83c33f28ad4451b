use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// How a command came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The process exited on its own
    Exited,
    /// The process group was killed after the timeout elapsed
    TimedOut,
    /// The process group was killed because the run was cancelled
    Cancelled,
}

/// Captured result of one external command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, absent when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub termination: Termination,
    pub duration: Duration,
}

impl CommandOutput {
    /// Output of a process that exited with `code`
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            termination: Termination::Exited,
            duration: Duration::ZERO,
        }
    }

    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }
}

/// Command execution context
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Name of the command for logging
    pub command_name: Option<String>,
    /// Current working directory
    pub working_dir: Option<String>,
    /// Environment variables to set
    pub env_vars: HashMap<String, String>,
    /// Whether to create a process group
    pub process_group: bool,
    /// Capture output
    pub capture_output: bool,
    /// Log captured lines at info instead of debug
    pub stream_output: bool,
    /// Allow command to fail without returning an error
    pub allow_failure: bool,
    /// Kill the command once this much time has passed
    pub timeout: Option<Duration>,
    /// Time between SIGTERM and SIGKILL when stopping a process group
    pub kill_grace: Duration,
    /// Token checked while waiting for the command
    pub cancel: Option<CancelToken>,
}

impl Default for CommandContext {
    fn default() -> Self {
        Self {
            command_name: None,
            working_dir: None,
            env_vars: HashMap::new(),
            process_group: false,
            capture_output: false,
            stream_output: false,
            allow_failure: false,
            timeout: None,
            kill_grace: DEFAULT_KILL_GRACE,
            cancel: None,
        }
    }
}

/// Builder for CommandExecutor
pub struct CommandExecutorBuilder {
    context: CommandContext,
}

impl Default for CommandExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutorBuilder {
    /// Create a new CommandExecutorBuilder with default settings
    pub fn new() -> Self {
        Self {
            context: CommandContext::default(),
        }
    }

    /// Set whether to capture command output
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.context.capture_output = capture;
        self
    }

    /// Log every captured line at info level as it arrives
    pub fn stream_output(mut self, stream: bool) -> Self {
        self.context.stream_output = stream;
        self
    }

    /// Set the working directory
    pub fn working_dir<P: AsRef<Path>>(mut self, dir: Option<P>) -> Self {
        self.context.working_dir = dir.map(|d| d.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set whether to create a process group
    pub fn process_group(mut self, create_group: bool) -> Self {
        self.context.process_group = create_group;
        self
    }

    /// Add environment variables
    pub fn env_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.context.env_vars.extend(vars);
        self
    }

    /// Add a single environment variable
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.env_vars.insert(key.into(), value.into());
        self
    }

    /// Set whether to allow command failures without returning an error
    pub fn allow_failure(mut self, allow: bool) -> Self {
        self.context.allow_failure = allow;
        self
    }

    /// Set a name for the command for logging purposes
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.context.command_name = Some(name.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.context.timeout = timeout;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.context.kill_grace = grace;
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.context.cancel = Some(token);
        self
    }

    /// Build the CommandExecutor
    pub fn build(self) -> Result<CommandExecutor> {
        if self.context.timeout == Some(Duration::ZERO) {
            anyhow::bail!("Command timeout must be greater than zero");
        }

        Ok(CommandExecutor {
            context: self.context,
        })
    }
}

/// A unified interface for executing commands
pub struct CommandExecutor {
    context: CommandContext,
}

impl CommandExecutor {
    /// Create a builder for CommandExecutor with fluent configuration
    pub fn builder() -> CommandExecutorBuilder {
        CommandExecutorBuilder::new()
    }

    /// Run a command line through `shell -c` and wait for it to finish
    pub fn run_shell(&self, shell: &str, cmd_line: &str) -> Result<CommandOutput> {
        self.run(shell, &["-c", cmd_line])
    }

    /// Run a command and wait until it exits, times out or is cancelled
    pub fn run(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput> {
        let start = Instant::now();
        let mut child = self.launch_command(cmd, args)?;

        let label = self.format_command(cmd, args);
        let stdout_reader = child
            .stdout
            .take()
            .map(|s| drain_stream(s, label.clone(), self.context.stream_output));
        let stderr_reader = child
            .stderr
            .take()
            .map(|s| drain_stream(s, label.clone(), self.context.stream_output));

        let (mut termination, status) = self.wait_for_exit(&mut child, start)?;
        if termination == Termination::Exited {
            termination =
                self.wait_for_readers(child.id(), start, [&stdout_reader, &stderr_reader]);
        }

        // A killed group normally closes the pipes; anything that escaped it is not waited on
        let detach = termination != Termination::Exited;
        if detach {
            self.wait_for_close([&stdout_reader, &stderr_reader]);
        }
        let stdout = join_reader(stdout_reader, detach);
        let stderr = join_reader(stderr_reader, detach);
        let exit_code = status.filter(|_| !detach).and_then(|s| s.code());

        let output = CommandOutput {
            exit_code,
            stdout,
            stderr,
            termination,
            duration: start.elapsed(),
        };

        if !output.success() && !self.context.allow_failure {
            return Err(anyhow::anyhow!(
                "Command failed ({:?}) with status {}: {}\nStderr: {}",
                output.termination,
                exit_code.unwrap_or(-1),
                label,
                output.stderr
            ));
        }

        Ok(output)
    }

    /// Execute a command and launch it, returning the child process handle
    pub fn launch_command(&self, cmd: &str, args: &[&str]) -> Result<Child> {
        let command_str = self.format_command(cmd, args);
        debug!("Launching command: {}", command_str);

        let mut command = Command::new(cmd);
        command.args(args);

        // Set working directory if specified
        if let Some(dir) = &self.context.working_dir {
            command.current_dir(dir);
        }

        for (key, value) in &self.context.env_vars {
            command.env(key, value);
        }

        // Configure output capturing
        if self.context.capture_output {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        // Create process group if requested
        if self.context.process_group {
            command.process_group(0);
        }

        command
            .spawn()
            .with_context(|| format!("Failed to spawn command: {}", command_str))
    }

    /// Format command and arguments for logging
    fn format_command(&self, cmd: &str, args: &[&str]) -> String {
        if let Some(name) = &self.context.command_name {
            return name.clone();
        }

        format!("{} {}", cmd, args.join(" "))
    }

    /// Poll the child until it exits or has to be stopped
    fn wait_for_exit(
        &self,
        child: &mut Child,
        start: Instant,
    ) -> Result<(Termination, Option<ExitStatus>)> {
        loop {
            if let Some(status) = child
                .try_wait()
                .context("Failed to poll command status")?
            {
                return Ok((Termination::Exited, Some(status)));
            }

            if self.context.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                info!("Cancellation requested, stopping pid {}", child.id());
                self.terminate(child)?;
                return Ok((Termination::Cancelled, None));
            }

            if let Some(timeout) = self.context.timeout {
                if start.elapsed() >= timeout {
                    warn!(
                        "Command exceeded timeout of {}s, stopping pid {}",
                        timeout.as_secs_f64(),
                        child.id()
                    );
                    self.terminate(child)?;
                    return Ok((Termination::TimedOut, None));
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait for the output readers after the leader exited.
    ///
    /// Background children keep the pipes open, so the deadline and the cancel
    /// token still apply here. When either trips the process group is killed.
    fn wait_for_readers(
        &self,
        pid: u32,
        start: Instant,
        readers: [&Option<JoinHandle<String>>; 2],
    ) -> Termination {
        if !self.context.process_group {
            return Termination::Exited;
        }

        let pgid = pid as libc::pid_t;
        loop {
            if readers.iter().copied().flatten().all(|r| r.is_finished()) {
                return Termination::Exited;
            }

            let stop = if self.context.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                Some(Termination::Cancelled)
            } else if self.context.timeout.is_some_and(|t| start.elapsed() >= t) {
                Some(Termination::TimedOut)
            } else {
                None
            };

            if let Some(termination) = stop {
                warn!(
                    "Output of pid {} still open after it exited ({:?}), killing process group",
                    pid, termination
                );
                signal_group(pgid, libc::SIGKILL);
                return termination;
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Give readers the grace period to see EOF after their writers were killed
    fn wait_for_close(&self, readers: [&Option<JoinHandle<String>>; 2]) {
        let deadline = Instant::now() + self.context.kill_grace;
        while Instant::now() < deadline {
            if readers.iter().copied().flatten().all(|r| r.is_finished()) {
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Stop the child, and its whole process group when one was created
    fn terminate(&self, child: &mut Child) -> Result<()> {
        if self.context.process_group {
            let pgid = child.id() as libc::pid_t;
            signal_group(pgid, libc::SIGTERM);

            let deadline = Instant::now() + self.context.kill_grace;
            while Instant::now() < deadline {
                if child.try_wait()?.is_some() {
                    break;
                }
                thread::sleep(POLL_INTERVAL);
            }
            // Stragglers in the group are killed even when the leader is gone
            signal_group(pgid, libc::SIGKILL);
        } else if let Err(err) = child.kill() {
            debug!("Kill of pid {} failed: {}", child.id(), err);
        }

        child
            .wait()
            .context("Failed to reap terminated command")?;
        Ok(())
    }
}

fn signal_group(pgid: libc::pid_t, signal: libc::c_int) {
    // Negative PID addresses the whole process group
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        debug!(
            "Signal {} to process group {} failed: {}",
            signal,
            pgid,
            std::io::Error::last_os_error()
        );
    }
}

/// Read a child stream to the end on its own thread, logging each line
fn drain_stream<R: Read + Send + 'static>(
    stream: R,
    label: String,
    stream_output: bool,
) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut collected = String::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    // Tools occasionally emit invalid UTF-8; keep what is readable
                    let text = String::from_utf8_lossy(&line);
                    if stream_output {
                        info!("[{}] {}", label, text.trim_end());
                    } else {
                        debug!("[{}] {}", label, text.trim_end());
                    }
                    collected.push_str(&text);
                }
                Err(err) => {
                    debug!("Stopped reading output of {}: {}", label, err);
                    break;
                }
            }
        }
        collected
    })
}

/// Collect a reader's output. With `detach`, a reader still blocked on a pipe
/// held by an escaped process is left behind and yields nothing.
fn join_reader(reader: Option<JoinHandle<String>>, detach: bool) -> String {
    match reader {
        Some(handle) if detach && !handle.is_finished() => {
            debug!("Output reader still blocked, dropping its output");
            String::new()
        }
        Some(handle) => handle.join().unwrap_or_default(),
        None => String::new(),
    }
}

/// One external invocation requested by the pipeline runner
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    /// Stage the command belongs to, used for logging
    pub stage: &'a str,
    /// Fully substituted command line
    pub command_line: &'a str,
    pub working_dir: &'a Path,
    pub env: &'a HashMap<String, String>,
    pub timeout: Option<Duration>,
}

/// Capability to run an external command and report exit code and output
pub trait ExternalCommand {
    fn execute(&self, invocation: &Invocation<'_>, cancel: &CancelToken) -> Result<CommandOutput>;
}

/// Runs invocations as `shell -c <line>` in their own process group
#[derive(Debug, Clone)]
pub struct ShellCommand {
    shell: String,
    kill_grace: Duration,
    stream_output: bool,
}

impl Default for ShellCommand {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl ShellCommand {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            kill_grace: DEFAULT_KILL_GRACE,
            stream_output: false,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_stream_output(mut self, stream: bool) -> Self {
        self.stream_output = stream;
        self
    }
}

impl ExternalCommand for ShellCommand {
    fn execute(&self, invocation: &Invocation<'_>, cancel: &CancelToken) -> Result<CommandOutput> {
        let executor = CommandExecutor::builder()
            .name(invocation.stage)
            .working_dir(Some(invocation.working_dir))
            .env_vars(invocation.env.clone())
            .process_group(true)
            .capture_output(true)
            .stream_output(self.stream_output)
            .allow_failure(true)
            .timeout(invocation.timeout)
            .kill_grace(self.kill_grace)
            .cancel_token(cancel.clone())
            .build()?;

        debug!("[{}] $ {}", invocation.stage, invocation.command_line);
        executor.run_shell(&self.shell, invocation.command_line)
    }
}
