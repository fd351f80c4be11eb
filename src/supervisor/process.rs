//! Worker subprocess management.
//!
//! The supervisor talks to the worker through the `ManagedProcess` trait so
//! that platform differences stay in one place and tests can substitute a
//! scripted process.
//!
//! # Platform behavior
//!
//! - **Unix**: the worker leads its own process group. `terminate` sends
//!   SIGTERM and `kill` sends SIGKILL to the whole group, so helpers spawned
//!   by the worker go down with it.
//! - **Windows**: the worker is created in a new process group; both
//!   `terminate` and `kill` end the process.
//!
//! stdout and stderr are drained by background tasks into bounded buffers,
//! which keeps a chatty worker from blocking on a full pipe.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ProcessError;

/// How long `take_output` waits for the pipe readers to reach EOF.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Description of the worker to launch.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory; inherits the supervisor's when unset.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Maximum bytes kept per output stream.
    pub output_limit: usize,
}

impl WorkerCommand {
    /// Creates a command with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            output_limit: 4096,
        }
    }

    /// Appends arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the per-stream output limit.
    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Returns the command line for logging.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Output captured from a finished process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A running OS process owned by the supervisor.
#[async_trait]
pub trait ManagedProcess: Send {
    /// Returns the OS process id, if the process has not been reaped.
    fn pid(&self) -> Option<u32>;

    /// Returns true while the process has not exited.
    fn is_alive(&mut self) -> bool;

    /// Waits for the process to exit and returns its exit code.
    ///
    /// Cancel-safe: dropping the future leaves the process untouched. A
    /// process ended by a signal reports the negated signal number on Unix.
    async fn wait(&mut self) -> Result<Option<i32>, ProcessError>;

    /// Asks the process to exit (SIGTERM on Unix).
    async fn terminate(&mut self) -> Result<(), ProcessError>;

    /// Forces the process to exit and reaps it.
    async fn kill(&mut self) -> Result<(), ProcessError>;

    /// Returns the output captured so far and stops capturing.
    async fn take_output(&mut self) -> CapturedOutput;
}

/// Starts worker processes.
pub trait ProcessLauncher: Send + Sync {
    /// Launches a new process.
    fn launch(&self) -> Result<Box<dyn ManagedProcess>, ProcessError>;
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited within the grace period.
    Graceful(Option<i32>),
    /// The process had to be killed.
    Forced,
}

/// Terminates a process, escalating to a kill after `grace`.
///
/// The process is always reaped when this returns `Ok`.
pub async fn stop_gracefully(
    process: &mut dyn ManagedProcess,
    grace: Duration,
) -> Result<Termination, ProcessError> {
    if let Err(e) = process.terminate().await {
        warn!(pid = ?process.pid(), error = %e, "Terminate failed, killing instead");
        process.kill().await?;
        return Ok(Termination::Forced);
    }

    match tokio::time::timeout(grace, process.wait()).await {
        Ok(Ok(code)) => Ok(Termination::Graceful(code)),
        Ok(Err(e)) => {
            warn!(pid = ?process.pid(), error = %e, "Wait failed after terminate, killing");
            process.kill().await?;
            Ok(Termination::Forced)
        }
        Err(_) => {
            warn!(
                pid = ?process.pid(),
                grace_secs = grace.as_secs_f64(),
                "Process ignored terminate, killing"
            );
            process.kill().await?;
            Ok(Termination::Forced)
        }
    }
}

/// Keeps the last `limit` bytes of a stream.
#[derive(Debug)]
struct TailBuffer {
    data: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > self.limit {
            let excess = self.data.len() - self.limit;
            self.data.drain(..excess);
            self.dropped += excess;
        }
    }

    fn render(&self) -> String {
        let text = String::from_utf8_lossy(&self.data);
        if self.dropped > 0 {
            format!("...[truncated {} bytes]{}", self.dropped, text)
        } else {
            text.into_owned()
        }
    }
}

type SharedBuffer = Arc<Mutex<TailBuffer>>;

fn spawn_reader<R>(mut reader: R, buffer: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Ok(mut buf) = buffer.lock() {
                        buf.push(&chunk[..n]);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Stopped reading worker output");
                    break;
                }
            }
        }
    })
}

/// Converts an exit status into the code reported to callers.
fn exit_code(status: ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|sig| -sig)
    }

    #[cfg(not(unix))]
    {
        None
    }
}

/// A worker spawned through `tokio::process`.
pub struct ChildProcess {
    child: Child,
    pid: Option<u32>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    readers: Vec<JoinHandle<()>>,
}

impl ChildProcess {
    /// Spawns the command.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::SpawnFailed` if the program cannot be started.
    pub fn spawn(command: &WorkerCommand) -> Result<Self, ProcessError> {
        let mut std_cmd = std::process::Command::new(&command.program);
        std_cmd
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &command.working_dir {
            std_cmd.current_dir(dir);
        }
        for (key, value) in &command.env {
            std_cmd.env(key, value);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            std_cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            program: command.program.clone(),
            source,
        })?;

        let stdout = Arc::new(Mutex::new(TailBuffer::new(command.output_limit)));
        let stderr = Arc::new(Mutex::new(TailBuffer::new(command.output_limit)));
        let mut readers = Vec::with_capacity(2);

        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, Arc::clone(&stdout)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, Arc::clone(&stderr)));
        }

        let pid = child.id();
        info!(pid = ?pid, command = %command.display(), "Spawned worker process");

        Ok(Self {
            child,
            pid,
            stdout,
            stderr,
            readers,
        })
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let pid = self.pid.ok_or(ProcessError::NoPid)?;
        let raw = i32::try_from(pid).map_err(|_| ProcessError::SignalFailed {
            pid,
            reason: "pid out of range".to_string(),
        })?;

        match killpg(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::SignalFailed {
                pid,
                reason: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ManagedProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn wait(&mut self) -> Result<Option<i32>, ProcessError> {
        let status = self.child.wait().await?;
        Ok(exit_code(status))
    }

    async fn terminate(&mut self) -> Result<(), ProcessError> {
        if !self.is_alive() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            self.signal_group(nix::sys::signal::Signal::SIGTERM)
        }

        #[cfg(not(unix))]
        {
            self.child.start_kill()?;
            Ok(())
        }
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        #[cfg(unix)]
        {
            if self.is_alive() {
                self.signal_group(nix::sys::signal::Signal::SIGKILL)?;
            }
            self.child.wait().await?;
            Ok(())
        }

        #[cfg(not(unix))]
        {
            if self.is_alive() {
                self.child.kill().await?;
            } else {
                self.child.wait().await?;
            }
            Ok(())
        }
    }

    async fn take_output(&mut self) -> CapturedOutput {
        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                // A grandchild may still hold the pipe open
                abort.abort();
            }
        }

        let render = |buffer: &SharedBuffer| {
            buffer
                .lock()
                .map(|buf| buf.render())
                .unwrap_or_default()
        };

        CapturedOutput {
            stdout: render(&self.stdout),
            stderr: render(&self.stderr),
        }
    }
}

/// Launches `ChildProcess` workers from a fixed command.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    command: WorkerCommand,
}

impl CommandLauncher {
    /// Creates a launcher for the given command.
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }

    /// Returns the command this launcher runs.
    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self) -> Result<Box<dyn ManagedProcess>, ProcessError> {
        let child = ChildProcess::spawn(&self.command)?;
        Ok(Box::new(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_command_builder() {
        let cmd = WorkerCommand::new("python3")
            .with_args(["main_enhanced.py", "--queue-only"])
            .with_working_dir("/srv/avai")
            .with_env("PYTHONUNBUFFERED", "1")
            .with_output_limit(128);

        assert_eq!(cmd.display(), "python3 main_enhanced.py --queue-only");
        assert_eq!(cmd.working_dir, Some(PathBuf::from("/srv/avai")));
        assert_eq!(cmd.env, vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())]);
        assert_eq!(cmd.output_limit, 128);
    }

    #[test]
    fn test_tail_buffer_keeps_last_bytes() {
        let mut buf = TailBuffer::new(5);
        buf.push(b"abc");
        assert_eq!(buf.render(), "abc");

        buf.push(b"defgh");
        assert_eq!(buf.render(), "...[truncated 3 bytes]defgh");
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let cmd = WorkerCommand::new("/nonexistent/avai-worker-binary");
        let result = ChildProcess::spawn(&cmd);
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
    }

    #[cfg(unix)]
    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").with_args(["-c", script])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_and_output() {
        let mut process = ChildProcess::spawn(&sh("echo out; echo err >&2; exit 3")).unwrap();
        assert!(process.pid().is_some());

        assert_eq!(process.wait().await.unwrap(), Some(3));
        assert!(!process.is_alive());

        let output = process.take_output().await;
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_reports_signal() {
        let mut process = ChildProcess::spawn(&sh("sleep 30")).unwrap();
        assert!(process.is_alive());

        let outcome = stop_gracefully(&mut process, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::Graceful(Some(-15)));
        assert!(!process.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let mut process = ChildProcess::spawn(&sh("trap '' TERM; sleep 30")).unwrap();
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = stop_gracefully(&mut process, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::Forced);
        assert!(!process.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_is_bounded() {
        let cmd = sh("i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done")
            .with_output_limit(100);
        let mut process = ChildProcess::spawn(&cmd).unwrap();
        assert_eq!(process.wait().await.unwrap(), Some(0));

        let output = process.take_output().await;
        assert!(output.stdout.starts_with("...[truncated"));
        assert!(output.stdout.ends_with("0123456789\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_working_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = sh("pwd -P; echo \"$AVAI_MODE\"")
            .with_working_dir(dir.path())
            .with_env("AVAI_MODE", "queue-only");
        let mut process = ChildProcess::spawn(&cmd).unwrap();
        assert_eq!(process.wait().await.unwrap(), Some(0));

        let output = process.take_output().await;
        let mut lines = output.stdout.lines();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(lines.next().map(PathBuf::from), Some(expected));
        assert_eq!(lines.next(), Some("queue-only"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_after_exit_is_ok() {
        let mut process = ChildProcess::spawn(&sh("exit 0")).unwrap();
        process.wait().await.unwrap();
        process.kill().await.unwrap();
        process.terminate().await.unwrap();
    }
}
