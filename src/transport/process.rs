//! Transport to an interpreter running as a child process.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::{StreamTransport, Transport};
use crate::{Error, Result};

/// A [`Transport`] to an interpreter subprocess.
///
/// The child is spawned on [`open`](Transport::open) with piped stdio.
/// Stdout carries the REPL; stderr lines are forwarded to `tracing` at debug
/// level.
///
/// # Cancellation
///
/// Dropping a `ProcessTransport` kills the subprocess if it's still running.
///
/// # Example
///
/// ```ignore
/// use libmpy::transport::ProcessTransport;
///
/// let transport = ProcessTransport::new("micropython").arg("-i");
/// ```
pub struct ProcessTransport {
    program: PathBuf,
    args: Vec<OsString>,
    working_directory: Option<PathBuf>,
    child: Option<Child>,
    stream: Option<StreamTransport<ChildStdout, ChildStdin>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl ProcessTransport {
    /// Create a transport that will run `program` when opened.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_directory: None,
            child: None,
            stream: None,
            stderr_task: None,
        }
    }

    /// Append a command-line argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Working directory for the interpreter process.
    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    /// Get the process ID of the running interpreter.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.working_directory {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    fn forward_stderr(stderr: ChildStderr) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "libmpy::transport", stderr = %line, "interpreter stderr");
            }
        })
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let mut child = self.build_command().spawn().map_err(Error::ProcessSpawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ProcessSpawn(missing_pipe("stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ProcessSpawn(missing_pipe("stdout")))?;
        if let Some(stderr) = child.stderr.take() {
            self.stderr_task = Some(Self::forward_stderr(stderr));
        }

        let mut stream = StreamTransport::new(stdout, stdin);
        stream.open().await?;

        tracing::info!(program = %self.program.display(), pid = ?child.id(), "interpreter process started");
        self.child = Some(child);
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.close().await?;
        }
        if let Some(handle) = self.stderr_task.take() {
            handle.abort();
        }
        if let Some(mut child) = self.child.take() {
            // Already exited is fine.
            let _ = child.kill().await;
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .as_mut()
            .ok_or(Error::NotConnected)?
            .write(bytes)
            .await
    }

    async fn read_available(&mut self) -> Result<Vec<u8>> {
        self.stream
            .as_mut()
            .ok_or(Error::NotConnected)?
            .read_available()
            .await
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.stderr_task.take() {
            handle.abort();
        }
        if let Some(ref mut child) = self.child {
            let _ = child.start_kill();
        }
    }
}

fn missing_pipe(name: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("{name} was not captured"),
    )
}
