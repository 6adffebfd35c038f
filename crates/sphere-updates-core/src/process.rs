//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "External command execution with streamed standard output."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::fmt;
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ProcessError;

/// Lines buffered between the drain task and the reader before the drain
/// task (and therefore the child) is paused.
const LINE_BUFFER: usize = 256;

/// Program, arguments and extra environment for one external invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Build from an argv vector; `None` when the vector is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str))
    }

    /// True when the argv starts with every element of `prefix`.
    pub fn matches_prefix<S: AsRef<str>>(&self, prefix: &[S]) -> bool {
        let mut argv = self.argv();
        prefix
            .iter()
            .all(|expected| argv.next() == Some(expected.as_ref()))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Spawns external commands. Implemented by [`TokioProcessRunner`] for real
/// processes and by [`crate::ScriptedRunner`] for tests and dry runs.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn spawn(&self, command: &CommandSpec) -> Result<ProcessHandle, ProcessError>;
}

/// A running command: its standard output as lines, then its exit outcome.
///
/// The stream ends when the process exits, even if a descendant it left
/// behind still holds standard output open. Output already written is read
/// for up to [`EXIT_DRAIN_GRACE`] after the exit.
///
/// Dropping the handle before [`ProcessHandle::wait`] resolves kills the
/// child.
#[derive(Debug)]
pub struct ProcessHandle {
    command: String,
    lines: mpsc::Receiver<String>,
    exit: Option<oneshot::Receiver<Result<(), ProcessError>>>,
    outcome: Option<Result<(), ProcessError>>,
    drain_until: Option<Instant>,
    finished: bool,
    _kill: oneshot::Sender<()>,
}

/// How long output left in the pipe is still read once the process has
/// exited.
pub const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

impl ProcessHandle {
    /// Assemble a handle from the channels fed by a runner's supervising
    /// tasks. Dropping the sender paired with `kill` must terminate the
    /// process.
    pub fn new(
        command: impl Into<String>,
        lines: mpsc::Receiver<String>,
        exit: oneshot::Receiver<Result<(), ProcessError>>,
        kill: oneshot::Sender<()>,
    ) -> Self {
        Self {
            command: command.into(),
            lines,
            exit: Some(exit),
            outcome: None,
            drain_until: None,
            finished: false,
            _kill: kill,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Next line of standard output; `None` once the stream has closed or
    /// the process has exited and its remaining output is drained, on this
    /// and every later call.
    pub async fn next_line(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        let line = match self.drain_until {
            Some(deadline) => tokio::time::timeout_at(deadline, self.lines.recv())
                .await
                .ok()
                .flatten(),
            None => self.read_until_exit().await,
        };
        if line.is_none() {
            self.finished = true;
            self.lines.close();
        }
        line
    }

    async fn read_until_exit(&mut self) -> Option<String> {
        let exit = self.exit.as_mut()?;
        tokio::select! {
            biased;
            line = self.lines.recv() => line,
            outcome = exit => {
                self.exit = None;
                self.outcome = Some(self.flatten(outcome));
                let deadline = Instant::now() + EXIT_DRAIN_GRACE;
                self.drain_until = Some(deadline);
                tokio::time::timeout_at(deadline, self.lines.recv())
                    .await
                    .ok()
                    .flatten()
            }
        }
    }

    fn flatten(
        &self,
        outcome: Result<Result<(), ProcessError>, oneshot::error::RecvError>,
    ) -> Result<(), ProcessError> {
        outcome.unwrap_or_else(|_| {
            Err(ProcessError::Wait {
                command: self.command.clone(),
                reason: "process supervisor went away".into(),
            })
        })
    }

    /// Discard any unread output and wait for the process to exit.
    pub async fn wait(mut self) -> Result<(), ProcessError> {
        while self.next_line().await.is_some() {}
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        match self.exit.take() {
            Some(exit) => {
                let outcome = exit.await;
                self.flatten(outcome)
            }
            None => Err(ProcessError::Wait {
                command: self.command.clone(),
                reason: "exit status already collected".into(),
            }),
        }
    }
}

/// Time allowance for one command, charged only while the caller is
/// awaiting the process itself.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    limit: Option<Duration>,
    remaining: Option<Duration>,
}

impl TimeBudget {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            limit,
            remaining: limit,
        }
    }

    /// Await `fut`, failing with [`ProcessError::Timeout`] once the budget is
    /// spent. The future is dropped on timeout, which kills any child it owns.
    pub async fn charge<T, F>(&mut self, command: &CommandSpec, fut: F) -> Result<T, ProcessError>
    where
        F: Future<Output = T>,
    {
        let (Some(after), Some(remaining)) = (self.limit, self.remaining) else {
            return Ok(fut.await);
        };
        let started = Instant::now();
        let outcome = tokio::time::timeout(remaining, fut).await;
        self.remaining = Some(remaining.saturating_sub(started.elapsed()));
        outcome.map_err(|_| ProcessError::Timeout {
            command: command.to_string(),
            after,
        })
    }
}

/// Run `command` to completion, handing each output line to `on_line`.
///
/// Only time spent waiting on the process counts towards `limit`; time spent
/// inside `on_line` does not.
pub async fn run_lines<F>(
    runner: &dyn ProcessRunner,
    command: &CommandSpec,
    limit: Option<Duration>,
    mut on_line: F,
) -> Result<(), ProcessError>
where
    F: FnMut(&str) + Send,
{
    let mut budget = TimeBudget::new(limit);
    let mut handle = budget.charge(command, runner.spawn(command)).await??;
    while let Some(line) = budget.charge(command, handle.next_line()).await? {
        on_line(&line);
    }
    budget.charge(command, handle.wait()).await?
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn spawn(&self, spec: &CommandSpec) -> Result<ProcessHandle, ProcessError> {
        let display = spec.to_string();
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: display.clone(),
            source,
        })?;
        debug!(command = %spec, pid = ?child.id(), "spawned process");

        let stdout = child.stdout.take().ok_or_else(|| ProcessError::Wait {
            command: display.clone(),
            reason: "standard output was not captured".into(),
        })?;

        let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(drain_lines(stdout, line_tx));
        tokio::spawn(supervise(child, display.clone(), kill_rx, exit_tx));

        Ok(ProcessHandle::new(display, line_rx, exit_rx, kill_tx))
    }
}

async fn drain_lines<R>(reader: R, lines: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut forwarding = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                // Keep reading after the receiver is gone so the child never
                // blocks on a full pipe.
                if forwarding && lines.send(decode_line(&buf)).await.is_err() {
                    forwarding = false;
                }
            }
            Err(err) => {
                warn!(error = %err, "failed reading process output");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    command: String,
    kill: oneshot::Receiver<()>,
    exit: oneshot::Sender<Result<(), ProcessError>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            debug!(command = %command, "killing abandoned process");
            if let Err(err) = child.start_kill() {
                warn!(command = %command, error = %err, "failed to kill process");
            }
            child.wait().await
        }
    };
    let outcome = match status {
        Ok(status) => exit_outcome(&command, status),
        Err(err) => Err(ProcessError::Wait {
            command,
            reason: err.to_string(),
        }),
    };
    let _ = exit.send(outcome);
}

fn exit_outcome(command: &str, status: ExitStatus) -> Result<(), ProcessError> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(ProcessError::Exit {
            command: command.to_string(),
            code,
        }),
        None => Err(ProcessError::Signalled {
            command: command.to_string(),
        }),
    }
}

/// Decode one raw output line: lossy UTF-8, trailing `\n` and `\r` removed.
pub(crate) fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
