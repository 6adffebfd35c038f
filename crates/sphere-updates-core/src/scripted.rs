//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Scripted process runner replaying canned output."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::ProcessError;
use crate::process::{CommandSpec, ProcessHandle, ProcessRunner};

/// How a scripted command ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedExit {
    Success,
    Code(i32),
    SpawnFailure,
    /// Never exits on its own; ends only when its handle is dropped.
    Hang,
}

/// Canned output and exit for one invocation.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    lines: Vec<String>,
    exit: ScriptedExit,
}

impl ScriptedReply {
    pub fn success() -> Self {
        Self {
            lines: Vec::new(),
            exit: ScriptedExit::Success,
        }
    }

    /// Successful exit after printing `lines`.
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::success().with_lines(lines)
    }

    pub fn exit_code(code: i32) -> Self {
        Self {
            lines: Vec::new(),
            exit: ScriptedExit::Code(code),
        }
    }

    pub fn spawn_failure() -> Self {
        Self {
            lines: Vec::new(),
            exit: ScriptedExit::SpawnFailure,
        }
    }

    pub fn hang() -> Self {
        Self {
            lines: Vec::new(),
            exit: ScriptedExit::Hang,
        }
    }

    pub fn with_lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines.extend(lines.into_iter().map(Into::into));
        self
    }
}

struct Rule {
    prefix: Vec<String>,
    replies: VecDeque<ScriptedReply>,
}

#[derive(Default)]
struct ScriptState {
    rules: Vec<Rule>,
    invocations: Vec<CommandSpec>,
}

impl ScriptState {
    fn next_reply(&mut self, command: &CommandSpec) -> ScriptedReply {
        let Some(rule) = self
            .rules
            .iter_mut()
            .find(|rule| command.matches_prefix(rule.prefix.as_slice()))
        else {
            return ScriptedReply::success();
        };
        if rule.replies.len() > 1 {
            rule.replies.pop_front().unwrap_or_else(ScriptedReply::success)
        } else {
            rule.replies
                .front()
                .cloned()
                .unwrap_or_else(ScriptedReply::success)
        }
    }
}

/// [`ProcessRunner`] that replays canned replies and records every
/// invocation.
///
/// Replies are matched by argv prefix, first registered rule wins. Replies
/// queued on the same prefix are used in order and the last one repeats.
/// Commands matching no rule succeed silently.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `reply` for commands whose argv starts with `prefix`.
    pub fn on<I, S>(&self, prefix: I, reply: ScriptedReply) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefix: Vec<String> = prefix.into_iter().map(Into::into).collect();
        let mut state = self.state.lock();
        match state.rules.iter_mut().find(|rule| rule.prefix == prefix) {
            Some(rule) => rule.replies.push_back(reply),
            None => state.rules.push(Rule {
                prefix,
                replies: VecDeque::from([reply]),
            }),
        }
        self
    }

    /// Every command spawned so far, in order.
    pub fn invocations(&self) -> Vec<CommandSpec> {
        self.state.lock().invocations.clone()
    }

    /// Number of spawned commands whose argv starts with `prefix`.
    pub fn count_matching(&self, prefix: &[&str]) -> usize {
        self.state
            .lock()
            .invocations
            .iter()
            .filter(|command| command.matches_prefix(prefix))
            .count()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn spawn(&self, command: &CommandSpec) -> Result<ProcessHandle, ProcessError> {
        let reply = {
            let mut state = self.state.lock();
            state.invocations.push(command.clone());
            state.next_reply(command)
        };
        let display = command.to_string();
        if reply.exit == ScriptedExit::SpawnFailure {
            return Err(ProcessError::Spawn {
                command: display,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            });
        }

        let (line_tx, line_rx) = mpsc::channel(reply.lines.len().max(1));
        for line in reply.lines {
            // Capacity covers every line, so this never fails.
            let _ = line_tx.try_send(line);
        }
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        match reply.exit {
            ScriptedExit::Hang => {
                let command = display.clone();
                tokio::spawn(async move {
                    let _ = kill_rx.await;
                    drop(line_tx);
                    let _ = exit_tx.send(Err(ProcessError::Signalled { command }));
                });
            }
            ScriptedExit::Code(code) => {
                drop(line_tx);
                let _ = exit_tx.send(Err(ProcessError::Exit {
                    command: display.clone(),
                    code,
                }));
            }
            ScriptedExit::Success | ScriptedExit::SpawnFailure => {
                drop(line_tx);
                let _ = exit_tx.send(Ok(()));
            }
        }

        Ok(ProcessHandle::new(display, line_rx, exit_rx, kill_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::run_lines;
    use std::time::Duration;

    #[tokio::test]
    async fn replays_queued_replies_and_repeats_the_last() {
        let runner = ScriptedRunner::new();
        runner
            .on(["apt-get", "update"], ScriptedReply::lines(["Hit:1", "Hit:2"]))
            .on(["apt-get", "update"], ScriptedReply::exit_code(100));
        let update = CommandSpec::new("apt-get").args(["update", "-q"]);

        let mut seen = Vec::new();
        run_lines(&runner, &update, None, |line| seen.push(line.to_string()))
            .await
            .expect("first reply succeeds");
        assert_eq!(seen, vec!["Hit:1", "Hit:2"]);

        for _ in 0..2 {
            let err = run_lines(&runner, &update, None, |_| {})
                .await
                .expect_err("second reply repeats");
            assert_eq!(err.exit_code(), Some(100));
        }
        assert_eq!(runner.count_matching(&["apt-get", "update"]), 3);
    }

    #[tokio::test]
    async fn unmatched_commands_succeed_and_are_recorded() {
        let runner = ScriptedRunner::new();
        let spec = CommandSpec::new("dpkg").args(["--configure", "-a"]);
        run_lines(&runner, &spec, None, |_| {}).await.expect("default success");
        assert_eq!(runner.invocations(), vec![spec]);
    }

    #[tokio::test]
    async fn hanging_command_is_released_by_timeout() {
        let runner = ScriptedRunner::new();
        runner.on(["sleep"], ScriptedReply::hang().with_lines(["tick"]));
        let spec = CommandSpec::new("sleep").arg("600");
        let mut seen = 0;
        let err = run_lines(&runner, &spec, Some(Duration::from_millis(50)), |_| seen += 1)
            .await
            .expect_err("timeout");
        assert_eq!(seen, 1);
        assert!(matches!(err, ProcessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let runner = ScriptedRunner::new();
        runner.on(["mount"], ScriptedReply::spawn_failure());
        let err = runner
            .spawn(&CommandSpec::new("mount"))
            .await
            .expect_err("spawn failure");
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
