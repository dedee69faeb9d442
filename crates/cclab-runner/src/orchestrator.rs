use crate::expand_home;
use crate::plan::{PhaseKind, Pipeline};
use crate::process::{Launcher, ProcessHandle, TerminateError};
use crate::protocol::CommandStep;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Shared stop flag. Cloning yields a handle to the same flag, so a signal
/// handler can hold one clone while the orchestrator observes another.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
    /// A command could not be started or observed.
    Failed,
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandRecord {
    pub phase: PhaseKind,
    pub command: String,
    pub pid: u32,
    /// Unset for background commands and for commands stopped by a signal.
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub state: RunState,
    pub commands: Vec<CommandRecord>,
    /// Pids whose process group was still alive at the final sweep.
    pub terminated: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub verbose: bool,
    /// Replacement for `~` in commands; left untouched when unset.
    pub home: Option<PathBuf>,
    pub poll_interval: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            home: crate::home_dir(),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Every handle started during one pipeline. Dropping the table terminates
/// whatever is still running.
struct ProcessTable<H: ProcessHandle> {
    handles: Vec<H>,
}

impl<H: ProcessHandle> ProcessTable<H> {
    fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    fn push(&mut self, handle: H) -> &mut H {
        self.handles.push(handle);
        let last = self.handles.len() - 1;
        &mut self.handles[last]
    }

    fn sweep(&mut self) -> Vec<u32> {
        let mut terminated = Vec::new();
        for mut handle in self.handles.drain(..).rev() {
            let pid = handle.pid();
            match handle.terminate() {
                Ok(()) => terminated.push(pid),
                Err(TerminateError::AlreadyExited) => {}
                Err(err) => tracing::warn!(pid, error = %err, "failed to terminate process"),
            }
        }
        terminated
    }
}

impl<H: ProcessHandle> Drop for ProcessTable<H> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            let _ = self.sweep();
        }
    }
}

enum StepOutcome {
    Continue,
    Cancelled,
}

/// Runs pipelines one at a time. Background steps are started and recorded;
/// every other step is started and waited for before the next begins. All
/// recorded process groups are terminated when the pipeline ends, however it
/// ends.
pub struct Orchestrator<L: Launcher> {
    launcher: L,
    options: OrchestratorOptions,
    cancel: CancelToken,
    state: RunState,
}

impl<L: Launcher> Orchestrator<L> {
    pub fn new(launcher: L, options: OrchestratorOptions, cancel: CancelToken) -> Self {
        Self {
            launcher,
            options,
            cancel,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn execute(&mut self, pipeline: &Pipeline) -> Result<ExecutionReport, ExecuteError> {
        self.state = RunState::Running;
        let mut table = ProcessTable::new();
        let mut commands = Vec::new();
        let outcome = self.run_steps(pipeline, &mut table, &mut commands);
        let terminated = table.sweep();
        if !terminated.is_empty() {
            tracing::debug!(count = terminated.len(), "terminated leftover processes");
        }

        match outcome {
            Ok(StepOutcome::Continue) => {
                self.state = RunState::Completed;
            }
            Ok(StepOutcome::Cancelled) => {
                tracing::info!("pipeline cancelled");
                self.state = RunState::Cancelled;
            }
            Err(err) => {
                self.state = RunState::Failed;
                return Err(err);
            }
        }
        Ok(ExecutionReport {
            state: self.state,
            commands,
            terminated,
        })
    }

    /// Sleeps for `duration` in poll-interval slices. Returns `false` if
    /// cancellation was observed.
    pub fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(self.options.poll_interval.min(deadline - now));
        }
    }

    fn run_steps(
        &mut self,
        pipeline: &Pipeline,
        table: &mut ProcessTable<L::Handle>,
        commands: &mut Vec<CommandRecord>,
    ) -> Result<StepOutcome, ExecuteError> {
        for (kind, step) in pipeline.steps() {
            if self.cancel.is_cancelled() {
                return Ok(StepOutcome::Cancelled);
            }
            let command = match step {
                CommandStep::Wait(duration) => {
                    tracing::debug!(phase = %kind, secs = duration.as_secs(), "waiting");
                    if !self.pause(*duration) {
                        return Ok(StepOutcome::Cancelled);
                    }
                    continue;
                }
                CommandStep::Spawn(command) => match &self.options.home {
                    Some(home) => expand_home(command, home),
                    None => command.clone(),
                },
            };

            if self.options.verbose {
                tracing::info!("$ {}", command);
            } else {
                tracing::debug!(phase = %kind, command = %command, "spawning");
            }
            let handle = self
                .launcher
                .launch(&command, kind)
                .map_err(|source| ExecuteError::Spawn {
                    command: command.clone(),
                    source,
                })?;
            let pid = handle.pid();
            let handle = table.push(handle);

            if kind.is_background() {
                commands.push(CommandRecord {
                    phase: kind,
                    command,
                    pid,
                    exit_code: None,
                });
                continue;
            }

            let exit = loop {
                if self.cancel.is_cancelled() {
                    return Ok(StepOutcome::Cancelled);
                }
                match handle.poll() {
                    Ok(Some(exit)) => break exit,
                    Ok(None) => thread::sleep(self.options.poll_interval),
                    Err(source) => {
                        return Err(ExecuteError::Wait {
                            command: command.clone(),
                            source,
                        })
                    }
                }
            };
            if !exit.success() {
                tracing::debug!(phase = %kind, code = ?exit.code, command = %command, "command exited unsuccessfully");
            }
            commands.push(CommandRecord {
                phase: kind,
                command,
                pid,
                exit_code: exit.code,
            });
        }
        Ok(StepOutcome::Continue)
    }
}
