use crate::orchestrator::CancelToken;
use crate::plan::{PhaseKind, THROUGHPUT_GRAPH};
use crate::process::{Launcher, ProcessExit, ProcessHandle, TerminateError};
use chrono::Utc;
use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;

pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "cclab_runner_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Spawn(String, PhaseKind),
    Terminate(u32),
}

pub(crate) type EventLog = Rc<RefCell<Vec<Event>>>;

/// Records launches instead of running them. Background handles run until
/// terminated; synchronous ones exit with code 0 on first poll.
#[derive(Default)]
pub(crate) struct FakeLauncher {
    pub events: EventLog,
    next_pid: u32,
    pub fail_on: Option<String>,
    pub hang_on: Option<String>,
    pub cancel_on: Option<(String, CancelToken)>,
    /// Written to the `2> <path>` target of every statistics command.
    pub results_fixture: Option<String>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: 100,
            ..Self::default()
        }
    }

    pub fn spawned(events: &EventLog) -> Vec<String> {
        events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Spawn(cmd, _) => Some(cmd.clone()),
                Event::Terminate(_) => None,
            })
            .collect()
    }

    pub fn terminated(events: &EventLog) -> Vec<u32> {
        events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Terminate(pid) => Some(*pid),
                Event::Spawn(..) => None,
            })
            .collect()
    }
}

impl Launcher for FakeLauncher {
    type Handle = FakeHandle;

    fn launch(&mut self, command: &str, kind: PhaseKind) -> io::Result<FakeHandle> {
        if let Some(pattern) = &self.fail_on {
            if command.contains(pattern.as_str()) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
            }
        }
        self.events
            .borrow_mut()
            .push(Event::Spawn(command.to_string(), kind));
        if let Some((pattern, token)) = &self.cancel_on {
            if command.contains(pattern.as_str()) {
                token.cancel();
            }
        }
        if let Some(fixture) = &self.results_fixture {
            if command.starts_with(THROUGHPUT_GRAPH) {
                if let Some((_, target)) = command.rsplit_once("2> ") {
                    fs::write(target.trim(), fixture)?;
                }
            }
        }
        let hangs = kind.is_background()
            || self
                .hang_on
                .as_deref()
                .map(|p| command.contains(p))
                .unwrap_or(false);
        self.next_pid += 1;
        Ok(FakeHandle {
            pid: self.next_pid,
            events: self.events.clone(),
            hangs,
            exited: false,
        })
    }
}

pub(crate) struct FakeHandle {
    pid: u32,
    events: EventLog,
    hangs: bool,
    exited: bool,
}

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn poll(&mut self) -> io::Result<Option<ProcessExit>> {
        if self.exited {
            return Ok(Some(ProcessExit { code: None }));
        }
        if self.hangs {
            return Ok(None);
        }
        self.exited = true;
        Ok(Some(ProcessExit { code: Some(0) }))
    }

    fn terminate(&mut self) -> Result<(), TerminateError> {
        if self.exited {
            return Err(TerminateError::AlreadyExited);
        }
        self.exited = true;
        self.events.borrow_mut().push(Event::Terminate(self.pid));
        Ok(())
    }
}
