use crate::plan::PhaseKind;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("process already exited")]
    AlreadyExited,
    #[error("failed to signal process: {0}")]
    Signal(#[source] io::Error),
}

/// A started process the orchestrator can observe and stop.
pub trait ProcessHandle {
    fn pid(&self) -> u32;

    /// Non-blocking exit check.
    fn poll(&mut self) -> io::Result<Option<ProcessExit>>;

    /// Stops the process and everything it started. A process that is
    /// already gone yields `TerminateError::AlreadyExited`.
    fn terminate(&mut self) -> Result<(), TerminateError>;
}

pub trait Launcher {
    type Handle: ProcessHandle;

    fn launch(&mut self, command: &str, kind: PhaseKind) -> io::Result<Self::Handle>;
}

/// Characters that need a shell to mean what the command line says.
const SHELL_SYNTAX: &[char] = &[
    '\'', '"', '\\', '$', '`', ';', '|', '&', '<', '>', '(', ')', '{', '}', '*', '?', '[',
    ']', '~', '#', '=',
];

/// Starts each command in a fresh process group, with all standard streams
/// attached to the null device. Background steps made of plain words are
/// executed directly, so a missing program fails at spawn; everything else
/// goes through the shell.
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    shell: String,
    grace: Duration,
}

impl Default for ShellLauncher {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl ShellLauncher {
    pub fn new(shell: &str) -> Self {
        Self {
            shell: shell.to_string(),
            grace: Duration::from_secs(2),
        }
    }

    /// Time between SIGTERM and SIGKILL.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl Launcher for ShellLauncher {
    type Handle = ShellProcess;

    fn launch(&mut self, command: &str, kind: PhaseKind) -> io::Result<ShellProcess> {
        // Background steps are already detached from the caller; a trailing
        // `&` would only make the recorded pid the short-lived shell.
        let mut process = if kind.is_background() {
            let line = strip_background(command);
            match plain_words(line) {
                Some((program, args)) => {
                    let mut process = Command::new(program);
                    process.args(args);
                    process
                }
                None => self.shell_command(line),
            }
        } else {
            self.shell_command(command)
        };
        let child = process
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;
        Ok(ShellProcess {
            child,
            grace: self.grace,
            exit: None,
        })
    }
}

impl ShellLauncher {
    fn shell_command(&self, line: &str) -> Command {
        let mut process = Command::new(&self.shell);
        process.arg("-c").arg(line);
        process
    }
}

/// Splits `line` into program and arguments when it has no shell syntax.
fn plain_words(line: &str) -> Option<(&str, Vec<&str>)> {
    if line.contains(SHELL_SYNTAX) {
        return None;
    }
    let mut words = line.split_whitespace();
    let program = words.next()?;
    Some((program, words.collect()))
}

fn strip_background(command: &str) -> &str {
    let trimmed = command.trim_end();
    match trimmed.strip_suffix('&') {
        Some(rest) if !rest.ends_with('&') => rest.trim_end(),
        _ => trimmed,
    }
}

#[derive(Debug)]
pub struct ShellProcess {
    child: Child,
    grace: Duration,
    exit: Option<ProcessExit>,
}

impl ShellProcess {
    fn pgid(&self) -> libc::pid_t {
        self.child.id() as libc::pid_t
    }

    fn signal_group(&self, signal: libc::c_int) -> io::Result<()> {
        let rc = unsafe { libc::killpg(self.pgid(), signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn group_alive(&self) -> bool {
        self.signal_group(0).is_ok()
    }

    fn reap(&mut self) {
        if self.exit.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit = Some(ProcessExit {
                    code: status.code(),
                });
            }
        }
    }
}

impl ProcessHandle for ShellProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn poll(&mut self) -> io::Result<Option<ProcessExit>> {
        if self.exit.is_none() {
            if let Some(status) = self.child.try_wait()? {
                self.exit = Some(ProcessExit {
                    code: status.code(),
                });
            }
        }
        Ok(self.exit)
    }

    fn terminate(&mut self) -> Result<(), TerminateError> {
        // The leader may be a zombie still holding the group open.
        self.reap();
        match self.signal_group(libc::SIGTERM) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {
                return Err(TerminateError::AlreadyExited)
            }
            Err(err) => return Err(TerminateError::Signal(err)),
        }

        let deadline = Instant::now() + self.grace;
        loop {
            self.reap();
            if !self.group_alive() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        tracing::debug!(pgid = self.pgid(), "process group ignored SIGTERM, killing");
        match self.signal_group(libc::SIGKILL) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {}
            Err(err) => return Err(TerminateError::Signal(err)),
        }
        if self.exit.is_none() {
            if let Ok(status) = self.child.wait() {
                self.exit = Some(ProcessExit {
                    code: status.code(),
                });
            }
        }
        Ok(())
    }
}
