//! Experiment orchestration for congestion-control schemes running behind an
//! emulated cellular link.
//!
//! A scheme resolves to a [`ProtocolConfig`], the planner turns it into a
//! four-phase [`Pipeline`], the [`Orchestrator`] runs that pipeline as real
//! processes, and the [`RunAggregator`] repeats it per trial and collects the
//! metrics. [`ExperimentDriver`] ties the pieces together for the named
//! experiments.

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub mod aggregate;
pub mod experiment;
pub mod layout;
pub mod orchestrator;
pub mod plan;
pub mod process;
pub mod protocol;
pub mod selection;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregate::{RunAggregator, RunSet, SchemeResults, SchemeRun, TrialOutcome, TrialRecord};
pub use experiment::{
    available_default_schemes, plan_preview, Experiment, ExperimentDriver, ExperimentRequest,
    TraceCase, DEFAULT_SCHEMES, FIGURE1_TRACES,
};
pub use layout::{TrialLayout, TrialPaths};
pub use orchestrator::{
    CancelToken, CommandRecord, ExecuteError, ExecutionReport, Orchestrator, OrchestratorOptions,
    RunState,
};
pub use plan::{plan, CommandPhase, PhaseKind, Pipeline, RunOptions, TracePair};
pub use process::{Launcher, ProcessExit, ProcessHandle, ShellLauncher, TerminateError};
pub use protocol::{
    BaseConfigStore, CommandStep, ConfigError, DirectoryStore, ProtocolConfig, ProtocolResolver,
    SchemeCatalog, SchemeEntry, SchemeRecord, TargetLink,
};
pub use selection::{check_export, RunSelection, SelectionError};
pub use settings::LabSettings;

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// Replaces `~` with `home` wherever it starts a word (`~`, `~/x`, `a=~/x`,
/// `'~/x'`). Other tildes, such as `a~b`, are left alone.
pub fn expand_home(text: &str, home: &Path) -> String {
    let home = home.to_string_lossy();
    let mut out = String::with_capacity(text.len());
    let mut prev: Option<char> = None;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        let starts_word = matches!(prev, None | Some(' ' | '\t' | '=' | '\'' | '"' | ':'));
        let ends_word = matches!(chars.peek(), None | Some('/' | ' ' | '\t' | '\'' | '"' | ':'));
        if c == '~' && starts_word && ends_word {
            out.push_str(&home);
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    out
}

pub(crate) fn expand_home_path(path: &Path, home: Option<&Path>) -> PathBuf {
    match (home, path.to_str()) {
        (Some(home), Some(raw)) if raw.starts_with('~') => PathBuf::from(expand_home(raw, home)),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_shorthand_is_expanded_at_word_starts() {
        let home = Path::new("/home/lab");
        assert_eq!(
            expand_home("sh ~/ABC-1/start_tcp.sh vegas", home),
            "sh /home/lab/ABC-1/start_tcp.sh vegas"
        );
        assert_eq!(expand_home("cd ~", home), "cd /home/lab");
        assert_eq!(expand_home("--log=~/x.log", home), "--log=/home/lab/x.log");
        assert_eq!(expand_home("bash -c '~/run'", home), "bash -c '/home/lab/run'");
        assert_eq!(expand_home("backup~1 ~user", home), "backup~1 ~user");
    }

    #[test]
    fn atomic_write_replaces_file() {
        let dir = testing::scratch_dir("atomic");
        let path = dir.join("nested").join("out.json");
        atomic_write_json_pretty(&path, &serde_json::json!({"a": 1})).expect("first write");
        atomic_write_json_pretty(&path, &serde_json::json!({"a": 2})).expect("second write");
        let value: Value = serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        assert_eq!(value["a"], 2);
        let _ = fs::remove_dir_all(dir);
    }
}
