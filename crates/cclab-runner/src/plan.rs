use crate::layout::TrialPaths;
use crate::protocol::{CommandStep, ProtocolConfig, TargetLink};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

pub const DELAY_SHELL: &str = "mm-delay";
pub const LINK_SHELL: &str = "mm-link";
pub const THROUGHPUT_GRAPH: &str = "mm-throughput-graph";
/// Averaging window, in milliseconds, passed to the statistics extractor.
pub const GRAPH_WINDOW_MS: u32 = 500;
const DISCARD: &str = "/dev/null";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Prep,
    Measured,
    Cleanup,
    Collect,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Prep => "prep",
            PhaseKind::Measured => "measured",
            PhaseKind::Cleanup => "cleanup",
            PhaseKind::Collect => "collect",
        }
    }

    /// Background phases are started and left running; the rest are waited on.
    pub fn is_background(&self) -> bool {
        matches!(self, PhaseKind::Prep)
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPhase {
    pub kind: PhaseKind,
    pub steps: Vec<CommandStep>,
}

/// The four phases of one trial, always in prep, measured, cleanup, collect
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    phases: Vec<CommandPhase>,
}

impl Pipeline {
    pub fn phases(&self) -> &[CommandPhase] {
        &self.phases
    }

    #[cfg(test)]
    pub(crate) fn from_steps(steps: Vec<(PhaseKind, CommandStep)>) -> Self {
        let mut phases: Vec<CommandPhase> = Vec::new();
        for (kind, step) in steps {
            match phases.last_mut() {
                Some(phase) if phase.kind == kind => phase.steps.push(step),
                _ => phases.push(CommandPhase {
                    kind,
                    steps: vec![step],
                }),
            }
        }
        Self { phases }
    }

    pub fn steps(&self) -> impl Iterator<Item = (PhaseKind, &CommandStep)> {
        self.phases
            .iter()
            .flat_map(|p| p.steps.iter().map(move |s| (p.kind, s)))
    }

    /// One line per step, `<phase>: <step>`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (kind, step) in self.steps() {
            out.push_str(kind.as_str());
            out.push_str(": ");
            out.push_str(&step.to_string());
            out.push('\n');
        }
        out
    }

    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.render().as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracePair {
    pub uplink: PathBuf,
    pub downlink: PathBuf,
}

impl TracePair {
    pub fn new(uplink: impl Into<PathBuf>, downlink: impl Into<PathBuf>) -> Self {
        Self {
            uplink: uplink.into(),
            downlink: downlink.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Destination of the extractor's graph output; discarded when unset.
    pub graph_file: Option<PathBuf>,
}

impl RunOptions {
    pub fn for_trial(paths: &TrialPaths) -> Self {
        Self {
            graph_file: paths.graph.clone(),
        }
    }
}

/// Builds the command pipeline of one trial. Pure: identical input always
/// yields an identical pipeline.
pub fn plan(
    config: &ProtocolConfig,
    traces: &TracePair,
    delay_ms: u32,
    paths: &TrialPaths,
    options: &RunOptions,
) -> Pipeline {
    let measured = measured_command(config, traces, delay_ms, &paths.log);
    let graph = options
        .graph_file
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| DISCARD.to_string());
    let collect = format!(
        "{} {} {} > {} 2> {}",
        THROUGHPUT_GRAPH,
        GRAPH_WINDOW_MS,
        paths.log.display(),
        graph,
        paths.results.display()
    );

    Pipeline {
        phases: vec![
            CommandPhase {
                kind: PhaseKind::Prep,
                steps: config.prep_commands().to_vec(),
            },
            CommandPhase {
                kind: PhaseKind::Measured,
                steps: vec![CommandStep::Spawn(measured)],
            },
            CommandPhase {
                kind: PhaseKind::Cleanup,
                steps: config.cleanup_commands().to_vec(),
            },
            CommandPhase {
                kind: PhaseKind::Collect,
                steps: vec![CommandStep::Spawn(collect)],
            },
        ],
    }
}

fn measured_command(config: &ProtocolConfig, traces: &TracePair, delay_ms: u32, log: &Path) -> String {
    let target = config.target_link().as_str();
    let (first, second) = match config.target_link() {
        TargetLink::Uplink => (&traces.uplink, &traces.downlink),
        TargetLink::Downlink => (&traces.downlink, &traces.uplink),
    };
    let mut cmd = format!(
        "{} {} {} --once --{}-log={}",
        DELAY_SHELL,
        delay_ms,
        LINK_SHELL,
        target,
        log.display()
    );
    if !config.queue_kind().is_empty() {
        cmd.push_str(&format!(
            " --{t}-queue={} --{t}-queue-args=\"{}\"",
            config.queue_kind(),
            config.queue_args(),
            t = target
        ));
    }
    cmd.push_str(&format!(
        " {} {} -- bash -c {}",
        first.display(),
        second.display(),
        single_quote(config.run_command())
    ));
    cmd
}

fn single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}
