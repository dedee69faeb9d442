use crate::expand_home_path;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lab-wide paths and timing. Every field has a default, so a settings file
/// only needs the values that differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabSettings {
    /// Cellular link traces.
    pub trace_dir: PathBuf,
    /// Fixed and variable bandwidth traces.
    pub bandwidth_trace_dir: PathBuf,
    /// Base scheme records, one `<base>.json` each.
    pub protocol_config_dir: PathBuf,
    /// Root of `logs/` and `results/`.
    pub work_dir: PathBuf,
    pub graph_dir: PathBuf,
    pub settle_seconds: u64,
    pub poll_interval_ms: u64,
    pub shell: String,
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            trace_dir: PathBuf::from("~/ABC-1/mahimahi/traces"),
            bandwidth_trace_dir: PathBuf::from("~/ABC-1/reproduction/traces"),
            protocol_config_dir: PathBuf::from("config/protocols"),
            work_dir: PathBuf::from("."),
            graph_dir: PathBuf::from("graphs"),
            settle_seconds: 2,
            poll_interval_ms: 50,
            shell: "sh".to_string(),
        }
    }
}

impl LabSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings {}", path.display()))?;
        let settings: LabSettings = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse settings {}", path.display()))?;
        Ok(settings)
    }

    /// Loads `path` when given, defaults otherwise, and expands `~` in every
    /// configured directory.
    pub fn load_or_default(path: Option<&Path>, home: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        Ok(settings.resolved(home))
    }

    pub fn resolved(mut self, home: Option<&Path>) -> Self {
        for dir in [
            &mut self.trace_dir,
            &mut self.bandwidth_trace_dir,
            &mut self.protocol_config_dir,
            &mut self.work_dir,
            &mut self.graph_dir,
        ] {
            *dir = expand_home_path(dir, home);
        }
        self
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// `graph_dir` relative to the working directory unless absolute.
    pub fn graph_root(&self) -> PathBuf {
        self.work_dir.join(&self.graph_dir)
    }

    pub fn results_root(&self) -> PathBuf {
        self.work_dir.join("results")
    }
}
