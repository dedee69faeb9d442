use cclab_analysis::MULTI_RUN_DIR;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Where the files of one `(experiment, scheme, trace pair)` live.
///
/// Logs go under `<work>/logs/<experiment>/<scheme>/` and statistics under
/// `<work>/results/<experiment>/<scheme>/`, both named after the trace pair.
/// Repeated trials move into `multiple/<i>/` below those directories.
/// Throughput graphs, when enabled, are named after scheme and trace pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialLayout {
    work_dir: PathBuf,
    experiment: String,
    scheme: String,
    stem: String,
    graph_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialPaths {
    /// 1-based.
    pub index: usize,
    pub log: PathBuf,
    pub results: PathBuf,
    pub graph: Option<PathBuf>,
}

impl TrialLayout {
    pub fn new(
        work_dir: &Path,
        experiment: &str,
        scheme: &str,
        uplink_name: &str,
        downlink_name: &str,
    ) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            experiment: experiment.to_string(),
            scheme: scheme.to_string(),
            stem: format!("UPLINK_{}-DOWNLINK_{}", uplink_name, downlink_name),
            graph_dir: None,
        }
    }

    /// Enables throughput-graph output under `graph_dir`.
    pub fn with_graphs(mut self, graph_dir: &Path) -> Self {
        self.graph_dir = Some(graph_dir.to_path_buf());
        self
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn log_dir(&self) -> PathBuf {
        self.work_dir
            .join("logs")
            .join(&self.experiment)
            .join(&self.scheme)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.work_dir
            .join("results")
            .join(&self.experiment)
            .join(&self.scheme)
    }

    pub fn canonical(&self) -> TrialPaths {
        TrialPaths {
            index: 1,
            log: self.log_dir().join(format!("{}.log", self.stem)),
            results: self.results_dir().join(format!("{}.txt", self.stem)),
            graph: self
                .graph_dir
                .as_ref()
                .map(|dir| dir.join(format!("{}_{}_graph.svg", self.scheme, self.stem))),
        }
    }

    /// Paths of trial `index` out of `trial_count`. A single trial uses the
    /// canonical paths.
    pub fn trial(&self, index: usize, trial_count: usize) -> TrialPaths {
        if trial_count <= 1 {
            return self.canonical();
        }
        let sub = Path::new(MULTI_RUN_DIR).join(index.to_string());
        TrialPaths {
            index,
            log: self.log_dir().join(&sub).join(format!("{}.log", self.stem)),
            results: self
                .results_dir()
                .join(&sub)
                .join(format!("{}.txt", self.stem)),
            graph: self
                .graph_dir
                .as_ref()
                .map(|dir| dir.join(format!("{}_{}_{}_graph.svg", self.scheme, self.stem, index))),
        }
    }

    pub fn all(&self, trial_count: usize) -> Vec<TrialPaths> {
        (1..=trial_count.max(1))
            .map(|i| self.trial(i, trial_count))
            .collect()
    }
}

impl TrialPaths {
    /// Creates the parent directories of every output file.
    pub fn prepare(&self) -> io::Result<()> {
        let outputs = [Some(&self.log), Some(&self.results), self.graph.as_ref()];
        for path in outputs.into_iter().flatten() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}
