use crate::metrics::Metrics;
use crate::results::{parse_results, MalformedResults, ResultsLookup};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Directory segment under a scheme's results directory that holds one
/// sub-directory per trial when an experiment is repeated.
pub const MULTI_RUN_DIR: &str = "multiple";

#[derive(Debug, Error)]
pub enum GatherError {
    #[error("cannot list trial directory {}: {source}", dir.display())]
    List {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("expected exactly one results file in {}, found {count}", dir.display())]
    Ambiguous { dir: PathBuf, count: usize },
    #[error(transparent)]
    Malformed(#[from] MalformedResults),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatheredTrial {
    pub scheme: String,
    pub trial: usize,
    pub path: Option<PathBuf>,
    pub metrics: Option<Metrics>,
}

/// `<results_root>/<experiment>/<scheme>/multiple/<trial>`
pub fn multi_run_dir(results_root: &Path, experiment: &str, scheme: &str, trial: usize) -> PathBuf {
    results_root
        .join(experiment)
        .join(scheme)
        .join(MULTI_RUN_DIR)
        .join(trial.to_string())
}

/// Collects per-trial metrics of a repeated experiment without re-running it.
/// Trials are numbered from 1. A missing or empty trial directory yields a
/// trial with no metrics.
pub fn gather_trials(
    results_root: &Path,
    experiment: &str,
    schemes: &[String],
    trial_count: usize,
    delay_ms: u32,
) -> Result<Vec<GatheredTrial>, GatherError> {
    let mut gathered = Vec::new();
    for scheme in schemes {
        for trial in 1..=trial_count {
            let dir = multi_run_dir(results_root, experiment, scheme, trial);
            let file = single_results_file(&dir)?;
            let metrics = match &file {
                Some(path) => match parse_results(path)? {
                    ResultsLookup::Found(report) => Some(Metrics::derive(&report, delay_ms)),
                    ResultsLookup::NotFound => None,
                },
                None => None,
            };
            if metrics.is_none() {
                tracing::warn!(scheme = %scheme, trial, dir = %dir.display(), "no results for trial");
            }
            gathered.push(GatheredTrial {
                scheme: scheme.clone(),
                trial,
                path: file,
                metrics,
            });
        }
    }
    Ok(gathered)
}

fn single_results_file(dir: &Path) -> Result<Option<PathBuf>, GatherError> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|source| GatherError::List {
            dir: dir.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    match files.len() {
        0 => Ok(None),
        1 => Ok(files.pop()),
        count => Err(GatherError::Ambiguous {
            dir: dir.to_path_buf(),
            count,
        }),
    }
}
