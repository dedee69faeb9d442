use crate::layout::{TrialLayout, TrialPaths};
use crate::orchestrator::{ExecutionReport, Orchestrator, RunState};
use crate::plan::{plan, RunOptions, TracePair};
use crate::process::Launcher;
use crate::protocol::ProtocolConfig;
use cclab_analysis::{
    parse_results, AggregateMetrics, CsvRow, Metrics, MetricsAccumulator, ResultsLookup,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

/// One scheme against one trace pair, repeated `trial_count` times.
pub struct SchemeRun<'a> {
    pub config: &'a ProtocolConfig,
    pub traces: &'a TracePair,
    pub layout: &'a TrialLayout,
    pub uplink_name: &'a str,
    pub downlink_name: &'a str,
    pub delay_ms: u32,
    pub trial_count: usize,
    /// When false, existing results are read back without running anything.
    pub full_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialOutcome {
    Measured { metrics: Metrics },
    NotFound,
    Malformed { reason: String },
    Failed { reason: String },
    Cancelled,
}

impl TrialOutcome {
    pub fn metrics(&self) -> Option<&Metrics> {
        match self {
            TrialOutcome::Measured { metrics } => Some(metrics),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialRecord {
    pub index: usize,
    pub paths: TrialPaths,
    pub executed: bool,
    pub plan_digest: String,
    pub report: Option<ExecutionReport>,
    pub outcome: TrialOutcome,
}

impl TrialRecord {
    fn manifest_json(&self) -> Value {
        json!({
            "index": self.index,
            "executed": self.executed,
            "plan_digest": self.plan_digest,
            "log": self.paths.log,
            "results": self.paths.results,
            "graph": self.paths.graph,
            "outcome": self.outcome,
            "commands": self.report.as_ref().map(|r| &r.commands),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemeResults {
    pub scheme: String,
    pub uplink_trace: String,
    pub downlink_trace: String,
    pub trial_count: usize,
    pub trials: Vec<TrialRecord>,
    /// Set when cancellation stopped the trials early, including between
    /// trials where no record was written.
    pub cancelled: bool,
}

impl SchemeResults {
    pub fn metrics(&self) -> impl Iterator<Item = &Metrics> {
        self.trials.iter().filter_map(|t| t.outcome.metrics())
    }

    pub fn accumulator(&self) -> MetricsAccumulator {
        self.metrics().collect()
    }

    /// `None` when no trial produced metrics.
    pub fn summary(&self) -> Option<AggregateMetrics> {
        self.accumulator().finish()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
            || self
                .trials
                .iter()
                .any(|t| matches!(t.outcome, TrialOutcome::Cancelled))
    }

    pub fn csv_rows(&self) -> Vec<CsvRow> {
        self.trials
            .iter()
            .filter_map(|t| {
                let metrics = t.outcome.metrics()?;
                let row = CsvRow::new(&self.scheme, *metrics, &self.uplink_trace, &self.downlink_trace);
                Some(if self.trial_count > 1 {
                    row.with_trial(t.index)
                } else {
                    row
                })
            })
            .collect()
    }

    fn manifest_json(&self) -> Value {
        json!({
            "scheme": self.scheme,
            "uplink_trace": self.uplink_trace,
            "downlink_trace": self.downlink_trace,
            "cancelled": self.was_cancelled(),
            "trials": self.trials.iter().map(TrialRecord::manifest_json).collect::<Vec<_>>(),
            "summary": self.summary(),
        })
    }
}

/// Runs the trials of one scheme and folds their metrics.
pub struct RunAggregator<'o, L: Launcher> {
    orchestrator: &'o mut Orchestrator<L>,
    settle: Duration,
}

impl<'o, L: Launcher> RunAggregator<'o, L> {
    pub fn new(orchestrator: &'o mut Orchestrator<L>, settle: Duration) -> Self {
        Self {
            orchestrator,
            settle,
        }
    }

    pub fn run_scheme(&mut self, run: &SchemeRun<'_>) -> SchemeResults {
        let scheme = run.layout.scheme().to_string();
        let mut trials = Vec::new();
        let mut cancelled = false;

        for paths in run.layout.all(run.trial_count) {
            if self.orchestrator.is_cancelled() {
                cancelled = true;
                break;
            }
            let pipeline = plan(
                run.config,
                run.traces,
                run.delay_ms,
                &paths,
                &RunOptions::for_trial(&paths),
            );
            let mut record = TrialRecord {
                index: paths.index,
                paths,
                executed: false,
                plan_digest: pipeline.digest(),
                report: None,
                outcome: TrialOutcome::NotFound,
            };

            if run.full_run {
                tracing::info!(
                    scheme = %scheme,
                    trial = record.index,
                    results = %record.paths.results.display(),
                    "trial started"
                );
                if let Err(err) = record.paths.prepare() {
                    tracing::warn!(scheme = %scheme, trial = record.index, error = %err, "cannot create trial directories");
                    record.outcome = TrialOutcome::Failed {
                        reason: err.to_string(),
                    };
                    trials.push(record);
                    continue;
                }
                record.executed = true;
                match self.orchestrator.execute(&pipeline) {
                    Ok(report) if report.state == RunState::Cancelled => {
                        tracing::warn!(scheme = %scheme, trial = record.index, "trial cancelled");
                        record.report = Some(report);
                        record.outcome = TrialOutcome::Cancelled;
                        trials.push(record);
                        cancelled = true;
                        break;
                    }
                    Ok(report) => record.report = Some(report),
                    Err(err) => {
                        tracing::warn!(scheme = %scheme, trial = record.index, error = %err, "trial failed");
                        record.outcome = TrialOutcome::Failed {
                            reason: err.to_string(),
                        };
                        trials.push(record);
                        if !self.orchestrator.pause(self.settle) {
                            cancelled = true;
                            break;
                        }
                        continue;
                    }
                }
            } else {
                tracing::info!(scheme = %scheme, trial = record.index, "run skipped, reusing results");
            }

            record.outcome = read_outcome(&record.paths, run.delay_ms);
            log_outcome(&scheme, &record);
            let executed = record.executed;
            trials.push(record);
            if executed && !self.orchestrator.pause(self.settle) {
                tracing::warn!(scheme = %scheme, "cancelled while settling");
                cancelled = true;
                break;
            }
        }

        SchemeResults {
            scheme,
            uplink_trace: run.uplink_name.to_string(),
            downlink_trace: run.downlink_name.to_string(),
            trial_count: run.trial_count,
            trials,
            cancelled,
        }
    }
}

fn read_outcome(paths: &TrialPaths, delay_ms: u32) -> TrialOutcome {
    match parse_results(&paths.results) {
        Ok(ResultsLookup::Found(report)) => TrialOutcome::Measured {
            metrics: Metrics::derive(&report, delay_ms),
        },
        Ok(ResultsLookup::NotFound) => TrialOutcome::NotFound,
        Err(err) => TrialOutcome::Malformed {
            reason: err.to_string(),
        },
    }
}

fn log_outcome(scheme: &str, record: &TrialRecord) {
    let path = record.paths.results.display();
    match &record.outcome {
        TrialOutcome::Measured { metrics } => tracing::info!(
            scheme,
            trial = record.index,
            path = %path,
            utilization = metrics.utilization,
            signal_delay = metrics.signal_delay,
            power = metrics.power_score,
            "metrics found"
        ),
        TrialOutcome::NotFound => {
            tracing::warn!(scheme, trial = record.index, path = %path, "results not found")
        }
        TrialOutcome::Malformed { reason } => {
            tracing::warn!(scheme, trial = record.index, reason = %reason, "malformed results")
        }
        TrialOutcome::Failed { .. } | TrialOutcome::Cancelled => {}
    }
}

/// Everything one experiment produced, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSet {
    pub experiment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub trial_count: usize,
    pub schemes: Vec<SchemeResults>,
    pub cancelled: bool,
}

impl RunSet {
    /// Reduction over every measured trial of every scheme.
    pub fn overall(&self) -> Option<AggregateMetrics> {
        self.schemes
            .iter()
            .map(SchemeResults::accumulator)
            .fold(MetricsAccumulator::new(), MetricsAccumulator::merge)
            .finish()
    }

    pub fn csv_rows(&self) -> Vec<CsvRow> {
        self.schemes.iter().flat_map(|s| s.csv_rows()).collect()
    }

    pub fn manifest_json(&self) -> Value {
        let mut names: Vec<&str> = Vec::new();
        for results in &self.schemes {
            if !names.contains(&results.scheme.as_str()) {
                names.push(&results.scheme);
            }
        }
        json!({
            "schema_version": "cclab_run_manifest_v1",
            "experiment": self.experiment,
            "started_at": self.started_at.to_rfc3339(),
            "finished_at": self.finished_at.to_rfc3339(),
            "trial_count": self.trial_count,
            "cancelled": self.cancelled,
            "schemes": names,
            "results": self.schemes.iter().map(SchemeResults::manifest_json).collect::<Vec<_>>(),
            "overall": self.overall(),
        })
    }
}
