use crate::aggregate::{RunAggregator, RunSet, SchemeRun};
use crate::atomic_write_json_pretty;
use crate::layout::TrialLayout;
use crate::orchestrator::Orchestrator;
use crate::plan::{plan, Pipeline, RunOptions, TracePair};
use crate::process::Launcher;
use crate::protocol::{BaseConfigStore, ConfigError, ProtocolConfig, ProtocolResolver};
use crate::selection::RunSelection;
use crate::settings::LabSettings;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Schemes run when none are named.
pub const DEFAULT_SCHEMES: [&str; 8] = [
    "abc",
    "cubic",
    "sprout",
    "verus",
    "vegas",
    "cubiccodel",
    "cubicpie",
    "bbr",
];

/// Cellular traces swept by `figure1` when none are named.
pub const FIGURE1_TRACES: [&str; 8] = [
    "Verizon-LTE-short.up",
    "Verizon-LTE-driving.up",
    "TMobile-LTE-driving.up",
    "ATT-LTE-driving.up",
    "Verizon-LTE-short.down",
    "Verizon-LTE-driving.down",
    "TMobile-LTE-driving.down",
    "ATT-LTE-driving.down",
];

const VERIZON_SHORT_UP: &str = "Verizon-LTE-short.up";
const VERIZON_SHORT_DOWN: &str = "Verizon-LTE-short.down";
const BW_FIXED: &str = "bw48-fixed.mahi";
const BW_VARIABLE: &str = "bw48-variable.mahi";
const TINY_SUFFIX: &str = "-tiny";
pub const MANIFEST_FILE: &str = "run_manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Experiment {
    /// Every scheme against every cellular trace, fixed-bandwidth downlink.
    Figure1,
    Figure2a,
    Figure2b,
    BothLinks,
    /// Short delay, links reversed.
    Pa1,
}

impl Experiment {
    pub const ALL: [Experiment; 5] = [
        Experiment::Figure1,
        Experiment::Figure2a,
        Experiment::Figure2b,
        Experiment::BothLinks,
        Experiment::Pa1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Experiment::Figure1 => "figure1",
            Experiment::Figure2a => "figure2a",
            Experiment::Figure2b => "figure2b",
            Experiment::BothLinks => "bothlinks",
            Experiment::Pa1 => "pa1",
        }
    }

    /// One-way delay given to `mm-delay`.
    pub fn delay_ms(&self) -> u32 {
        match self {
            Experiment::Pa1 => 20,
            _ => 50,
        }
    }

    pub fn sweeps_traces(&self) -> bool {
        matches!(self, Experiment::Figure1)
    }

    /// Trace pairs this experiment runs every scheme against. `traces` only
    /// matters for `figure1`.
    pub fn trace_cases(&self, settings: &LabSettings, traces: &[String], tiny: bool) -> Vec<TraceCase> {
        let cell = |name: &str| settings.trace_dir.join(name);
        let bw = |name: &str| settings.bandwidth_trace_dir.join(name);
        let pair = |up: (&str, PathBuf), down: (&str, PathBuf)| TraceCase {
            uplink_name: up.0.to_string(),
            downlink_name: down.0.to_string(),
            traces: TracePair::new(suffixed(up.1, tiny), suffixed(down.1, tiny)),
        };
        match self {
            Experiment::Figure1 => traces
                .iter()
                .map(|trace| TraceCase {
                    uplink_name: trace.clone(),
                    downlink_name: BW_VARIABLE.to_string(),
                    traces: TracePair::new(suffixed(cell(trace), tiny), bw(BW_VARIABLE)),
                })
                .collect(),
            Experiment::Figure2a => vec![pair(
                (VERIZON_SHORT_UP, cell(VERIZON_SHORT_UP)),
                (BW_FIXED, bw(BW_FIXED)),
            )],
            Experiment::Figure2b => vec![pair(
                (VERIZON_SHORT_DOWN, cell(VERIZON_SHORT_DOWN)),
                (BW_FIXED, bw(BW_FIXED)),
            )],
            Experiment::BothLinks => vec![pair(
                (VERIZON_SHORT_UP, cell(VERIZON_SHORT_UP)),
                (VERIZON_SHORT_DOWN, cell(VERIZON_SHORT_DOWN)),
            )],
            Experiment::Pa1 => vec![pair(
                (VERIZON_SHORT_DOWN, cell(VERIZON_SHORT_DOWN)),
                (VERIZON_SHORT_UP, cell(VERIZON_SHORT_UP)),
            )],
        }
    }
}

fn suffixed(path: PathBuf, tiny: bool) -> PathBuf {
    if !tiny {
        return path;
    }
    let mut raw = path.into_os_string();
    raw.push(TINY_SUFFIX);
    PathBuf::from(raw)
}

impl FromStr for Experiment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Experiment::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Experiment::ALL.iter().map(|e| e.as_str()).collect();
                anyhow!("unknown experiment '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}

impl fmt::Display for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trace pair plus the names used for its files and result rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceCase {
    pub uplink_name: String,
    pub downlink_name: String,
    pub traces: TracePair,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentRequest {
    pub experiment: Experiment,
    pub schemes: Vec<String>,
    /// `figure1` trace names.
    pub traces: Vec<String>,
    pub selection: RunSelection,
    pub trial_count: usize,
    pub print_graph: bool,
    pub tiny_trace: bool,
}

impl ExperimentRequest {
    pub fn new(experiment: Experiment) -> Self {
        Self {
            experiment,
            schemes: DEFAULT_SCHEMES.iter().map(|s| s.to_string()).collect(),
            traces: FIGURE1_TRACES.iter().map(|s| s.to_string()).collect(),
            selection: RunSelection::RunAll,
            trial_count: 1,
            print_graph: false,
            tiny_trace: false,
        }
    }

    fn layout(&self, settings: &LabSettings, scheme: &str, case: &TraceCase) -> TrialLayout {
        let layout = TrialLayout::new(
            &settings.work_dir,
            self.experiment.as_str(),
            scheme,
            &case.uplink_name,
            &case.downlink_name,
        );
        if self.print_graph {
            layout.with_graphs(&settings.graph_root())
        } else {
            layout
        }
    }
}

/// Runs an experiment scheme by scheme, trace pair by trace pair.
pub struct ExperimentDriver<'a, S, L: Launcher> {
    settings: &'a LabSettings,
    resolver: ProtocolResolver<'a, S>,
    orchestrator: Orchestrator<L>,
}

impl<'a, S: BaseConfigStore, L: Launcher> ExperimentDriver<'a, S, L> {
    pub fn new(
        settings: &'a LabSettings,
        resolver: ProtocolResolver<'a, S>,
        orchestrator: Orchestrator<L>,
    ) -> Self {
        Self {
            settings,
            resolver,
            orchestrator,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator<L> {
        &self.orchestrator
    }

    /// Every scheme is resolved before the first process starts, so a bad
    /// scheme name or configuration aborts the run with nothing spawned.
    pub fn run(&mut self, request: &ExperimentRequest) -> Result<RunSet> {
        if request.trial_count == 0 {
            return Err(anyhow!("trial count must be at least 1"));
        }
        let configs = request
            .schemes
            .iter()
            .map(|scheme| {
                self.resolver
                    .resolve(scheme)
                    .with_context(|| format!("cannot resolve scheme '{}'", scheme))
            })
            .collect::<Result<Vec<ProtocolConfig>>>()?;

        let cases = request
            .experiment
            .trace_cases(self.settings, &request.traces, request.tiny_trace);
        let full_runs: BTreeSet<(String, String)> = if request.experiment.sweeps_traces() {
            request
                .selection
                .full_run_pairs(&request.schemes, &request.traces)?
                .into_iter()
                .collect()
        } else {
            let names: Vec<String> = cases.iter().map(|c| c.uplink_name.clone()).collect();
            request
                .selection
                .full_run_schemes(&request.schemes)
                .into_iter()
                .flat_map(|s| names.iter().map(move |n| (s.clone(), n.clone())))
                .collect()
        };

        let started_at = Utc::now();
        let delay_ms = request.experiment.delay_ms();
        let settle = self.settings.settle();
        let mut schemes = Vec::new();
        let mut cancelled = false;

        'schemes: for (scheme, config) in request.schemes.iter().zip(&configs) {
            tracing::info!(experiment = %request.experiment, scheme = %scheme, "running scheme");
            for case in &cases {
                if self.orchestrator.is_cancelled() {
                    cancelled = true;
                    break 'schemes;
                }
                let layout = request.layout(self.settings, scheme, case);
                let run = SchemeRun {
                    config,
                    traces: &case.traces,
                    layout: &layout,
                    uplink_name: &case.uplink_name,
                    downlink_name: &case.downlink_name,
                    delay_ms,
                    trial_count: request.trial_count,
                    full_run: full_runs.contains(&(scheme.clone(), case.uplink_name.clone())),
                };
                let results = RunAggregator::new(&mut self.orchestrator, settle).run_scheme(&run);
                let stop = results.was_cancelled();
                schemes.push(results);
                if stop {
                    cancelled = true;
                    break 'schemes;
                }
            }
        }
        cancelled |= self.orchestrator.is_cancelled();

        let set = RunSet {
            experiment: request.experiment.as_str().to_string(),
            started_at,
            finished_at: Utc::now(),
            trial_count: request.trial_count,
            schemes,
            cancelled,
        };
        let manifest = manifest_path(self.settings, request.experiment);
        atomic_write_json_pretty(&manifest, &set.manifest_json())
            .with_context(|| format!("failed to write {}", manifest.display()))?;
        tracing::info!(path = %manifest.display(), "run manifest written");
        Ok(set)
    }
}

/// [`DEFAULT_SCHEMES`] minus those whose base record is not installed.
/// Other resolution errors are left for the driver to report.
pub fn available_default_schemes<S: BaseConfigStore>(
    resolver: &ProtocolResolver<'_, S>,
) -> Vec<String> {
    DEFAULT_SCHEMES
        .iter()
        .filter(|scheme| match resolver.resolve(scheme) {
            Err(ConfigError::BaseUnavailable { base, path, .. }) => {
                tracing::warn!(
                    scheme = %scheme,
                    base = %base,
                    path = %path.display(),
                    "skipping default scheme without a base record"
                );
                false
            }
            _ => true,
        })
        .map(|scheme| scheme.to_string())
        .collect()
}

pub fn manifest_path(settings: &LabSettings, experiment: Experiment) -> PathBuf {
    settings
        .results_root()
        .join(experiment.as_str())
        .join(MANIFEST_FILE)
}

/// The pipelines `scheme` would run for trial `trial`, without running them.
pub fn plan_preview(
    config: &ProtocolConfig,
    scheme: &str,
    settings: &LabSettings,
    request: &ExperimentRequest,
    trial: usize,
) -> Vec<(TraceCase, Pipeline)> {
    request
        .experiment
        .trace_cases(settings, &request.traces, request.tiny_trace)
        .into_iter()
        .map(|case| {
            let paths = request
                .layout(settings, scheme, &case)
                .trial(trial, request.trial_count);
            let pipeline = plan(
                config,
                &case.traces,
                request.experiment.delay_ms(),
                &paths,
                &RunOptions::for_trial(&paths),
            );
            (case, pipeline)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::TrialOutcome;
    use crate::orchestrator::{CancelToken, OrchestratorOptions};
    use crate::protocol::{SchemeCatalog, SchemeRecord, TargetLink};
    use crate::testing::FakeLauncher;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    const RESULTS: &str = "Average capacity: 48.00 Mbps
Average throughput: 24.00 Mbps
95th percentile per-packet queueing delay: 3 4 5 6 40 ms
Average signal delay: 1 2 3 4 80 ms
";

    fn record(name: &str, cmd: &str) -> SchemeRecord {
        SchemeRecord {
            name: name.to_string(),
            target_link: TargetLink::Uplink,
            uplink_queue: "droptail".to_string(),
            uplink_queue_args: "packets=100".to_string(),
            prep_commands: vec![format!("{}-server &", name)],
            cleanup_commands: vec![format!("killall {}-server", name)],
            mahimahi_command: cmd.to_string(),
        }
    }

    fn store() -> BTreeMap<String, SchemeRecord> {
        let mut store = BTreeMap::new();
        store.insert("abc".to_string(), record("abc", "python client.py"));
        store.insert("cubic".to_string(), record("cubic", "./start-tcp.sh cubic"));
        store
    }

    fn settings(dir: &Path) -> LabSettings {
        LabSettings {
            trace_dir: dir.join("traces"),
            bandwidth_trace_dir: dir.join("bw"),
            work_dir: dir.to_path_buf(),
            settle_seconds: 0,
            poll_interval_ms: 1,
            ..LabSettings::default()
        }
    }

    fn orchestrator(launcher: FakeLauncher) -> Orchestrator<FakeLauncher> {
        let options = OrchestratorOptions {
            verbose: false,
            home: None,
            poll_interval: Duration::from_millis(1),
        };
        Orchestrator::new(launcher, options, CancelToken::new())
    }

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn experiment_names_and_delays() {
        assert_eq!("pa1".parse::<Experiment>().expect("pa1"), Experiment::Pa1);
        assert_eq!(Experiment::Pa1.delay_ms(), 20);
        assert_eq!(Experiment::Figure2b.delay_ms(), 50);
        let err = "figure3".parse::<Experiment>().expect_err("unknown");
        assert!(err.to_string().contains("figure2a"));
    }

    #[test]
    fn tiny_suffix_applies_to_uplink_only_in_figure1() {
        let settings = settings(Path::new("/lab"));
        let cases = Experiment::Figure1.trace_cases(&settings, &list(&["ATT-LTE-driving.up"]), true);
        assert_eq!(cases.len(), 1);
        assert_eq!(
            cases[0].traces.uplink,
            PathBuf::from("/lab/traces/ATT-LTE-driving.up-tiny")
        );
        assert_eq!(cases[0].traces.downlink, PathBuf::from("/lab/bw/bw48-variable.mahi"));
        assert_eq!(cases[0].uplink_name, "ATT-LTE-driving.up");

        let cases = Experiment::Figure2a.trace_cases(&settings, &[], true);
        assert_eq!(
            cases[0].traces,
            TracePair::new(
                "/lab/traces/Verizon-LTE-short.up-tiny",
                "/lab/bw/bw48-fixed.mahi-tiny"
            )
        );
    }

    #[test]
    fn pa1_reverses_links() {
        let settings = settings(Path::new("/lab"));
        let cases = Experiment::Pa1.trace_cases(&settings, &[], false);
        assert_eq!(cases[0].uplink_name, "Verizon-LTE-short.down");
        assert_eq!(cases[0].downlink_name, "Verizon-LTE-short.up");
    }

    #[test]
    fn defaults_skip_schemes_without_base_records() {
        let catalog = SchemeCatalog::builtin();
        let store = store();
        let schemes = available_default_schemes(&ProtocolResolver::new(&catalog, &store));
        assert_eq!(
            schemes,
            list(&["abc", "cubic", "vegas", "cubiccodel", "cubicpie", "bbr"])
        );
    }

    #[test]
    fn unknown_scheme_aborts_before_spawning() {
        let dir = crate::testing::scratch_dir("driver_unknown");
        let settings = settings(&dir);
        let catalog = SchemeCatalog::builtin();
        let store = store();
        let launcher = FakeLauncher::new();
        let events = launcher.events.clone();
        let mut driver = ExperimentDriver::new(
            &settings,
            ProtocolResolver::new(&catalog, &store),
            orchestrator(launcher),
        );
        let mut request = ExperimentRequest::new(Experiment::Figure2a);
        request.schemes = list(&["abc", "reno"]);

        let err = driver.run(&request).expect_err("reno is unknown");
        assert!(format!("{:#}", err).contains("unknown scheme: reno"));
        assert!(events.borrow().is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn run_full_list_runs_only_listed_schemes_and_writes_manifest() {
        let dir = crate::testing::scratch_dir("driver_full");
        let settings = settings(&dir);
        let catalog = SchemeCatalog::builtin();
        let store = store();
        let mut launcher = FakeLauncher::new();
        launcher.results_fixture = Some(RESULTS.to_string());
        let events = launcher.events.clone();
        let mut driver = ExperimentDriver::new(
            &settings,
            ProtocolResolver::new(&catalog, &store),
            orchestrator(launcher),
        );
        let mut request = ExperimentRequest::new(Experiment::Figure2a);
        request.schemes = list(&["abc", "vegas"]);
        request.selection = RunSelection::RunFull(list(&["vegas"]));

        let set = driver.run(&request).expect("run");

        assert_eq!(set.schemes.len(), 2);
        assert_eq!(set.schemes[0].trials[0].outcome, TrialOutcome::NotFound);
        assert!(!set.schemes[0].trials[0].executed);
        assert!(set.schemes[1].trials[0].outcome.metrics().is_some());
        let spawned = FakeLauncher::spawned(&events);
        assert_eq!(spawned[0], "cubic-server &");
        assert!(spawned[1].ends_with("bash -c 'sh ~/ABC-1/start_tcp.sh vegas'"));
        assert!(spawned[1].contains("/logs/figure2a/vegas/UPLINK_Verizon-LTE-short.up-DOWNLINK_bw48-fixed.mahi.log"));

        let rows = set.csv_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].scheme, "vegas");
        assert!((rows[0].metrics.utilization - 0.5).abs() < 1e-12);
        assert_eq!(rows[0].metrics.per_packet_delay, 140.0);

        let manifest: serde_json::Value = serde_json::from_slice(
            &fs::read(manifest_path(&settings, Experiment::Figure2a)).expect("manifest"),
        )
        .expect("json");
        assert_eq!(manifest["experiment"], "figure2a");
        assert_eq!(manifest["cancelled"], false);
        assert_eq!(
            manifest["results"][1]["trials"][0]["plan_digest"]
                .as_str()
                .map(str::len),
            Some(64)
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn interrupt_during_settle_marks_run_cancelled() {
        let dir = crate::testing::scratch_dir("driver_settle");
        let settings = LabSettings {
            settle_seconds: 10,
            ..settings(&dir)
        };
        let catalog = SchemeCatalog::builtin();
        let store = store();
        let mut launcher = FakeLauncher::new();
        launcher.results_fixture = Some(RESULTS.to_string());
        let mut driver = ExperimentDriver::new(
            &settings,
            ProtocolResolver::new(&catalog, &store),
            orchestrator(launcher),
        );
        let token = driver.orchestrator().cancel_token().clone();
        let mut request = ExperimentRequest::new(Experiment::Figure2a);
        request.schemes = list(&["abc", "cubic"]);
        request.trial_count = 3;

        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            token.cancel();
        });
        let set = driver.run(&request).expect("run");
        interrupter.join().expect("interrupter");

        assert!(set.cancelled);
        assert_eq!(set.schemes.len(), 1);
        assert_eq!(set.schemes[0].trials.len(), 1);
        assert!(set.schemes[0].was_cancelled());
        let manifest: serde_json::Value = serde_json::from_slice(
            &fs::read(manifest_path(&settings, Experiment::Figure2a)).expect("manifest"),
        )
        .expect("json");
        assert_eq!(manifest["cancelled"], true);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn figure1_pairs_follow_reuse_patterns() {
        let dir = crate::testing::scratch_dir("driver_fig1");
        let settings = settings(&dir);
        let catalog = SchemeCatalog::builtin();
        let store = store();
        let mut launcher = FakeLauncher::new();
        launcher.results_fixture = Some(RESULTS.to_string());
        let events = launcher.events.clone();
        let mut driver = ExperimentDriver::new(
            &settings,
            ProtocolResolver::new(&catalog, &store),
            orchestrator(launcher),
        );
        let mut request = ExperimentRequest::new(Experiment::Figure1);
        request.schemes = list(&["abc", "cubic"]);
        request.traces = list(&["t1.up", "t2.up"]);
        request.selection = RunSelection::Reuse(list(&["abc:all", "all:t2.up"]));

        let set = driver.run(&request).expect("run");

        assert_eq!(set.schemes.len(), 4);
        let executed: Vec<(&str, &str)> = set
            .schemes
            .iter()
            .filter(|s| s.trials[0].executed)
            .map(|s| (s.scheme.as_str(), s.uplink_trace.as_str()))
            .collect();
        assert_eq!(executed, vec![("cubic", "t1.up")]);
        let measured = FakeLauncher::spawned(&events)
            .into_iter()
            .filter(|c| c.starts_with("mm-delay"))
            .collect::<Vec<_>>();
        assert_eq!(measured.len(), 1);
        assert!(measured[0].contains("mm-delay 50 "));
        assert!(measured[0].contains("/traces/t1.up "));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn preview_matches_trial_paths() {
        let settings = settings(Path::new("/lab"));
        let config = ProtocolConfig::from_record("abc", record("abc", "python client.py"), &BTreeMap::new())
            .expect("config");
        let mut request = ExperimentRequest::new(Experiment::Pa1);
        request.trial_count = 2;
        let preview = plan_preview(&config, "abc", &settings, &request, 2);
        assert_eq!(preview.len(), 1);
        let rendered = preview[0].1.render();
        assert!(rendered.contains("measured: mm-delay 20 "));
        assert!(rendered.contains("/lab/results/pa1/abc/multiple/2/"));
    }
}
