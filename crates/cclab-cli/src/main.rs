use anyhow::{Context, Result};
use cclab_analysis::{gather_trials, write_csv, CsvRow, MetricsAccumulator, UNKNOWN_TRACE};
use cclab_runner::experiment::manifest_path;
use cclab_runner::{
    available_default_schemes, check_export, home_dir, plan_preview, CancelToken, DirectoryStore,
    Experiment, ExperimentDriver, ExperimentRequest, LabSettings, Orchestrator,
    OrchestratorOptions, ProtocolResolver, RunSelection, RunSet, SchemeCatalog, ShellLauncher,
    TrialOutcome,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "cclab",
    version = "0.3.0",
    about = "Congestion-control experiments over emulated cellular links"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment and print per-trial metrics.
    Run {
        #[arg(long, default_value = "figure2a")]
        experiment: String,
        /// Schemes to run. When omitted, the default schemes whose base
        /// record is installed.
        #[arg(long, num_args = 1..)]
        schemes: Vec<String>,
        /// (figure1) cellular traces; all when omitted or `all`.
        #[arg(long, num_args = 1..)]
        traces: Vec<String>,
        /// Run only these schemes (or scheme:trace pairs) in full.
        #[arg(long, num_args = 1..)]
        run_full: Option<Vec<String>>,
        /// Reuse existing results for these schemes (or scheme:trace pairs).
        #[arg(long, num_args = 1..)]
        reuse_results: Option<Vec<String>>,
        #[arg(long, default_value_t = 1)]
        num_runs: usize,
        #[arg(long)]
        csv_out: Option<PathBuf>,
        #[arg(long)]
        print_graph: bool,
        #[arg(long)]
        tiny_trace: bool,
        #[arg(long)]
        verbose: bool,
        #[arg(long)]
        settings: Option<PathBuf>,
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print the commands a scheme would run, without running them.
    Plan {
        scheme: String,
        #[arg(long, default_value = "figure2a")]
        experiment: String,
        #[arg(long, num_args = 1..)]
        traces: Vec<String>,
        #[arg(long, default_value_t = 1)]
        trial: usize,
        #[arg(long, default_value_t = 1)]
        num_runs: usize,
        #[arg(long)]
        print_graph: bool,
        #[arg(long)]
        tiny_trace: bool,
        #[arg(long)]
        settings: Option<PathBuf>,
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Collect metrics of a repeated experiment from its results directories.
    Gather {
        #[arg(long, num_args = 1.., required = true)]
        schemes: Vec<String>,
        #[arg(long)]
        num_runs: usize,
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        csv_out: Option<PathBuf>,
        #[arg(long)]
        settings: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List the scheme catalog.
    Schemes {
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(command_verbose(&cli.command));
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            experiment,
            schemes,
            traces,
            run_full,
            reuse_results,
            num_runs,
            csv_out,
            print_graph,
            tiny_trace,
            verbose,
            settings,
            catalog,
            json,
        } => {
            let home = home_dir();
            let settings = LabSettings::load_or_default(settings.as_deref(), home.as_deref())?;
            let catalog = load_catalog(catalog.as_deref())?;
            let experiment: Experiment = experiment.parse()?;
            let selection = RunSelection::from_options(reuse_results, run_full)?;
            check_export(num_runs, csv_out.as_deref())?;

            let store = DirectoryStore::new(&settings.protocol_config_dir);
            let mut request = ExperimentRequest::new(experiment);
            request.schemes = if schemes.is_empty() {
                available_default_schemes(&ProtocolResolver::new(&catalog, &store))
            } else {
                schemes
            };
            if request.schemes.is_empty() {
                anyhow::bail!(
                    "no default scheme has a base record in {}",
                    settings.protocol_config_dir.display()
                );
            }
            if !traces.is_empty() && traces != ["all"] {
                request.traces = traces;
            }
            request.selection = selection;
            request.trial_count = num_runs;
            request.print_graph = print_graph;
            request.tiny_trace = tiny_trace;

            let cancel = CancelToken::new();
            let handler_token = cancel.clone();
            ctrlc::set_handler(move || handler_token.cancel())
                .context("failed to install Ctrl-C handler")?;

            let options = OrchestratorOptions {
                verbose,
                home,
                poll_interval: settings.poll_interval(),
            };
            let orchestrator = Orchestrator::new(ShellLauncher::new(&settings.shell), options, cancel);
            let mut driver = ExperimentDriver::new(
                &settings,
                ProtocolResolver::new(&catalog, &store),
                orchestrator,
            );
            let set = driver.run(&request)?;

            let csv = match &csv_out {
                Some(path) => Some(
                    write_csv(path, &set.csv_rows())
                        .with_context(|| format!("failed to write {}", path.display()))?,
                ),
                None => None,
            };
            if set.cancelled {
                tracing::warn!("run cancelled, reporting completed trials only");
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": run_set_to_json(&set),
                    "manifest": manifest_path(&settings, experiment).display().to_string(),
                    "csv": csv.map(|p| p.display().to_string()),
                })));
            }
            print_run_set(&set);
            if let Some(path) = csv {
                println!("csv: {}", path.display());
            }
        }
        Commands::Plan {
            scheme,
            experiment,
            traces,
            trial,
            num_runs,
            print_graph,
            tiny_trace,
            settings,
            catalog,
            json,
        } => {
            let home = home_dir();
            let settings = LabSettings::load_or_default(settings.as_deref(), home.as_deref())?;
            let catalog = load_catalog(catalog.as_deref())?;
            let store = DirectoryStore::new(&settings.protocol_config_dir);
            let config = ProtocolResolver::new(&catalog, &store)
                .resolve(&scheme)
                .with_context(|| format!("cannot resolve scheme '{}'", scheme))?;

            let mut request = ExperimentRequest::new(experiment.parse()?);
            if !traces.is_empty() && traces != ["all"] {
                request.traces = traces;
            }
            request.trial_count = num_runs.max(1);
            request.print_graph = print_graph;
            request.tiny_trace = tiny_trace;
            let trial = trial.clamp(1, request.trial_count);
            let preview = plan_preview(&config, &scheme, &settings, &request, trial);

            if json {
                let pipelines: Vec<Value> = preview
                    .iter()
                    .map(|(case, pipeline)| {
                        json!({
                            "uplink_trace": case.uplink_name,
                            "downlink_trace": case.downlink_name,
                            "digest": pipeline.digest(),
                            "phases": pipeline.phases().iter().map(|phase| json!({
                                "kind": phase.kind,
                                "background": phase.kind.is_background(),
                                "steps": phase.steps.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                            })).collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "scheme": scheme,
                    "experiment": request.experiment.as_str(),
                    "trial": trial,
                    "pipelines": pipelines,
                })));
            }
            println!("scheme: {}", config.name());
            println!("target_link: {}", config.target_link().as_str());
            for (case, pipeline) in &preview {
                println!();
                println!("# {} / {}", case.uplink_name, case.downlink_name);
                print!("{}", pipeline.render());
                println!("digest: {}", pipeline.digest());
            }
        }
        Commands::Gather {
            schemes,
            num_runs,
            experiment,
            csv_out,
            settings,
            json,
        } => {
            let settings = LabSettings::load_or_default(settings.as_deref(), home_dir().as_deref())?;
            let experiment: Experiment = experiment.parse()?;
            let gathered = gather_trials(
                &settings.results_root(),
                experiment.as_str(),
                &schemes,
                num_runs,
                experiment.delay_ms(),
            )?;
            let rows: Vec<CsvRow> = gathered
                .iter()
                .filter_map(|t| {
                    t.metrics.map(|m| {
                        CsvRow::new(&t.scheme, m, UNKNOWN_TRACE, UNKNOWN_TRACE).with_trial(t.trial)
                    })
                })
                .collect();
            let csv = match &csv_out {
                Some(path) => Some(
                    write_csv(path, &rows)
                        .with_context(|| format!("failed to write {}", path.display()))?,
                ),
                None => None,
            };
            let summaries: Vec<Value> = schemes
                .iter()
                .map(|scheme| {
                    let acc: MetricsAccumulator = gathered
                        .iter()
                        .filter(|t| &t.scheme == scheme)
                        .filter_map(|t| t.metrics.as_ref())
                        .collect();
                    json!({"scheme": scheme, "summary": acc.finish()})
                })
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "gather",
                    "experiment": experiment.as_str(),
                    "trials": gathered.iter().map(|t| json!({
                        "scheme": t.scheme,
                        "trial": t.trial,
                        "path": t.path.as_ref().map(|p| p.display().to_string()),
                        "metrics": t.metrics,
                    })).collect::<Vec<_>>(),
                    "schemes": summaries,
                    "csv": csv.map(|p| p.display().to_string()),
                })));
            }
            for row in &rows {
                println!("{}", row.render());
            }
            if let Some(path) = csv {
                println!("csv: {}", path.display());
            }
        }
        Commands::Schemes { catalog, json } => {
            let catalog = load_catalog(catalog.as_deref())?;
            if json {
                let entries: Vec<Value> = catalog
                    .schemes
                    .iter()
                    .map(|(name, entry)| {
                        json!({"scheme": name, "base": entry.base, "overrides": entry.overrides})
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "schemes",
                    "schemes": entries,
                })));
            }
            for (name, entry) in &catalog.schemes {
                if entry.overrides.is_empty() {
                    println!("{}", name);
                } else {
                    let keys: Vec<&str> = entry.overrides.keys().map(|k| k.as_str()).collect();
                    println!("{} (base {}; overrides {})", name, entry.base, keys.join(", "));
                }
            }
        }
    }
    Ok(None)
}

fn load_catalog(path: Option<&Path>) -> Result<SchemeCatalog> {
    match path {
        Some(path) => SchemeCatalog::load(path),
        None => Ok(SchemeCatalog::builtin()),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Gather { json, .. }
        | Commands::Schemes { json, .. } => *json,
    }
}

fn command_verbose(command: &Commands) -> bool {
    matches!(command, Commands::Run { verbose: true, .. })
}

fn run_set_to_json(set: &RunSet) -> Value {
    json!({
        "experiment": set.experiment,
        "started_at": set.started_at.to_rfc3339(),
        "finished_at": set.finished_at.to_rfc3339(),
        "trial_count": set.trial_count,
        "cancelled": set.cancelled,
        "schemes": set.schemes.iter().map(|s| json!({
            "scheme": s.scheme,
            "uplink_trace": s.uplink_trace,
            "downlink_trace": s.downlink_trace,
            "trials": s.trials.iter().map(|t| json!({
                "index": t.index,
                "executed": t.executed,
                "results": t.paths.results.display().to_string(),
                "outcome": t.outcome,
            })).collect::<Vec<_>>(),
            "summary": s.summary(),
        })).collect::<Vec<_>>(),
        "overall": set.overall(),
    })
}

fn print_run_set(set: &RunSet) {
    println!("experiment: {}", set.experiment);
    for results in &set.schemes {
        println!();
        println!(
            "{} [{} / {}]",
            results.scheme, results.uplink_trace, results.downlink_trace
        );
        for trial in &results.trials {
            match &trial.outcome {
                TrialOutcome::Measured { metrics } => println!(
                    "  trial {}: utilization {:.3}, signal delay {} ms, throughput {} Mbps, power {:.2}, per-packet delay {} ms",
                    trial.index,
                    metrics.utilization,
                    metrics.signal_delay,
                    metrics.average_throughput,
                    metrics.power_score,
                    metrics.per_packet_delay
                ),
                TrialOutcome::NotFound => println!(
                    "  trial {}: no results at {}",
                    trial.index,
                    trial.paths.results.display()
                ),
                TrialOutcome::Malformed { reason } => {
                    println!("  trial {}: malformed results ({})", trial.index, reason)
                }
                TrialOutcome::Failed { reason } => {
                    println!("  trial {}: failed ({})", trial.index, reason)
                }
                TrialOutcome::Cancelled => println!("  trial {}: cancelled", trial.index),
            }
        }
        if let Some(summary) = results.summary().filter(|s| s.trials > 1) {
            println!(
                "  mean over {} trials: utilization {:.3} ± {:.3}, signal delay {:.1} ± {:.1} ms, power {:.2}",
                summary.trials,
                summary.mean_utilization,
                summary.stddev_utilization,
                summary.mean_signal_delay,
                summary.stddev_signal_delay,
                summary.power_of_means()
            );
        }
    }
    if set.cancelled {
        println!();
        println!("cancelled: true");
    }
}
