//! Results extraction and reduction for congestion-control experiments.
//!
//! Reads the statistics report written by `mm-throughput-graph`, derives
//! per-trial metrics, folds them into aggregates and renders result rows.

pub mod export;
pub mod gather;
pub mod metrics;
pub mod results;
pub mod summary;

pub use export::{csv_path, write_csv, CsvRow, UNKNOWN_TRACE};
pub use gather::{gather_trials, multi_run_dir, GatherError, GatheredTrial, MULTI_RUN_DIR};
pub use metrics::{power_score, round_trip_delay, Metrics, POWER_SCALE};
pub use results::{parse_report, parse_results, LinkReport, MalformedResults, ResultsLookup};
pub use summary::{AggregateMetrics, MetricsAccumulator};
