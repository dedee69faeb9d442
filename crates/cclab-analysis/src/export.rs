use crate::metrics::Metrics;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Placeholder written for trace columns when the trace names are unknown.
pub const UNKNOWN_TRACE: &str = "_";

const SEPARATOR: &str = ", ";

/// One row of the aggregated results table.
///
/// Column layout is positional and shared with the plotting scripts:
/// `scheme, utilization, delay, throughput, power, queuing_delay,
/// per_packet_delay, uplink_trace, downlink_trace[, trial]`. The trial index
/// is trailing so readers that index columns keep working.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvRow {
    pub scheme: String,
    pub metrics: Metrics,
    pub uplink_trace: String,
    pub downlink_trace: String,
    pub trial: Option<usize>,
}

impl CsvRow {
    pub fn new(scheme: &str, metrics: Metrics, uplink_trace: &str, downlink_trace: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            metrics,
            uplink_trace: uplink_trace.to_string(),
            downlink_trace: downlink_trace.to_string(),
            trial: None,
        }
    }

    pub fn with_trial(mut self, trial: usize) -> Self {
        self.trial = Some(trial);
        self
    }

    pub fn render(&self) -> String {
        let m = &self.metrics;
        let mut fields = vec![
            self.scheme.clone(),
            m.utilization.to_string(),
            m.signal_delay.to_string(),
            m.average_throughput.to_string(),
            m.power_score.to_string(),
            m.queuing_delay.to_string(),
            m.per_packet_delay.to_string(),
            self.uplink_trace.clone(),
            self.downlink_trace.clone(),
        ];
        if let Some(trial) = self.trial {
            fields.push(trial.to_string());
        }
        fields.join(SEPARATOR)
    }
}

/// Appends `.csv` when the requested output name has no such extension.
pub fn csv_path(requested: &Path) -> PathBuf {
    match requested.extension().and_then(|e| e.to_str()) {
        Some("csv") => requested.to_path_buf(),
        _ => {
            let mut name = requested.as_os_str().to_os_string();
            name.push(".csv");
            PathBuf::from(name)
        }
    }
}

/// Writes rows in iteration order. Returns the path actually written.
pub fn write_csv(requested: &Path, rows: &[CsvRow]) -> io::Result<PathBuf> {
    let path = csv_path(requested);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut out = BufWriter::new(File::create(&path)?);
    for row in rows {
        writeln!(out, "{}", row.render())?;
    }
    out.flush()?;
    Ok(path)
}
