use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

// (line, token) positions in the report `mm-throughput-graph` writes to stderr.
const CAPACITY_FIELD: (usize, usize) = (0, 2);
const THROUGHPUT_FIELD: (usize, usize) = (1, 2);
const QUEUING_DELAY_FIELD: (usize, usize) = (2, 5);
const SIGNAL_DELAY_FIELD: (usize, usize) = (3, 4);

const REPORT_LINES: usize = 4;

/// Raw link statistics as reported by the extractor, before any derivation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinkReport {
    pub average_capacity: f64,
    pub average_throughput: f64,
    pub queuing_delay: f64,
    pub signal_delay: f64,
}

/// Outcome of looking up a trial's results file. A missing file is an
/// ordinary outcome (the trial was skipped and nothing was there to reuse).
#[derive(Debug, Clone, PartialEq)]
pub enum ResultsLookup {
    Found(LinkReport),
    NotFound,
}

impl ResultsLookup {
    pub fn found(&self) -> Option<&LinkReport> {
        match self {
            ResultsLookup::Found(report) => Some(report),
            ResultsLookup::NotFound => None,
        }
    }
}

#[derive(Debug, Error)]
#[error("malformed results file {}: {reason}", path.display())]
pub struct MalformedResults {
    pub path: PathBuf,
    pub reason: String,
}

pub fn parse_results(path: &Path) -> Result<ResultsLookup, MalformedResults> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ResultsLookup::NotFound),
        Err(e) => {
            return Err(MalformedResults {
                path: path.to_path_buf(),
                reason: format!("unreadable: {}", e),
            })
        }
    };
    parse_report(&raw)
        .map(ResultsLookup::Found)
        .map_err(|reason| MalformedResults {
            path: path.to_path_buf(),
            reason,
        })
}

/// Parses the four-line report body. Tokens are split on single spaces so
/// positions line up with the extractor's layout.
pub fn parse_report(raw: &str) -> Result<LinkReport, String> {
    let lines: Vec<&str> = raw.lines().take(REPORT_LINES).collect();
    if lines.len() < REPORT_LINES {
        return Err(format!(
            "expected {} lines, found {}",
            REPORT_LINES,
            lines.len()
        ));
    }
    let report = LinkReport {
        average_capacity: rate_field(&lines, CAPACITY_FIELD)?,
        average_throughput: rate_field(&lines, THROUGHPUT_FIELD)?,
        queuing_delay: delay_field(&lines, QUEUING_DELAY_FIELD)?,
        signal_delay: delay_field(&lines, SIGNAL_DELAY_FIELD)?,
    };
    if report.average_capacity <= 0.0 {
        return Err("average capacity must be positive".to_string());
    }
    if report.signal_delay <= 0.0 {
        return Err("signal delay must be positive".to_string());
    }
    Ok(report)
}

fn tokens(line: &str) -> Vec<&str> {
    line.trim_end().split(' ').collect()
}

fn rate_field(lines: &[&str], (line, index): (usize, usize)) -> Result<f64, String> {
    let tokens = tokens(lines[line]);
    let token = tokens
        .get(index)
        .ok_or_else(|| format!("line {}: no token at position {}", line + 1, index))?;
    parse_number(token, line)
}

fn delay_field(lines: &[&str], (line, index): (usize, usize)) -> Result<f64, String> {
    let tokens = tokens(lines[line]);
    // the figure precedes the unit; extra percentile figures push it right
    let position = index.max(tokens.len().saturating_sub(2));
    let token = tokens
        .get(position)
        .ok_or_else(|| format!("line {}: no token at position {}", line + 1, index))?;
    parse_number(token, line)
}

fn parse_number(token: &str, line: usize) -> Result<f64, String> {
    let value: f64 = token
        .parse()
        .map_err(|_| format!("line {}: '{}' is not a number", line + 1, token))?;
    if !value.is_finite() {
        return Err(format!("line {}: '{}' is not finite", line + 1, token));
    }
    Ok(value)
}
