use crate::results::LinkReport;
use serde::Serialize;

/// Scale applied to throughput/delay when computing the power score.
pub const POWER_SCALE: f64 = 1000.0;

/// Per-trial metrics derived from one results file.
///
/// `per_packet_delay` assumes a symmetric path: the configured one-way delay
/// is counted twice, then the measured queueing delay is added.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    pub average_capacity: f64,
    pub average_throughput: f64,
    pub signal_delay: f64,
    pub queuing_delay: f64,
    pub utilization: f64,
    pub power_score: f64,
    pub per_packet_delay: f64,
}

impl Metrics {
    pub fn derive(report: &LinkReport, delay_ms: u32) -> Self {
        Self {
            average_capacity: report.average_capacity,
            average_throughput: report.average_throughput,
            signal_delay: report.signal_delay,
            queuing_delay: report.queuing_delay,
            utilization: report.average_throughput / report.average_capacity,
            power_score: power_score(report.average_throughput, report.signal_delay),
            per_packet_delay: round_trip_delay(delay_ms) + report.queuing_delay,
        }
    }
}

pub fn power_score(throughput: f64, signal_delay: f64) -> f64 {
    POWER_SCALE * throughput / signal_delay
}

pub fn round_trip_delay(delay_ms: u32) -> f64 {
    2.0 * f64::from(delay_ms)
}
