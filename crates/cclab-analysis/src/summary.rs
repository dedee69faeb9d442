use crate::metrics::{power_score, Metrics};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Moments {
    sum: f64,
    sum_sq: f64,
}

impl Moments {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.sum_sq += value * value;
    }

    fn merge(self, other: Moments) -> Moments {
        Moments {
            sum: self.sum + other.sum,
            sum_sq: self.sum_sq + other.sum_sq,
        }
    }

    fn mean(&self, n: usize) -> f64 {
        self.sum / n as f64
    }

    // sample standard deviation; a single trial has no spread
    fn stddev(&self, n: usize) -> f64 {
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean(n);
        let var = (self.sum_sq - n as f64 * mean * mean) / (n as f64 - 1.0);
        var.max(0.0).sqrt()
    }
}

/// Running reduction over per-trial metrics.
///
/// Only sums are kept, so two accumulators built from disjoint trial sets can
/// be merged in any grouping and yield the same aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsAccumulator {
    count: usize,
    utilization: Moments,
    signal_delay: Moments,
    throughput: Moments,
    power_score: Moments,
    queuing_delay: Moments,
    per_packet_delay: Moments,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metrics: &Metrics) {
        self.count += 1;
        self.utilization.push(metrics.utilization);
        self.signal_delay.push(metrics.signal_delay);
        self.throughput.push(metrics.average_throughput);
        self.power_score.push(metrics.power_score);
        self.queuing_delay.push(metrics.queuing_delay);
        self.per_packet_delay.push(metrics.per_packet_delay);
    }

    pub fn merge(self, other: MetricsAccumulator) -> MetricsAccumulator {
        MetricsAccumulator {
            count: self.count + other.count,
            utilization: self.utilization.merge(other.utilization),
            signal_delay: self.signal_delay.merge(other.signal_delay),
            throughput: self.throughput.merge(other.throughput),
            power_score: self.power_score.merge(other.power_score),
            queuing_delay: self.queuing_delay.merge(other.queuing_delay),
            per_packet_delay: self.per_packet_delay.merge(other.per_packet_delay),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `None` when no trial contributed metrics.
    pub fn finish(&self) -> Option<AggregateMetrics> {
        let n = self.count;
        if n == 0 {
            return None;
        }
        Some(AggregateMetrics {
            trials: n,
            mean_utilization: self.utilization.mean(n),
            stddev_utilization: self.utilization.stddev(n),
            mean_signal_delay: self.signal_delay.mean(n),
            stddev_signal_delay: self.signal_delay.stddev(n),
            mean_throughput: self.throughput.mean(n),
            mean_power_score: self.power_score.mean(n),
            mean_queuing_delay: self.queuing_delay.mean(n),
            mean_per_packet_delay: self.per_packet_delay.mean(n),
        })
    }
}

impl<'a> Extend<&'a Metrics> for MetricsAccumulator {
    fn extend<I: IntoIterator<Item = &'a Metrics>>(&mut self, iter: I) {
        for m in iter {
            self.push(m);
        }
    }
}

impl<'a> FromIterator<&'a Metrics> for MetricsAccumulator {
    fn from_iter<I: IntoIterator<Item = &'a Metrics>>(iter: I) -> Self {
        let mut acc = MetricsAccumulator::new();
        acc.extend(iter);
        acc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregateMetrics {
    pub trials: usize,
    pub mean_utilization: f64,
    pub stddev_utilization: f64,
    pub mean_signal_delay: f64,
    pub stddev_signal_delay: f64,
    pub mean_throughput: f64,
    pub mean_power_score: f64,
    pub mean_queuing_delay: f64,
    pub mean_per_packet_delay: f64,
}

impl AggregateMetrics {
    /// Power score of the mean throughput over the mean signal delay, as
    /// opposed to the mean of per-trial power scores.
    pub fn power_of_means(&self) -> f64 {
        power_score(self.mean_throughput, self.mean_signal_delay)
    }
}
