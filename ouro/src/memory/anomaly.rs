//! Metric anomaly detection.
//!
//! Three threshold policies over a recent window of one metric type:
//! absolute value, percentage over a trailing baseline, and standard
//! deviations from the window mean (σ = 0 yields no anomalies).

use std::time::Duration;

use super::types::Metric;

/// Default trailing window used to compute the percentage baseline.
pub const DEFAULT_BASELINE_WINDOW: Duration = Duration::from_secs(3600);
/// Default standard-deviation threshold.
pub const DEFAULT_STDDEV_THRESHOLD: f64 = 3.0;

/// How a metric value qualifies as anomalous.
#[derive(Clone, Debug)]
pub enum ThresholdPolicy {
    /// `value > threshold`.
    Absolute { threshold: f64 },
    /// `(value - baseline) / baseline * 100 > threshold`, where the baseline
    /// is the mean of the metrics in the trailing `baseline_window` strictly
    /// before the value's timestamp.
    Percentage {
        threshold: f64,
        baseline_window: Duration,
    },
    /// `|value - mean| / stddev > threshold` over the whole window.
    StdDeviation { threshold: f64 },
}

impl ThresholdPolicy {
    pub fn percentage(threshold: f64) -> Self {
        ThresholdPolicy::Percentage {
            threshold,
            baseline_window: DEFAULT_BASELINE_WINDOW,
        }
    }

    pub fn std_deviation_default() -> Self {
        ThresholdPolicy::StdDeviation {
            threshold: DEFAULT_STDDEV_THRESHOLD,
        }
    }
}

/// Applies a policy to metrics of one type, ordered by timestamp ascending.
/// Returns the anomalous points in input order.
pub fn detect(metrics: &[Metric], policy: &ThresholdPolicy) -> Vec<Metric> {
    match policy {
        ThresholdPolicy::Absolute { threshold } => metrics
            .iter()
            .filter(|m| m.value > *threshold)
            .cloned()
            .collect(),

        ThresholdPolicy::Percentage {
            threshold,
            baseline_window,
        } => {
            let window_ms = baseline_window.as_millis() as i64;
            metrics
                .iter()
                .filter(|m| {
                    let prior: Vec<f64> = metrics
                        .iter()
                        .filter(|p| {
                            p.timestamp < m.timestamp && p.timestamp >= m.timestamp - window_ms
                        })
                        .map(|p| p.value)
                        .collect();
                    if prior.is_empty() {
                        return false;
                    }
                    let baseline = prior.iter().sum::<f64>() / prior.len() as f64;
                    if baseline == 0.0 {
                        return false;
                    }
                    (m.value - baseline) / baseline * 100.0 > *threshold
                })
                .cloned()
                .collect()
        }

        ThresholdPolicy::StdDeviation { threshold } => {
            if metrics.is_empty() {
                return Vec::new();
            }
            let n = metrics.len() as f64;
            let mean = metrics.iter().map(|m| m.value).sum::<f64>() / n;
            let variance = metrics
                .iter()
                .map(|m| (m.value - mean).powi(2))
                .sum::<f64>()
                / n;
            let stddev = variance.sqrt();
            if stddev == 0.0 {
                return Vec::new();
            }
            metrics
                .iter()
                .filter(|m| (m.value - mean).abs() / stddev > *threshold)
                .cloned()
                .collect()
        }
    }
}
