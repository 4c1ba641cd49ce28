use indicatif::{ProgressBar, ProgressStyle};
use segweave_engine::hls::{ProgressHook, ThroughputEstimator};
use std::time::Duration;

use super::size::{format_bytes, format_rate};

fn segment_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.green/white}] {pos}/{len} segments {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Progress bar fed by the engine's worker completions.
pub struct IndicatifProgress {
    bar: ProgressBar,
    estimator: ThroughputEstimator,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(segment_style());
        Self {
            bar,
            estimator: ThroughputEstimator::new(),
        }
    }

    /// Counts everything, renders nothing
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            estimator: ThroughputEstimator::new(),
        }
    }

    fn refresh_message(&self) {
        let snapshot = self.estimator.snapshot();
        let estimate = snapshot
            .estimated_total_size
            .map(format_bytes)
            .unwrap_or_else(|| "?".to_string());
        self.bar.set_message(format!(
            "{} of ~{} @ {}",
            format_bytes(snapshot.bytes_received),
            estimate,
            format_rate(snapshot.rate)
        ));
    }
}

impl ProgressHook for IndicatifProgress {
    fn set_total(&self, total: usize) {
        self.estimator.set_total(total);
        self.bar.set_length(total as u64);
        self.bar.enable_steady_tick(Duration::from_millis(500));
    }

    fn on_unit_complete(&self, bytes_received: u64, elapsed: Duration) {
        self.estimator.on_unit_complete(bytes_received, elapsed);
        self.refresh_message();
    }

    fn on_unit_attempted(&self) {
        self.estimator.on_unit_attempted();
        self.bar.inc(1);
    }

    fn finish(&self) {
        self.refresh_message();
        self.bar.finish();
    }
}
