//! Telemetry.
//!
//! Metrics emitted through the `metrics` facade are collected by a process-wide recorder, and periodically flushed as
//! structured log events.

use std::{
    fmt::Write as _,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::{AtomicStorage, Registry};
use snafu::Snafu;
use tokio::{select, sync::oneshot, task::JoinHandle, time::interval};
use tracing::{debug, info};

/// A telemetry error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TelemetryError {
    /// A global metrics recorder was already installed.
    #[snafu(display("a global metrics recorder has already been installed"))]
    RecorderAlreadyInstalled,

    /// The flush task did not shut down cleanly.
    #[snafu(display("telemetry flush task failed: {}", source))]
    FlushTaskFailed {
        /// Source of the error.
        source: tokio::task::JoinError,
    },
}

struct State {
    registry: Registry<Key, AtomicStorage>,
    metrics_prefix: String,
}

/// A metrics recorder backed by a registry of atomic handles.
///
/// All metric names are prefixed with the configured prefix, followed by a period (e.g. `<prefix>.<metric name>`).
#[derive(Clone)]
pub struct MetricsRecorder {
    state: Arc<State>,
}

impl MetricsRecorder {
    /// Creates a new `MetricsRecorder` with the given metrics prefix.
    pub fn new(metrics_prefix: impl Into<String>) -> Self {
        Self {
            state: Arc::new(State {
                registry: Registry::new(AtomicStorage),
                metrics_prefix: metrics_prefix.into(),
            }),
        }
    }

    fn prefix_key(&self, key: &Key) -> Key {
        if self.state.metrics_prefix.is_empty() {
            return key.clone();
        }
        Key::from_parts(format!("{}.{}", self.state.metrics_prefix, key.name()), key.labels())
    }

    /// Takes a snapshot of all registered metrics.
    ///
    /// Counters are reset to zero and histograms are drained, so each snapshot only covers what was recorded since
    /// the previous one. Gauges report their current value.
    pub fn snapshot(&self) -> Snapshot {
        let registry = &self.state.registry;

        let mut counters = registry
            .get_counter_handles()
            .into_iter()
            .map(|(key, counter)| (format_key(&key), counter.swap(0, Ordering::Relaxed)))
            .collect::<Vec<_>>();

        let mut gauges = registry
            .get_gauge_handles()
            .into_iter()
            .map(|(key, gauge)| (format_key(&key), f64::from_bits(gauge.load(Ordering::Relaxed))))
            .collect::<Vec<_>>();

        let mut histograms = registry
            .get_histogram_handles()
            .into_iter()
            .map(|(key, histogram)| {
                let mut summary = HistogramSummary::default();
                histogram.clear_with(|samples| summary.extend(samples));
                (format_key(&key), summary)
            })
            .collect::<Vec<_>>();

        counters.sort_by(|a, b| a.0.cmp(&b.0));
        gauges.sort_by(|a, b| a.0.cmp(&b.0));
        histograms.sort_by(|a, b| a.0.cmp(&b.0));

        Snapshot {
            counters,
            gauges,
            histograms,
        }
    }
}

impl Recorder for MetricsRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        let prefixed_key = self.prefix_key(key);
        self.state
            .registry
            .get_or_create_counter(&prefixed_key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        let prefixed_key = self.prefix_key(key);
        self.state
            .registry
            .get_or_create_gauge(&prefixed_key, |g| g.clone().into())
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        let prefixed_key = self.prefix_key(key);
        self.state
            .registry
            .get_or_create_histogram(&prefixed_key, |h| h.clone().into())
    }
}

/// Summary statistics for the samples recorded to a histogram.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HistogramSummary {
    /// Number of samples.
    pub count: u64,

    /// Smallest sample.
    pub min: f64,

    /// Largest sample.
    pub max: f64,

    /// Sum of all samples.
    pub sum: f64,
}

impl HistogramSummary {
    fn extend(&mut self, samples: &[f64]) {
        for sample in samples {
            if self.count == 0 {
                self.min = *sample;
                self.max = *sample;
            } else {
                self.min = self.min.min(*sample);
                self.max = self.max.max(*sample);
            }
            self.count += 1;
            self.sum += *sample;
        }
    }

    /// Returns the mean of all samples, or zero if there were none.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// A point-in-time view of all registered metrics, sorted by name.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Counter deltas since the previous snapshot.
    pub counters: Vec<(String, u64)>,

    /// Current gauge values.
    pub gauges: Vec<(String, f64)>,

    /// Histogram samples since the previous snapshot.
    pub histograms: Vec<(String, HistogramSummary)>,
}

impl Snapshot {
    /// Returns the counter delta for the given metric, if present.
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    /// Returns the histogram summary for the given metric, if present.
    pub fn histogram(&self, name: &str) -> Option<HistogramSummary> {
        self.histograms.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    fn emit(&self) {
        for (name, delta) in &self.counters {
            if *delta > 0 {
                info!(metric = %name, value = delta, "Counter.");
            }
        }

        for (name, value) in &self.gauges {
            info!(metric = %name, value, "Gauge.");
        }

        for (name, summary) in &self.histograms {
            if summary.count > 0 {
                info!(
                    metric = %name,
                    count = summary.count,
                    min = summary.min,
                    max = summary.max,
                    mean = summary.mean(),
                    "Histogram."
                );
            }
        }
    }
}

/// Formats a metric key as `name{label=value,...}`, or just `name` when there are no labels.
fn format_key(key: &Key) -> String {
    let mut formatted = key.name().to_string();
    let mut labels = key.labels().peekable();
    if labels.peek().is_some() {
        formatted.push('{');
        for (i, label) in labels.enumerate() {
            if i > 0 {
                formatted.push(',');
            }
            let _ = write!(formatted, "{}={}", label.key(), label.value());
        }
        formatted.push('}');
    }
    formatted
}

/// Handle to a running telemetry pipeline.
pub struct TelemetryHandle {
    stop_tx: oneshot::Sender<()>,
    flush_task: JoinHandle<()>,
}

impl TelemetryHandle {
    /// Starts periodically flushing the metrics collected by `recorder`.
    ///
    /// This does not install `recorder` as the global recorder.
    pub fn spawn(recorder: MetricsRecorder, flush_interval: Duration) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let flush_task = tokio::spawn(run_flusher(recorder, flush_interval, stop_rx));

        Self { stop_tx, flush_task }
    }

    /// Shuts down the telemetry pipeline.
    ///
    /// Stops the flush task, after it performs one final flush.
    ///
    /// # Errors
    ///
    /// If the flush task panicked or was cancelled, an error is returned.
    pub async fn shutdown(self) -> Result<(), TelemetryError> {
        let _ = self.stop_tx.send(());
        self.flush_task
            .await
            .map_err(|source| TelemetryError::FlushTaskFailed { source })
    }
}

async fn run_flusher(recorder: MetricsRecorder, flush_interval: Duration, mut stop_rx: oneshot::Receiver<()>) {
    let mut flush_interval = interval(flush_interval);
    flush_interval.tick().await;

    loop {
        select! {
            _ = flush_interval.tick() => recorder.snapshot().emit(),
            _ = &mut stop_rx => break,
        }
    }

    debug!("Performing final telemetry flush.");
    recorder.snapshot().emit();
}

/// Initializes the telemetry pipeline.
///
/// Installs a [`MetricsRecorder`] with the given prefix as the global recorder, and spawns a background task that
/// flushes the collected metrics every `flush_interval`.
///
/// # Errors
///
/// If a global recorder was already installed, an error will be returned.
pub fn initialize_telemetry(
    metrics_prefix: impl Into<String>, flush_interval: Duration,
) -> Result<TelemetryHandle, TelemetryError> {
    let recorder = MetricsRecorder::new(metrics_prefix);
    metrics::set_global_recorder(recorder.clone()).map_err(|_| TelemetryError::RecorderAlreadyInstalled)?;

    Ok(TelemetryHandle::spawn(recorder, flush_interval))
}
