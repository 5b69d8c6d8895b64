use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Process-wide metrics registry for adaptive stage execution.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    stage_executions: CounterVec,
    stage_reuses: CounterVec,
    stage_execute_seconds: HistogramVec,
    broadcast_demotions: CounterVec,
    skew_splits: CounterVec,
    post_shuffle_partitions: GaugeVec,
    shuffle_bytes_written: CounterVec,
}

impl MetricsRegistry {
    /// Create a registry with all adaptive-execution metric families registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record one completed stage execution.
    pub fn record_stage_execution(&self, kind: &str, secs: f64) {
        self.inner
            .stage_executions
            .with_label_values(&[kind])
            .inc();
        self.inner
            .stage_execute_seconds
            .with_label_values(&[kind])
            .observe(secs.max(0.0));
    }

    /// Record one exchange collapsed onto an already-planned stage.
    pub fn inc_stage_reuse(&self, kind: &str) {
        self.inner.stage_reuses.with_label_values(&[kind]).inc();
    }

    /// Record one sort-merge join demoted to a broadcast-hash join.
    pub fn inc_broadcast_demotion(&self) {
        self.inner
            .broadcast_demotions
            .with_label_values(&["join"])
            .inc();
    }

    /// Record skew sub-joins produced for one rewritten join.
    pub fn add_skew_splits(&self, splits: u64) {
        self.inner
            .skew_splits
            .with_label_values(&["join"])
            .inc_by(splits as f64);
    }

    /// Record the post-shuffle partition count chosen for a stage's inputs.
    pub fn set_post_shuffle_partitions(&self, stage_id: u64, partitions: u64) {
        self.inner
            .post_shuffle_partitions
            .with_label_values(&[&stage_id.to_string()])
            .set(partitions as f64);
    }

    /// Record map-output bytes produced by a completed shuffle stage.
    pub fn add_shuffle_bytes_written(&self, stage_id: u64, bytes: u64) {
        self.inner
            .shuffle_bytes_written
            .with_label_values(&[&stage_id.to_string()])
            .inc_by(bytes as f64);
    }

    /// Render all registered families in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let stage_executions = CounterVec::new(
            Opts::new("sf_stage_executions_total", "Completed stage executions"),
            &["kind"],
        )
        .expect("metric opts");
        let stage_reuses = CounterVec::new(
            Opts::new("sf_stage_reuses_total", "Exchanges collapsed onto existing stages"),
            &["kind"],
        )
        .expect("metric opts");
        let stage_execute_seconds = HistogramVec::new(
            HistogramOpts::new("sf_stage_execute_seconds", "Stage execution wall time"),
            &["kind"],
        )
        .expect("metric opts");
        let broadcast_demotions = CounterVec::new(
            Opts::new(
                "sf_broadcast_demotions_total",
                "Sort-merge joins demoted to broadcast-hash joins",
            ),
            &["op"],
        )
        .expect("metric opts");
        let skew_splits = CounterVec::new(
            Opts::new("sf_skew_splits_total", "Skew sub-joins produced by rewrites"),
            &["op"],
        )
        .expect("metric opts");
        let post_shuffle_partitions = GaugeVec::new(
            Opts::new(
                "sf_post_shuffle_partitions",
                "Coalesced partition count chosen per stage",
            ),
            &["stage"],
        )
        .expect("metric opts");
        let shuffle_bytes_written = CounterVec::new(
            Opts::new("sf_shuffle_bytes_written_total", "Map-output bytes per stage"),
            &["stage"],
        )
        .expect("metric opts");

        registry
            .register(Box::new(stage_executions.clone()))
            .expect("register");
        registry
            .register(Box::new(stage_reuses.clone()))
            .expect("register");
        registry
            .register(Box::new(stage_execute_seconds.clone()))
            .expect("register");
        registry
            .register(Box::new(broadcast_demotions.clone()))
            .expect("register");
        registry
            .register(Box::new(skew_splits.clone()))
            .expect("register");
        registry
            .register(Box::new(post_shuffle_partitions.clone()))
            .expect("register");
        registry
            .register(Box::new(shuffle_bytes_written.clone()))
            .expect("register");

        Self {
            registry,
            stage_executions,
            stage_reuses,
            stage_execute_seconds,
            broadcast_demotions,
            skew_splits,
            post_shuffle_partitions,
            shuffle_bytes_written,
        }
    }
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Shared process-wide registry used when no explicit registry is wired in.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_renders() {
        let metrics = MetricsRegistry::new();
        metrics.record_stage_execution("shuffle", 0.25);
        metrics.inc_broadcast_demotion();
        metrics.add_skew_splits(5);
        metrics.set_post_shuffle_partitions(3, 2);
        let text = metrics.render_prometheus();
        assert!(text.contains("sf_stage_executions_total"));
        assert!(text.contains("sf_skew_splits_total"));
    }
}
