use crate::{AdmissionStats, BrowserPoolStats, CacheStats, RenderError};
use metrics::{
    increment_counter, register_counter, register_gauge, register_histogram, Counter, Gauge,
    Histogram,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

/// Install the Prometheus recorder for this process.
///
/// Handles registered before this call stay no-ops, so install it before
/// building the render service.
pub fn install_prometheus() -> Result<PrometheusHandle, RenderError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| RenderError::Configuration(format!("metrics recorder: {e}")))?;
    info!("Prometheus recorder installed");
    Ok(handle)
}

pub struct RenderMetrics {
    pub renders: Counter,
    pub retries: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_rejections: Counter,
    pub queue_timeouts: Counter,
    pub render_duration: Histogram,
    pub active_requests: Gauge,
    pub queued_requests: Gauge,
    pub cache_bytes: Gauge,
    pub cache_entries: Gauge,
    pub pool_idle: Gauge,
    pub pool_leased: Gauge,
}

impl RenderMetrics {
    pub fn new() -> Self {
        Self {
            renders: register_counter!("card_render_renders_total"),
            retries: register_counter!("card_render_retries_total"),
            cache_hits: register_counter!("card_render_cache_hits_total"),
            cache_misses: register_counter!("card_render_cache_misses_total"),
            cache_rejections: register_counter!("card_render_cache_rejections_total"),
            queue_timeouts: register_counter!("card_render_queue_timeouts_total"),
            render_duration: register_histogram!("card_render_duration_seconds"),
            active_requests: register_gauge!("card_render_active_requests"),
            queued_requests: register_gauge!("card_render_queued_requests"),
            cache_bytes: register_gauge!("card_render_cache_bytes"),
            cache_entries: register_gauge!("card_render_cache_entries"),
            pool_idle: register_gauge!("card_render_pool_idle"),
            pool_leased: register_gauge!("card_render_pool_leased"),
        }
    }

    pub fn record_render(&self, duration: Duration) {
        self.renders.increment(1);
        self.render_duration.record(duration.as_secs_f64());
    }

    /// Count a failed attempt under its error kind.
    pub fn record_failure(&self, error: &RenderError) {
        increment_counter!("card_render_failures_total", "kind" => error.kind());
        if matches!(error, RenderError::QueueTimeout(_)) {
            self.queue_timeouts.increment(1);
        }
    }

    pub fn record_retry(&self) {
        self.retries.increment(1);
    }

    pub fn record_admission(&self, stats: &AdmissionStats) {
        self.active_requests.set(stats.active as f64);
        self.queued_requests.set(stats.queued as f64);
    }

    pub fn record_cache(&self, stats: &CacheStats) {
        self.cache_bytes.set(stats.bytes as f64);
        self.cache_entries.set(stats.entries as f64);
    }

    pub fn record_pool(&self, stats: &BrowserPoolStats) {
        self.pool_idle.set(stats.idle as f64);
        self.pool_leased.set(stats.leased as f64);
    }
}

impl Default for RenderMetrics {
    fn default() -> Self {
        Self::new()
    }
}
