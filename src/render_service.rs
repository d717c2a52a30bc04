//! Render service: the composition root of the engine
//!
//! `RenderService` owns the result cache, the admission controller and the
//! browser pool for the life of the process. One call to
//! [`RenderService::render`] runs cache lookup, admission, pool lease, the
//! render pipeline and cache store as a single attempt, inside the retry loop.
//! The admission slot and the lease are released on every exit path of an
//! attempt before the next one starts.
//!
//! # Examples
//!
//! ```rust,no_run
//! use card_render::{Config, RenderService};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = RenderService::new(Config::default()).await?;
//!
//!     let png = service
//!         .render_body(json!({"temp": "tempA", "content": "# Hello"}), false)
//!         .await?;
//!     println!("Rendered {} bytes", png.len());
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

use crate::chrome::ChromeFactory;
use crate::engine::BrowserFactory;
use crate::promo::apply_random_promo;
use crate::{
    format_bytes, format_duration, AdmissionController, AdmissionStats, BrowserPool,
    BrowserPoolStats, CacheStats, Config, PutOutcome, RenderError, RenderMetrics, RenderPipeline,
    RenderRequest, ResultCache, RetryPolicy,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub pool: BrowserPoolStats,
    pub admission: AdmissionStats,
    pub cache: CacheStats,
    pub uptime_secs: u64,
}

pub struct RenderService {
    config: Arc<Config>,
    cache: ResultCache,
    admission: Arc<AdmissionController>,
    pool: BrowserPool,
    pipeline: RenderPipeline,
    retry: RetryPolicy,
    metrics: RenderMetrics,
    started_at: Instant,
}

impl RenderService {
    /// Service backed by headless Chrome, with the configured pre-warm.
    pub async fn new(config: Config) -> Result<Self, RenderError> {
        let factory = Arc::new(ChromeFactory::new(config.clone()));
        let service = Self::with_factory(config, factory)?;
        service.warm_up().await;
        Ok(service)
    }

    /// Service over any browser factory; nothing is launched yet.
    pub fn with_factory(
        config: Config,
        factory: Arc<dyn BrowserFactory>,
    ) -> Result<Self, RenderError> {
        config.validate()?;
        let config = Arc::new(config);

        info!(
            "Render service: {} browsers, {} active renders, {} attempts, scale {}",
            config.max_concurrency,
            config.max_active_requests,
            config.max_retries,
            config.image_scale
        );

        Ok(Self {
            cache: ResultCache::new(&config.cache),
            admission: AdmissionController::new(config.max_active_requests),
            pool: BrowserPool::new(factory, &config),
            pipeline: RenderPipeline::new(Arc::clone(&config)),
            retry: RetryPolicy::from_config(&config),
            metrics: RenderMetrics::new(),
            started_at: Instant::now(),
            config,
        })
    }

    pub async fn warm_up(&self) -> usize {
        self.pool.warm_up(self.config.prewarm).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build a request from a JSON body and render it.
    ///
    /// With `promo` set the QR code fields are replaced by a promotional entry
    /// before the request is built, so the substitution is part of the cache key.
    pub async fn render_body(&self, body: Value, promo: bool) -> Result<Vec<u8>, RenderError> {
        let mut body = match body {
            Value::Object(map) => map,
            _ => {
                return Err(RenderError::InvalidRequest(
                    "body must be a JSON object".into(),
                ))
            }
        };
        if promo {
            let chosen = apply_random_promo(&mut body);
            debug!("Promo footer: {}", chosen.title);
        }

        let request = RenderRequest::from_body(body)?;
        self.render(&request).await
    }

    pub async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, RenderError> {
        let span = info_span!("render", id = %request.id, temp = %request.template);
        async {
            let start = Instant::now();
            let result = self
                .retry
                .run(|attempt| async move {
                    if attempt > 0 {
                        self.metrics.record_retry();
                    }
                    let result = self.attempt(request).await;
                    if let Err(e) = &result {
                        self.metrics.record_failure(e);
                    }
                    result
                })
                .await;

            self.refresh_gauges();
            match &result {
                Ok(png) => {
                    self.metrics.record_render(start.elapsed());
                    info!(
                        "Rendered {} in {}",
                        format_bytes(png.len()),
                        format_duration(start.elapsed())
                    );
                }
                Err(e) => warn!("Render failed: {}", e),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, request: &RenderRequest) -> Result<Vec<u8>, RenderError> {
        if let Some(png) = self.cache.get(&request.fingerprint) {
            self.metrics.cache_hits.increment(1);
            debug!("Cache hit");
            return Ok(png);
        }
        self.metrics.cache_misses.increment(1);

        let _slot = self
            .admission
            .acquire_slot(self.config.timeouts.queue)
            .await?;
        self.metrics.record_admission(&self.admission.stats());

        let lease = self.pool.acquire().await?;
        debug!("Leased browser {}", lease.id());
        let result = self.pipeline.run(lease.engine(), request).await;
        self.pool.release(lease).await;

        let output = result?;
        if self.cache.put(request.fingerprint.clone(), output.png.clone()) == PutOutcome::Rejected {
            self.metrics.cache_rejections.increment(1);
        }
        Ok(output.png)
    }

    /// Expired cache entries are dropped first so the cache figures are live.
    pub fn stats(&self) -> ServiceStats {
        self.cache.purge_expired();
        ServiceStats {
            pool: self.pool.stats(),
            admission: self.admission.stats(),
            cache: self.cache.stats(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Push the current pool, queue and cache sizes into the gauges.
    pub fn refresh_gauges(&self) {
        self.metrics.record_admission(&self.admission.stats());
        self.metrics.record_cache(&self.cache.stats());
        self.metrics.record_pool(&self.pool.stats());
    }

    /// Drain outstanding leases and close every browser.
    pub async fn shutdown(&self) {
        self.pool.shutdown(self.config.timeouts.queue).await;
    }
}
