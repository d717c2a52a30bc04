//! Browser pool management for concurrent render jobs
//!
//! The pool owns up to `max_concurrency` browser instances. Instances are
//! launched lazily when no idle one is available, leased exclusively to one
//! render, and on release either sanitized and recycled or destroyed. A
//! semaphore bounds leases; its permits are released only after the engine is
//! back in the idle list, so the next acquirer finds it there.

use crate::engine::{BrowserEngine, BrowserFactory};
use crate::{Config, RenderError};
use metrics::{register_counter, Counter};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Exclusive use of one browser instance.
///
/// Hand it back with [`BrowserPool::release`]. A lease that is simply dropped
/// frees its permit and lets the engine tear itself down.
pub struct BrowserLease {
    engine: Box<dyn BrowserEngine>,
    permit: OwnedSemaphorePermit,
}

impl BrowserLease {
    pub fn engine(&self) -> &dyn BrowserEngine {
        self.engine.as_ref()
    }

    pub fn id(&self) -> usize {
        self.engine.id()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BrowserPoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub leased: usize,
    pub launched: u64,
    pub recycled: u64,
    pub destroyed: u64,
    pub shutting_down: bool,
}

pub struct BrowserPool {
    factory: Arc<dyn BrowserFactory>,
    idle: Mutex<Vec<Box<dyn BrowserEngine>>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
    probe_timeout: Duration,
    next_id: AtomicUsize,
    launched: AtomicU64,
    recycled: AtomicU64,
    destroyed: AtomicU64,
    is_shutting_down: AtomicBool,
    launch_counter: Counter,
    destroy_counter: Counter,
}

impl BrowserPool {
    pub fn new(factory: Arc<dyn BrowserFactory>, config: &Config) -> Self {
        let capacity = config.max_concurrency.max(1);
        Self {
            factory,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout: config.timeouts.pool_acquire,
            probe_timeout: config.timeouts.protocol,
            next_id: AtomicUsize::new(0),
            launched: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            is_shutting_down: AtomicBool::new(false),
            launch_counter: register_counter!("card_render_browser_launches_total"),
            destroy_counter: register_counter!("card_render_browser_destroys_total"),
        }
    }

    /// Launch up to `count` idle instances ahead of demand.
    ///
    /// Failures are logged and skipped; the pool still launches lazily later.
    pub async fn warm_up(&self, count: usize) -> usize {
        let count = count.min(self.capacity);
        let mut ready = 0;

        for i in 0..count {
            // Stagger launches so instances do not race for the same resources
            if i > 0 {
                sleep(Duration::from_millis(500)).await;
            }

            match self.launch().await {
                Ok(engine) => {
                    self.idle.lock().push(engine);
                    ready += 1;
                }
                Err(e) => {
                    error!("Failed to pre-warm browser instance: {}", e);
                }
            }
        }

        info!("Browser pool pre-warmed with {} of {} instances", ready, count);
        ready
    }

    /// Lease an idle instance, launching one if none is idle.
    ///
    /// Waits up to the acquire timeout when every instance is leased.
    pub async fn acquire(&self) -> Result<BrowserLease, RenderError> {
        if self.is_shutting_down() {
            return Err(RenderError::PoolShuttingDown);
        }

        let permit = match timeout(self.acquire_timeout, Arc::clone(&self.permits).acquire_owned())
            .await
        {
            Ok(permit) => permit?,
            Err(_) => {
                warn!("No browser freed up within {:?}", self.acquire_timeout);
                return Err(RenderError::PoolExhausted(self.acquire_timeout));
            }
        };

        let idle = self.idle.lock().pop();
        let engine = match idle {
            Some(engine) => {
                debug!("Reusing browser instance {}", engine.id());
                engine
            }
            None => self.launch().await?,
        };

        Ok(BrowserLease { engine, permit })
    }

    /// Return a lease: close leftover pages, probe, then recycle or destroy.
    pub async fn release(&self, lease: BrowserLease) {
        let BrowserLease { engine, permit } = lease;
        let id = engine.id();

        if self.is_shutting_down() {
            self.destroy(engine).await;
            drop(permit);
            return;
        }

        match timeout(self.probe_timeout, engine.close_extra_pages()).await {
            Ok(Ok(0)) => {}
            Ok(Ok(closed)) => debug!("Closed {} leftover pages on browser {}", closed, id),
            Ok(Err(e)) => {
                warn!("Browser {} could not be sanitized: {}", id, e);
                self.destroy(engine).await;
                drop(permit);
                return;
            }
            Err(_) => {
                warn!("Browser {} timed out closing pages", id);
                self.destroy(engine).await;
                drop(permit);
                return;
            }
        }

        let alive = matches!(timeout(self.probe_timeout, engine.probe()).await, Ok(Ok(())));
        if !alive {
            warn!("Browser {} failed liveness probe, discarding", id);
            self.destroy(engine).await;
            drop(permit);
            return;
        }

        let overflow = {
            let mut idle = self.idle.lock();
            if idle.len() < self.capacity {
                idle.push(engine);
                None
            } else {
                Some(engine)
            }
        };

        match overflow {
            None => {
                self.recycled.fetch_add(1, Ordering::Relaxed);
                debug!("Browser {} returned to pool", id);
            }
            Some(engine) => {
                debug!("Pool at capacity, closing browser {}", id);
                self.destroy(engine).await;
            }
        }
        drop(permit);
    }

    /// Stop leasing, wait up to `drain_timeout` for outstanding leases, then
    /// close every idle instance.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        info!("Shutting down browser pool...");
        self.is_shutting_down.store(true, Ordering::SeqCst);

        match timeout(drain_timeout, self.permits.acquire_many(self.capacity as u32)).await {
            Ok(Ok(all)) => all.forget(),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                "{} browser leases still outstanding after {:?}",
                self.leased(),
                drain_timeout
            ),
        }
        self.permits.close();

        let engines: Vec<_> = std::mem::take(&mut *self.idle.lock());
        for engine in engines {
            self.destroy(engine).await;
        }

        info!("Browser pool shutdown complete");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn leased(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        self.capacity.saturating_sub(self.permits.available_permits())
    }

    pub fn stats(&self) -> BrowserPoolStats {
        BrowserPoolStats {
            capacity: self.capacity,
            idle: self.idle_count(),
            leased: self.leased(),
            launched: self.launched.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            shutting_down: self.is_shutting_down(),
        }
    }

    async fn launch(&self) -> Result<Box<dyn BrowserEngine>, RenderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let engine = self.factory.launch(id).await.map_err(|e| match e {
            RenderError::PoolCreationFailed(_) => e,
            other => RenderError::PoolCreationFailed(other.to_string()),
        })?;

        self.launched.fetch_add(1, Ordering::Relaxed);
        self.launch_counter.increment(1);
        Ok(engine)
    }

    async fn destroy(&self, engine: Box<dyn BrowserEngine>) {
        let id = engine.id();
        engine.close().await;
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        self.destroy_counter.increment(1);
        debug!("Browser instance {} destroyed", id);
    }
}
