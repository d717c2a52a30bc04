//! In-memory browser engine for tests.
//!
//! The fake records what the pipeline asked of it and counts every launch,
//! page and close so tests can check resource accounting.

use crate::engine::{
    BoundingBox, BrowserEngine, BrowserFactory, CaptureClip, CardPage, IconLoad, ImageReport,
};
use crate::RenderError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDRfake";

#[derive(Debug, Clone)]
pub struct FakeBehavior {
    /// Card selector never appears
    pub missing_target: bool,
    pub bounds_missing: bool,
    pub content_height: f64,
    pub origin: (f64, f64),
    pub probe_fails: bool,
    pub icon: IconLoad,
    /// Image wait never resolves
    pub images_hang: bool,
    /// Time spent in navigation
    pub navigation_delay: Duration,
    /// Replaces the PNG returned by capture
    pub capture_bytes: Option<Vec<u8>>,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            missing_target: false,
            bounds_missing: false,
            content_height: 600.0,
            origin: (20.0, 40.0),
            probe_fails: false,
            icon: IconLoad::Loaded,
            images_hang: false,
            navigation_delay: Duration::from_millis(50),
            capture_bytes: None,
        }
    }
}

#[derive(Default)]
struct FakeState {
    launched: AtomicUsize,
    closed: AtomicUsize,
    extra_pages_closed: AtomicUsize,
    pages_open: AtomicUsize,
    pages_opened: AtomicUsize,
    peak_pages: AtomicUsize,
    navigation_failures: AtomicUsize,
    navigations: Mutex<Vec<String>>,
    viewports: Mutex<Vec<(u32, u32)>>,
    injections: Mutex<Vec<(String, String)>>,
    icon_requests: Mutex<Vec<String>>,
    captures: Mutex<Vec<CaptureClip>>,
}

pub struct FakeFactory {
    behavior: FakeBehavior,
    state: Arc<FakeState>,
}

impl FakeFactory {
    pub fn new(behavior: FakeBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            state: Arc::new(FakeState::default()),
        })
    }

    /// Make the next `count` navigations fail.
    pub fn fail_navigations(&self, count: usize) {
        self.state.navigation_failures.store(count, Ordering::SeqCst);
    }

    pub fn launched(&self) -> usize {
        self.state.launched.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn extra_pages_closed(&self) -> usize {
        self.state.extra_pages_closed.load(Ordering::SeqCst)
    }

    pub fn pages_open(&self) -> usize {
        self.state.pages_open.load(Ordering::SeqCst)
    }

    pub fn pages_opened(&self) -> usize {
        self.state.pages_opened.load(Ordering::SeqCst)
    }

    pub fn peak_pages(&self) -> usize {
        self.state.peak_pages.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.navigations.lock().clone()
    }

    pub fn viewports(&self) -> Vec<(u32, u32)> {
        self.state.viewports.lock().clone()
    }

    pub fn injections(&self) -> Vec<(String, String)> {
        self.state.injections.lock().clone()
    }

    pub fn icon_requests(&self) -> Vec<String> {
        self.state.icon_requests.lock().clone()
    }

    pub fn captures(&self) -> Vec<CaptureClip> {
        self.state.captures.lock().clone()
    }
}

#[async_trait]
impl BrowserFactory for FakeFactory {
    async fn launch(&self, id: usize) -> Result<Box<dyn BrowserEngine>, RenderError> {
        self.state.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEngine {
            id,
            behavior: self.behavior.clone(),
            state: Arc::clone(&self.state),
            open_pages: Arc::new(AtomicUsize::new(0)),
        }))
    }
}

struct FakeEngine {
    id: usize,
    behavior: FakeBehavior,
    state: Arc<FakeState>,
    open_pages: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserEngine for FakeEngine {
    fn id(&self) -> usize {
        self.id
    }

    async fn open_page(&self) -> Result<Box<dyn CardPage>, RenderError> {
        self.open_pages.fetch_add(1, Ordering::SeqCst);
        self.state.pages_opened.fetch_add(1, Ordering::SeqCst);
        let now = self.state.pages_open.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_pages.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(FakePage {
            behavior: self.behavior.clone(),
            state: Arc::clone(&self.state),
            engine_pages: Arc::clone(&self.open_pages),
        }))
    }

    async fn close_extra_pages(&self) -> Result<usize, RenderError> {
        let open = self.open_pages.load(Ordering::SeqCst);
        let extra = open.saturating_sub(1);
        self.open_pages.fetch_sub(extra, Ordering::SeqCst);
        self.state.pages_open.fetch_sub(extra, Ordering::SeqCst);
        self.state.extra_pages_closed.fetch_add(extra, Ordering::SeqCst);
        Ok(extra)
    }

    async fn probe(&self) -> Result<(), RenderError> {
        if self.behavior.probe_fails {
            return Err(RenderError::Page("target crashed".into()));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakePage {
    behavior: FakeBehavior,
    state: Arc<FakeState>,
    engine_pages: Arc<AtomicUsize>,
}

impl FakePage {
    fn bounds(&self) -> Option<BoundingBox> {
        if self.behavior.bounds_missing {
            return None;
        }
        Some(BoundingBox {
            x: self.behavior.origin.0,
            y: self.behavior.origin.1,
            width: 440.0,
            height: self.behavior.content_height,
        })
    }
}

#[async_trait]
impl CardPage for FakePage {
    async fn navigate(&self, url: &str) -> Result<(), RenderError> {
        self.state.navigations.lock().push(url.to_string());
        tokio::time::sleep(self.behavior.navigation_delay).await;

        let failed = self
            .state
            .navigation_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RenderError::NavigationFailed(format!("{url}: net::ERR_FAILED")));
        }
        Ok(())
    }

    async fn set_viewport(&self, width: u32, height: u32) -> Result<(), RenderError> {
        self.state.viewports.lock().push((width, height));
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        _selector: &str,
        _timeout: Duration,
    ) -> Result<bool, RenderError> {
        Ok(!self.behavior.missing_target)
    }

    async fn set_inner_html(&self, selector: &str, html: &str) -> Result<bool, RenderError> {
        self.state
            .injections
            .lock()
            .push((selector.to_string(), html.to_string()));
        Ok(true)
    }

    async fn load_icon(
        &self,
        _selector: &str,
        src: &str,
        _timeout: Duration,
    ) -> Result<IconLoad, RenderError> {
        self.state.icon_requests.lock().push(src.to_string());
        Ok(self.behavior.icon)
    }

    async fn fonts_ready(&self) -> Result<(), RenderError> {
        Ok(())
    }

    async fn images_settled(
        &self,
        _selector: &str,
        _per_image: Duration,
    ) -> Result<ImageReport, RenderError> {
        if self.behavior.images_hang {
            std::future::pending::<()>().await;
        }
        Ok(ImageReport {
            total: 2,
            failed: 0,
            timed_out: 0,
        })
    }

    async fn force_reflow(&self, _selector: &str) -> Result<(), RenderError> {
        Ok(())
    }

    async fn wait_layout_stable(
        &self,
        _selector: &str,
        _timeout: Duration,
    ) -> Result<bool, RenderError> {
        Ok(true)
    }

    async fn bounding_box(&self, _selector: &str) -> Result<Option<BoundingBox>, RenderError> {
        Ok(self.bounds())
    }

    async fn scroll_into_view(&self, _selector: &str) -> Result<(), RenderError> {
        Ok(())
    }

    async fn capture(&self, clip: CaptureClip) -> Result<Vec<u8>, RenderError> {
        self.state.captures.lock().push(clip);
        Ok(self
            .behavior
            .capture_bytes
            .clone()
            .unwrap_or_else(|| PNG_BYTES.to_vec()))
    }

    async fn close(self: Box<Self>) -> Result<(), RenderError> {
        self.engine_pages.fetch_sub(1, Ordering::SeqCst);
        self.state.pages_open.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
