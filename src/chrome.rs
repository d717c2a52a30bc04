//! Chrome implementation of the engine traits
//!
//! Each [`ChromeEngine`] owns one headless Chrome process and the task that
//! drives its DevTools Protocol connection. Pages are driven with CDP commands
//! and small in-page scripts that resolve on browser signals (mutation
//! observer, font and image events) rather than fixed sleeps.

use crate::engine::{
    BoundingBox, BrowserEngine, BrowserFactory, CaptureClip, CardPage, IconLoad, ImageReport,
};
use crate::{create_browser_config, Config, RenderError};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventDomContentEventFired, NavigateParams, Viewport as ClipViewport,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct ChromeFactory {
    config: Config,
}

impl ChromeFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserFactory for ChromeFactory {
    async fn launch(&self, id: usize) -> Result<Box<dyn BrowserEngine>, RenderError> {
        let user_data_dir =
            std::env::temp_dir().join(format!("card-render-{}-{}", std::process::id(), id));
        tokio::fs::create_dir_all(&user_data_dir).await.map_err(|e| {
            RenderError::PoolCreationFailed(format!("Failed to create user data dir: {e}"))
        })?;

        let browser_config = create_browser_config(&self.config, &user_data_dir.to_string_lossy());
        let launched = match browser_config {
            Ok(browser_config) => Browser::launch(browser_config)
                .await
                .map_err(|e| RenderError::PoolCreationFailed(e.to_string())),
            Err(e) => Err(e),
        };
        let (browser, mut handler) = match launched {
            Ok(launched) => launched,
            Err(e) => {
                remove_profile_dir(&user_data_dir).await;
                return Err(e);
            }
        };

        // The handler is a stream that must be polled for the CDP connection to make progress
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("Browser {} handler error: {}", id, e);
                    break;
                }
            }
            debug!("Browser {} handler stream ended", id);
        });

        info!("Browser instance {} launched", id);
        Ok(Box::new(ChromeEngine {
            id,
            browser,
            handler: handler_task,
            user_data_dir: Some(user_data_dir),
            navigation_timeout: self.config.timeouts.navigation,
            screenshot_timeout: self.config.timeouts.screenshot,
        }))
    }
}

pub struct ChromeEngine {
    id: usize,
    browser: Browser,
    handler: tokio::task::JoinHandle<()>,
    /// Profile directory, removed once the process is gone
    user_data_dir: Option<PathBuf>,
    navigation_timeout: Duration,
    screenshot_timeout: Duration,
}

#[async_trait]
impl BrowserEngine for ChromeEngine {
    fn id(&self) -> usize {
        self.id
    }

    async fn open_page(&self) -> Result<Box<dyn CardPage>, RenderError> {
        let page = self.browser.new_page("about:blank").await?;
        Ok(Box::new(ChromePage {
            page,
            navigation_timeout: self.navigation_timeout,
            screenshot_timeout: self.screenshot_timeout,
        }))
    }

    async fn close_extra_pages(&self) -> Result<usize, RenderError> {
        let pages = self.browser.pages().await?;
        let mut closed = 0;
        for page in pages.into_iter().skip(1) {
            page.close().await?;
            closed += 1;
        }
        Ok(closed)
    }

    async fn probe(&self) -> Result<(), RenderError> {
        if self.handler.is_finished() {
            return Err(RenderError::Page(format!(
                "browser {} connection handler stopped",
                self.id
            )));
        }
        self.browser.version().await?;
        Ok(())
    }

    async fn close(self: Box<Self>) {
        let mut this = self;
        if let Err(e) = this.browser.close().await {
            debug!("Browser {} close: {}", this.id, e);
        }
        if let Err(e) = this.browser.wait().await {
            debug!("Browser {} wait: {}", this.id, e);
        }
        this.handler.abort();
        if let Some(dir) = this.user_data_dir.take() {
            remove_profile_dir(&dir).await;
        }
        info!("Browser instance {} closed", this.id);
    }
}

impl Drop for ChromeEngine {
    fn drop(&mut self) {
        // Browser's own drop kills the process; the connection task goes with it
        self.handler.abort();
        if let Some(dir) = self.user_data_dir.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { remove_profile_dir(&dir).await });
                }
                Err(_) => warn!("Leaving browser profile {} behind", dir.display()),
            }
        }
    }
}

async fn remove_profile_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed browser profile {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove browser profile {}: {}", dir.display(), e),
    }
}

/// A command that hit the connection's request limit is reported as the
/// step's own timeout.
fn step_error(err: CdpError, on_timeout: RenderError) -> RenderError {
    match err {
        CdpError::Timeout => on_timeout,
        other => other.into(),
    }
}

pub struct ChromePage {
    page: Page,
    navigation_timeout: Duration,
    screenshot_timeout: Duration,
}

impl ChromePage {
    async fn eval(&self, script: String) -> Result<Value, RenderError> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(RenderError::Page)?;
        let result = self.page.evaluate_expression(params).await?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }
}

fn js_str(s: &str) -> String {
    // JSON string literals are valid JavaScript string literals
    Value::String(s.to_string()).to_string()
}

#[async_trait]
impl CardPage for ChromePage {
    async fn navigate(&self, url: &str) -> Result<(), RenderError> {
        let mut dom_ready = self
            .page
            .event_listener::<EventDomContentEventFired>()
            .await?;

        let navigation = self.page.execute(NavigateParams::new(url));
        tokio::pin!(navigation);

        tokio::select! {
            response = &mut navigation => {
                let response = response.map_err(|e| {
                    step_error(e, RenderError::NavigationTimeout(self.navigation_timeout))
                })?;
                if let Some(error_text) = &response.result.error_text {
                    return Err(RenderError::NavigationFailed(format!("{url}: {error_text}")));
                }
                dom_ready.next().await;
                Ok(())
            }
            fired = dom_ready.next() => match fired {
                Some(_) => Ok(()),
                None => Err(RenderError::NavigationFailed(format!("{url}: page closed"))),
            },
        }
    }

    async fn set_viewport(&self, width: u32, height: u32) -> Result<(), RenderError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(width)
            .height(height)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(RenderError::Page)?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, RenderError> {
        let script = format!(
            r#"(() => new Promise(resolve => {{
    const sel = {sel};
    if (document.querySelector(sel)) return resolve(true);
    const observer = new MutationObserver(() => {{
        if (document.querySelector(sel)) {{
            observer.disconnect();
            clearTimeout(timer);
            resolve(true);
        }}
    }});
    const timer = setTimeout(() => {{
        observer.disconnect();
        resolve(!!document.querySelector(sel));
    }}, {ms});
    observer.observe(document.documentElement, {{
        childList: true,
        subtree: true,
        attributes: true,
    }});
}}))()"#,
            sel = js_str(selector),
            ms = timeout.as_millis()
        );
        Ok(self.eval(script).await?.as_bool().unwrap_or(false))
    }

    async fn set_inner_html(&self, selector: &str, html: &str) -> Result<bool, RenderError> {
        let script = format!(
            r#"(() => {{
    const el = document.querySelector({sel});
    if (!el) return false;
    el.innerHTML = {html};
    return true;
}})()"#,
            sel = js_str(selector),
            html = js_str(html)
        );
        Ok(self.eval(script).await?.as_bool().unwrap_or(false))
    }

    async fn load_icon(
        &self,
        selector: &str,
        src: &str,
        timeout: Duration,
    ) -> Result<IconLoad, RenderError> {
        let script = format!(
            r#"(() => new Promise(resolve => {{
    const img = document.querySelector({sel});
    if (!img) return resolve("missing");
    const timer = setTimeout(() => resolve("timeout"), {ms});
    const settle = outcome => () => {{ clearTimeout(timer); resolve(outcome); }};
    img.addEventListener("load", settle("loaded"), {{ once: true }});
    img.addEventListener("error", settle("failed"), {{ once: true }});
    img.src = {src};
}}))()"#,
            sel = js_str(selector),
            src = js_str(src),
            ms = timeout.as_millis()
        );
        let outcome = match self.eval(script).await?.as_str() {
            Some("loaded") => IconLoad::Loaded,
            Some("missing") => IconLoad::Missing,
            Some("timeout") => IconLoad::TimedOut,
            _ => IconLoad::Failed,
        };
        Ok(outcome)
    }

    async fn fonts_ready(&self) -> Result<(), RenderError> {
        self.eval("document.fonts.ready.then(() => true)".to_string())
            .await?;
        Ok(())
    }

    async fn images_settled(
        &self,
        selector: &str,
        per_image: Duration,
    ) -> Result<ImageReport, RenderError> {
        let script = format!(
            r#"(() => {{
    const root = document.querySelector({sel});
    if (!root) return {{ total: 0, failed: 0, timed_out: 0 }};
    const waits = Array.from(root.querySelectorAll("img")).map(img => {{
        if (img.complete) return Promise.resolve(img.naturalWidth > 0 ? "loaded" : "failed");
        return new Promise(resolve => {{
            const timer = setTimeout(() => resolve("timeout"), {ms});
            const settle = outcome => () => {{ clearTimeout(timer); resolve(outcome); }};
            img.addEventListener("load", settle("loaded"), {{ once: true }});
            img.addEventListener("error", settle("failed"), {{ once: true }});
        }});
    }});
    return Promise.all(waits).then(results => ({{
        total: results.length,
        failed: results.filter(r => r === "failed").length,
        timed_out: results.filter(r => r === "timeout").length,
    }}));
}})()"#,
            sel = js_str(selector),
            ms = per_image.as_millis()
        );
        let value = self.eval(script).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn force_reflow(&self, selector: &str) -> Result<(), RenderError> {
        let script = format!(
            r#"(() => {{
    const el = document.querySelector({sel}) || document.body;
    void el.offsetHeight;
    el.getBoundingClientRect();
    return true;
}})()"#,
            sel = js_str(selector)
        );
        self.eval(script).await?;
        Ok(())
    }

    async fn wait_layout_stable(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, RenderError> {
        let script = format!(
            r#"(() => new Promise(resolve => {{
    const el = document.querySelector({sel});
    if (!el) return resolve(false);
    const deadline = performance.now() + {ms};
    let last = -1;
    let stable = 0;
    const tick = () => {{
        const height = el.getBoundingClientRect().height;
        stable = height > 0 && height === last ? stable + 1 : 0;
        last = height;
        if (stable >= 2) return resolve(true);
        if (performance.now() > deadline) return resolve(false);
        setTimeout(tick, 16);
    }};
    tick();
}}))()"#,
            sel = js_str(selector),
            ms = timeout.as_millis()
        );
        Ok(self.eval(script).await?.as_bool().unwrap_or(false))
    }

    async fn bounding_box(&self, selector: &str) -> Result<Option<BoundingBox>, RenderError> {
        let script = format!(
            r#"(() => {{
    const el = document.querySelector({sel});
    if (!el) return null;
    const r = el.getBoundingClientRect();
    if (r.width === 0 && r.height === 0) return null;
    return {{
        x: r.left + window.scrollX,
        y: r.top + window.scrollY,
        width: r.width,
        height: r.height,
    }};
}})()"#,
            sel = js_str(selector)
        );
        match self.eval(script).await? {
            Value::Null => Ok(None),
            value => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    async fn scroll_into_view(&self, selector: &str) -> Result<(), RenderError> {
        let script = format!(
            r#"(() => {{
    const el = document.querySelector({sel});
    if (el) el.scrollIntoView({{ block: "start", inline: "start" }});
    return true;
}})()"#,
            sel = js_str(selector)
        );
        self.eval(script).await?;
        Ok(())
    }

    async fn capture(&self, clip: CaptureClip) -> Result<Vec<u8>, RenderError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .clip(ClipViewport {
                x: clip.x,
                y: clip.y,
                width: clip.width,
                height: clip.height,
                scale: clip.scale,
            })
            .capture_beyond_viewport(true)
            .build();

        self.page.screenshot(params).await.map_err(|e| match e {
            CdpError::Timeout => RenderError::CaptureTimeout(self.screenshot_timeout),
            other => RenderError::CaptureFailed(other.to_string()),
        })
    }

    async fn close(self: Box<Self>) -> Result<(), RenderError> {
        self.page.close().await?;
        Ok(())
    }
}
