//! Render pipeline: one attempt at producing a card image
//!
//! The pipeline drives a single page through navigate, locate, inject,
//! readiness, measure, an optional viewport resize, and capture. Every step is
//! bounded and maps its expiry to a distinct [`RenderError`]; only the icon
//! load may fail without failing the attempt.

use crate::engine::{BoundingBox, BrowserEngine, CaptureClip, CardPage, IconLoad, ImageReport};
use crate::request::RenderRequest;
use crate::{Config, RenderError};
use image::ImageFormat;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Slack on top of in-page waits, which carry their own deadline.
const IN_PAGE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub png: Vec<u8>,
    /// Bounds used for the final capture
    pub bounds: BoundingBox,
    /// Viewport height at capture time
    pub viewport_height: u32,
    pub resized: bool,
    pub images: ImageReport,
}

#[derive(Clone)]
pub struct RenderPipeline {
    config: Arc<Config>,
}

async fn bounded<T, F>(limit: Duration, fut: F, expired: RenderError) -> Result<T, RenderError>
where
    F: Future<Output = Result<T, RenderError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(expired),
    }
}

impl RenderPipeline {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Render `request` on a fresh page of `engine`; the page is always closed.
    pub async fn run(
        &self,
        engine: &dyn BrowserEngine,
        request: &RenderRequest,
    ) -> Result<RenderOutput, RenderError> {
        let page = bounded(
            self.config.timeouts.protocol,
            engine.open_page(),
            RenderError::Page("timed out opening a page".into()),
        )
        .await?;

        let result = self.drive(page.as_ref(), request).await;

        if let Err(e) = page.close().await {
            debug!("Page close failed on browser {}: {}", engine.id(), e);
        }
        result
    }

    async fn drive(
        &self,
        page: &dyn CardPage,
        request: &RenderRequest,
    ) -> Result<RenderOutput, RenderError> {
        let config = &self.config;
        let timeouts = &config.timeouts;
        let selector = request.selector();
        let url = request.target_url(config)?;

        bounded(
            timeouts.protocol,
            page.set_viewport(config.viewport.width, config.viewport.height),
            RenderError::Page("timed out setting viewport".into()),
        )
        .await?;

        debug!("Navigating to {}", url);
        bounded(
            timeouts.navigation,
            page.navigate(url.as_str()),
            RenderError::NavigationTimeout(timeouts.navigation),
        )
        .await?;

        let found = bounded(
            timeouts.selector + IN_PAGE_GRACE,
            page.wait_for_selector(&selector, timeouts.selector),
            RenderError::TargetNotFound(selector.clone()),
        )
        .await?;
        if !found {
            return Err(RenderError::TargetNotFound(selector));
        }

        self.inject(page, request).await?;

        let mut images = self.await_readiness(page, &selector).await?;
        let mut bounds = self.measure(page, &selector).await?;
        let mut viewport_height = config.viewport.height;
        let mut resized = false;

        let threshold = config
            .viewport
            .height
            .saturating_sub(config.resize.safety_margin) as f64;
        if bounds.height >= threshold {
            viewport_height = bounds.height.ceil() as u32 + config.resize.buffer;
            info!(
                "Card height {:.0}px reaches viewport {}px, resizing to {}px",
                bounds.height, config.viewport.height, viewport_height
            );

            bounded(
                timeouts.protocol,
                page.set_viewport(config.viewport.width, viewport_height),
                RenderError::Page("timed out resizing viewport".into()),
            )
            .await?;

            images = self.await_readiness(page, &selector).await?;

            let stable = bounded(
                timeouts.layout + IN_PAGE_GRACE,
                page.wait_layout_stable(&selector, timeouts.layout),
                RenderError::ReadinessTimeout(timeouts.layout),
            )
            .await?;
            if !stable {
                debug!("Layout of {} still moving after {:?}", selector, timeouts.layout);
            }

            self.reflow(page, &selector).await?;
            bounds = self.measure(page, &selector).await?;
            resized = true;
        }

        bounded(
            timeouts.protocol,
            page.scroll_into_view(&selector),
            RenderError::Page("timed out scrolling to card".into()),
        )
        .await?;
        let final_bounds = self.measure(page, &selector).await?;

        let clip = CaptureClip::from_bounds(&final_bounds, request.scale(config.image_scale));
        let png = bounded(
            timeouts.screenshot,
            page.capture(clip),
            RenderError::CaptureTimeout(timeouts.screenshot),
        )
        .await?;

        match image::guess_format(&png) {
            Ok(ImageFormat::Png) => {}
            Ok(other) => {
                return Err(RenderError::CaptureFailed(format!(
                    "expected PNG, got {other:?}"
                )))
            }
            Err(e) => return Err(RenderError::CaptureFailed(e.to_string())),
        }

        debug!(
            "Captured {}x{} at scale {} ({} bytes), resized: {}",
            clip.width,
            clip.height,
            clip.scale,
            png.len(),
            resized
        );
        if bounds.height > 0.0 && (final_bounds.height - bounds.height).abs() > 1.0 {
            debug!(
                "Card height moved from {:.1} to {:.1} before capture",
                bounds.height, final_bounds.height
            );
        }

        Ok(RenderOutput {
            png,
            bounds: final_bounds,
            viewport_height,
            resized,
            images,
        })
    }

    async fn inject(
        &self,
        page: &dyn CardPage,
        request: &RenderRequest,
    ) -> Result<(), RenderError> {
        let timeouts = &self.config.timeouts;
        let selectors = &self.config.selectors;

        if let Some(translation) = &request.translation {
            let written = bounded(
                timeouts.protocol,
                page.set_inner_html(&selectors.translation, translation),
                RenderError::Page("timed out writing translation".into()),
            )
            .await?;
            if !written {
                debug!("No translation element on page");
            }
        }

        if let Some(markup) = request.content_markup() {
            let written = bounded(
                timeouts.protocol,
                page.set_inner_html(&selectors.content, &markup),
                RenderError::Page("timed out writing content".into()),
            )
            .await?;
            if !written {
                debug!("No content element on page");
            }
        }

        if let Some(icon) = &request.icon_url {
            let outcome = match timeout(
                timeouts.icon + IN_PAGE_GRACE,
                page.load_icon(&selectors.icon, icon, timeouts.icon),
            )
            .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!("Icon load errored, continuing: {}", e);
                    IconLoad::Failed
                }
                Err(_) => IconLoad::TimedOut,
            };
            match outcome {
                IconLoad::Loaded => debug!("Icon loaded"),
                IconLoad::Missing => debug!("No icon element on page"),
                IconLoad::Failed => warn!("Icon failed to load, continuing without it"),
                IconLoad::TimedOut => warn!("Icon load timed out after {:?}", timeouts.icon),
            }
        }

        Ok(())
    }

    /// Fonts and images in parallel, then a forced reflow and settle delay.
    async fn await_readiness(
        &self,
        page: &dyn CardPage,
        selector: &str,
    ) -> Result<ImageReport, RenderError> {
        let timeouts = &self.config.timeouts;

        let settled = async {
            let (fonts, images) = futures::join!(
                page.fonts_ready(),
                page.images_settled(selector, timeouts.image)
            );
            fonts?;
            images
        };
        let images = bounded(
            timeouts.readiness,
            settled,
            RenderError::ReadinessTimeout(timeouts.readiness),
        )
        .await?;

        if images.failed > 0 || images.timed_out > 0 {
            warn!(
                "{} of {} images failed, {} timed out",
                images.failed, images.total, images.timed_out
            );
        }

        self.reflow(page, selector).await?;
        Ok(images)
    }

    async fn reflow(&self, page: &dyn CardPage, selector: &str) -> Result<(), RenderError> {
        bounded(
            self.config.timeouts.protocol,
            page.force_reflow(selector),
            RenderError::Page("timed out forcing reflow".into()),
        )
        .await?;
        sleep(self.config.timeouts.settle_delay).await;
        Ok(())
    }

    async fn measure(
        &self,
        page: &dyn CardPage,
        selector: &str,
    ) -> Result<BoundingBox, RenderError> {
        let bounds = bounded(
            self.config.timeouts.protocol,
            page.bounding_box(selector),
            RenderError::BoundsUnavailable(selector.to_string()),
        )
        .await?;
        bounds.ok_or_else(|| RenderError::BoundsUnavailable(selector.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BrowserFactory;
    use crate::test_support::{FakeBehavior, FakeFactory};
    use serde_json::json;

    fn pipeline() -> RenderPipeline {
        RenderPipeline::new(Arc::new(Config::default()))
    }

    async fn run(
        behavior: FakeBehavior,
        body: serde_json::Value,
    ) -> (Arc<FakeFactory>, Result<RenderOutput, RenderError>) {
        let factory = FakeFactory::new(behavior);
        let engine = factory.launch(0).await.unwrap();
        let request = RenderRequest::from_value(body).unwrap();
        let result = pipeline().run(engine.as_ref(), &request).await;
        (factory, result)
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_card_skips_injection_and_resize() {
        let (factory, result) = run(FakeBehavior::default(), json!({"temp": "tempA"})).await;
        let output = result.unwrap();

        assert!(!output.resized);
        assert_eq!(output.viewport_height, 1080);
        assert!(output.png.starts_with(b"\x89PNG"));
        assert!(factory.injections().is_empty());
        assert!(factory.icon_requests().is_empty());
        assert_eq!(factory.viewports(), vec![(1920, 1080)]);
        assert_eq!(factory.captures()[0].scale, 2.0);
        assert_eq!(factory.pages_open(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tall_card_resizes_viewport_once() {
        let behavior = FakeBehavior {
            content_height: 2000.0,
            ..Default::default()
        };
        let (factory, result) = run(behavior, json!({})).await;
        let output = result.unwrap();

        assert!(output.resized);
        assert!(output.viewport_height >= 2200);
        assert_eq!(factory.viewports(), vec![(1920, 1080), (1920, 2200)]);
        assert!((output.bounds.height - 2000.0).abs() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_height_just_under_margin_does_not_resize() {
        let behavior = FakeBehavior {
            content_height: 1039.0,
            ..Default::default()
        };
        let (factory, result) = run(behavior, json!({})).await;
        assert!(!result.unwrap().resized);
        assert_eq!(factory.viewports().len(), 1);

        let behavior = FakeBehavior {
            content_height: 1040.0,
            ..Default::default()
        };
        let (_, result) = run(behavior, json!({})).await;
        assert!(result.unwrap().resized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_target_fails_attempt() {
        let behavior = FakeBehavior {
            missing_target: true,
            ..Default::default()
        };
        let (factory, result) = run(behavior, json!({"temp": "tempB"})).await;
        match result {
            Err(RenderError::TargetNotFound(selector)) => assert_eq!(selector, ".tempB"),
            other => panic!("expected TargetNotFound, got {other:?}"),
        }
        assert_eq!(factory.pages_open(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_bounds_is_fatal() {
        let behavior = FakeBehavior {
            bounds_missing: true,
            ..Default::default()
        };
        let (_, result) = run(behavior, json!({})).await;
        assert!(matches!(result, Err(RenderError::BoundsUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_injects_content_translation_and_icon() {
        let body = json!({
            "content": "**bold**",
            "translate": "<i>hi</i>",
            "icon": "https://example.com/icon.png",
        });
        let (factory, result) = run(FakeBehavior::default(), body).await;
        result.unwrap();

        let injections = factory.injections();
        assert_eq!(injections.len(), 2);
        assert_eq!(
            injections[0],
            (
                r#"[name="showTranslation"]"#.to_string(),
                "<i>hi</i>".to_string()
            )
        );
        assert_eq!(injections[1].0, r#"[name="showContent"]"#);
        assert!(injections[1].1.contains("<strong>bold</strong>"));
        assert_eq!(factory.icon_requests(), vec!["https://example.com/icon.png".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_icon_failure_does_not_fail_render() {
        let behavior = FakeBehavior {
            icon: IconLoad::TimedOut,
            ..Default::default()
        };
        let (_, result) = run(behavior, json!({"icon": "https://example.com/broken.png"})).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_images_surface_readiness_timeout() {
        let behavior = FakeBehavior {
            images_hang: true,
            ..Default::default()
        };
        let (factory, result) = run(behavior, json!({})).await;
        assert!(matches!(result, Err(RenderError::ReadinessTimeout(_))));
        assert_eq!(factory.pages_open(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_origin_clamped_in_capture() {
        let behavior = FakeBehavior {
            origin: (-3.0, -12.0),
            ..Default::default()
        };
        let (factory, result) = run(behavior, json!({"imgScale": 1})).await;
        result.unwrap();

        let clip = factory.captures()[0];
        assert_eq!((clip.x, clip.y), (0.0, 0.0));
        assert_eq!(clip.scale, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_png_capture_rejected() {
        let behavior = FakeBehavior {
            capture_bytes: Some(b"GIF89a....".to_vec()),
            ..Default::default()
        };
        let (_, result) = run(behavior, json!({})).await;
        assert!(matches!(result, Err(RenderError::CaptureFailed(_))));
    }
}
