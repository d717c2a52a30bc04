//! Browser-engine seams
//!
//! The pool and the render pipeline talk to the browser only through these
//! traits. [`crate::chrome`] implements them on top of chromiumoxide; tests use
//! in-memory fakes.

use crate::RenderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Element rectangle in CSS pixels, document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Region handed to the screenshot call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureClip {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub scale: f64,
}

impl CaptureClip {
    /// Clip for `bounds`; negative origins are clamped to zero.
    pub fn from_bounds(bounds: &BoundingBox, scale: f64) -> Self {
        Self {
            x: bounds.x.max(0.0),
            y: bounds.y.max(0.0),
            width: bounds.width,
            height: bounds.height,
            scale,
        }
    }
}

/// Outcome of waiting on the images inside the card.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReport {
    pub total: u32,
    pub failed: u32,
    pub timed_out: u32,
}

/// Outcome of assigning the icon source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IconLoad {
    Loaded,
    Failed,
    TimedOut,
    /// The page has no icon element
    Missing,
}

/// Launches browser-engine instances for the pool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn launch(&self, id: usize) -> Result<Box<dyn BrowserEngine>, RenderError>;
}

/// One running browser instance.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    fn id(&self) -> usize;

    async fn open_page(&self) -> Result<Box<dyn CardPage>, RenderError>;

    /// Close every page but the first; returns how many were closed.
    async fn close_extra_pages(&self) -> Result<usize, RenderError>;

    /// Liveness probe; an error means the instance must not be reused.
    async fn probe(&self) -> Result<(), RenderError>;

    async fn close(self: Box<Self>);
}

/// A single tab driven by the render pipeline.
#[async_trait]
pub trait CardPage: Send + Sync {
    /// Navigate and return once the DOM is parsed.
    async fn navigate(&self, url: &str) -> Result<(), RenderError>;

    async fn set_viewport(&self, width: u32, height: u32) -> Result<(), RenderError>;

    /// Wait in-page for `selector`; `false` when it did not appear in time.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration)
        -> Result<bool, RenderError>;

    /// Replace the inner HTML of `selector`; `false` when it is absent.
    async fn set_inner_html(&self, selector: &str, html: &str) -> Result<bool, RenderError>;

    /// Point the icon image at `src` and wait for load or error.
    async fn load_icon(
        &self,
        selector: &str,
        src: &str,
        timeout: Duration,
    ) -> Result<IconLoad, RenderError>;

    /// Resolve once every web font has loaded.
    async fn fonts_ready(&self) -> Result<(), RenderError>;

    /// Wait for each image in `selector` independently, each bounded by `per_image`.
    async fn images_settled(
        &self,
        selector: &str,
        per_image: Duration,
    ) -> Result<ImageReport, RenderError>;

    /// Force a synchronous layout of `selector`.
    async fn force_reflow(&self, selector: &str) -> Result<(), RenderError>;

    /// Wait until the height of `selector` is the same on consecutive frames.
    async fn wait_layout_stable(&self, selector: &str, timeout: Duration)
        -> Result<bool, RenderError>;

    async fn bounding_box(&self, selector: &str) -> Result<Option<BoundingBox>, RenderError>;

    async fn scroll_into_view(&self, selector: &str) -> Result<(), RenderError>;

    /// PNG of `clip`.
    async fn capture(&self, clip: CaptureClip) -> Result<Vec<u8>, RenderError>;

    async fn close(self: Box<Self>) -> Result<(), RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_clamps_negative_origin() {
        let clip = CaptureClip::from_bounds(
            &BoundingBox {
                x: -4.5,
                y: -10.0,
                width: 440.0,
                height: 600.0,
            },
            2.0,
        );
        assert_eq!(clip.x, 0.0);
        assert_eq!(clip.y, 0.0);
        assert_eq!(clip.width, 440.0);
        assert_eq!(clip.scale, 2.0);
    }
}
