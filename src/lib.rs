//! # Card Render
//!
//! Renders parameterized "cards" by driving a remote card page in headless
//! Chrome, injecting the caller's content, waiting until fonts and images have
//! settled, and capturing the card element as a PNG.
//!
//! ## Architecture
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | Result cache | [`cache`] | LRU by request fingerprint, entry and byte bounded, TTL |
//! | Admission controller | [`admission`] | caps concurrent renders, FIFO queue with deadline |
//! | Browser pool | [`browser_pool`] | lazily launched, recycled Chrome instances |
//! | Render pipeline | [`pipeline`] | navigate, inject, readiness, resize, capture |
//! | Retry supervisor | [`retry`] | fixed-backoff attempt loop |
//! | Render service | [`render_service`] | wires the above together |
//!
//! A render runs cache lookup → admission slot → browser lease → pipeline →
//! cache store as one attempt; the slot and lease are returned on every path
//! before a retry.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use card_render::{Config, RenderService};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let service = RenderService::new(config).await?;
//!
//!     let png = service
//!         .render_body(json!({"temp": "tempA", "content": "**Hello**"}), false)
//!         .await?;
//!     std::fs::write("card.png", png)?;
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! card-render serve --port 3003
//! card-render render --input body.json --output card.png
//! LOW_SPEC_MODE=true card-render config
//! ```

/// Configuration, environment loading and Chrome launch settings
pub mod config;

/// Error kinds of a render attempt
pub mod error;

/// Render requests built from caller JSON
pub mod request;

/// Markdown conversion of card content
pub mod markdown;

/// Promotional footer substitution
pub mod promo;

/// Result cache keyed by request fingerprint
pub mod cache;

/// Admission control for concurrent renders
pub mod admission;

/// Browser-engine traits
pub mod engine;

/// Chrome implementation of the browser-engine traits
pub mod chrome;

/// Browser pool management
pub mod browser_pool;

/// Render pipeline state machine
pub mod pipeline;

/// Retry loop around render attempts
pub mod retry;

/// Render service composing cache, admission, pool and pipeline
pub mod render_service;

/// Health snapshot of the engine
pub mod health;

/// Metrics handles and Prometheus exporter
pub mod metrics;

/// HTTP surface
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Formatting helpers for logs
pub mod utils;

#[cfg(test)]
mod test_support;


pub use admission::*;
pub use browser_pool::*;
pub use cache::*;
pub use cli::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use health::*;
pub use metrics::*;
pub use pipeline::*;
pub use render_service::*;
pub use request::*;
pub use retry::*;
pub use server::{AppState, RenderQuery};
pub use utils::*;
