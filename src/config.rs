//! Configuration management with serde serialization/deserialization
//!
//! This module provides the engine configuration: concurrency limits, timeouts,
//! cache budget, capture geometry and the DOM hooks of the card page. Values come
//! from defaults, an optional JSON file, the process environment and CLI flags.

use crate::RenderError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CDP_TIMEOUT_HEADROOM: Duration = Duration::from_secs(5);

/// Main configuration structure for the card renderer
///
/// # Examples
///
/// ```rust
/// use card_render::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Constrained deployment
/// let config = Config {
///     max_concurrency: 1,
///     max_active_requests: 1,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Page that renders cards; query parameters are appended per request
    pub target_url: String,

    /// Language segment of `target_url` that a request's `language` replaces
    pub default_language: String,

    /// Constrained-host mode (default: false)
    ///
    /// Forces scale 1, a single attempt and a concurrency of one.
    pub low_spec_mode: bool,

    /// Capture scale used when a request carries no `imgScale` (default: 2)
    pub image_scale: f64,

    /// Attempts per request including the first one (default: 2)
    pub max_retries: usize,

    /// Fixed pause between attempts (default: 1 second)
    pub retry_backoff: Duration,

    /// Maximum number of browser instances (default: 5, 2 in production)
    pub max_concurrency: usize,

    /// Maximum number of renders running at once (default: 3, 2 in production)
    pub max_active_requests: usize,

    /// Browser instances launched at startup (default: 2)
    pub prewarm: usize,

    /// Initial viewport of every page
    pub viewport: Viewport,

    /// Bounded waits of every pipeline step
    pub timeouts: Timeouts,

    /// Viewport enlargement for tall cards
    pub resize: ResizePolicy,

    /// Result cache bounds
    pub cache: CacheSettings,

    /// DOM hooks used for content injection
    pub selectors: PageSelectors,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// HTTP listen port (default: 3003)
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_url: "https://fireflycard.shushiai.com/zh/reqApi".to_string(),
            default_language: "zh".to_string(),
            low_spec_mode: false,
            image_scale: 2.0,
            max_retries: 2,
            retry_backoff: Duration::from_secs(1),
            max_concurrency: 5,
            max_active_requests: 3,
            prewarm: 2,
            viewport: Viewport::default(),
            timeouts: Timeouts::default(),
            resize: ResizePolicy::default(),
            cache: CacheSettings::default(),
            selectors: PageSelectors::default(),
            chrome_path: None,
            port: 3003,
        }
    }
}

/// Browser viewport used before any adaptive resize
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Timeouts {
    /// Navigation until the DOM is parsed
    pub navigation: Duration,
    /// Single DevTools protocol request
    pub protocol: Duration,
    /// Screenshot capture
    pub screenshot: Duration,
    /// Appearance of the card selector
    pub selector: Duration,
    /// Icon load; expiry is not an error
    pub icon: Duration,
    /// Fonts plus every image of the card
    pub readiness: Duration,
    /// One image inside the card
    pub image: Duration,
    /// Layout stabilisation after a viewport resize
    pub layout: Duration,
    /// Wait in the admission queue
    pub queue: Duration,
    /// Wait for a free browser
    pub pool_acquire: Duration,
    /// Pause after the forced reflow so font metrics settle
    pub settle_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            navigation: Duration::from_millis(120_000),
            protocol: Duration::from_millis(60_000),
            screenshot: Duration::from_millis(60_000),
            selector: Duration::from_secs(15),
            icon: Duration::from_secs(10),
            readiness: Duration::from_secs(30),
            image: Duration::from_secs(10),
            layout: Duration::from_secs(5),
            queue: Duration::from_millis(60_000),
            pool_acquire: Duration::from_millis(60_000),
            settle_delay: Duration::from_millis(150),
        }
    }
}

/// When and how far the viewport grows for cards taller than the screen
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResizePolicy {
    /// A card within this many pixels of the viewport height triggers a resize
    pub safety_margin: u32,
    /// Extra pixels below the card so trailing content is not clipped
    pub buffer: u32,
}

impl Default for ResizePolicy {
    fn default() -> Self {
        Self {
            safety_margin: 40,
            buffer: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 50,
            max_bytes: 50 * 1024 * 1024,
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PageSelectors {
    pub translation: String,
    pub content: String,
    pub icon: String,
}

impl Default for PageSelectors {
    fn default() -> Self {
        Self {
            translation: r#"[name="showTranslation"]"#.to_string(),
            content: r#"[name="showContent"]"#.to_string(),
            icon: "#icon".to_string(),
        }
    }
}

impl Config {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Result<Self, RenderError> {
        Self::from_lookup(Self::default(), |key| std::env::var(key).ok())
    }

    /// Apply environment-style overrides on top of `base`.
    ///
    /// `lookup` returns the raw value of a variable. Production and low-spec
    /// defaults only replace values the variables do not set explicitly.
    pub fn from_lookup<F>(base: Config, lookup: F) -> Result<Self, RenderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = base;
        let production = ["NODE_ENV", "APP_ENV"]
            .iter()
            .any(|key| lookup(key).as_deref() == Some("production"));
        let low_spec = lookup("LOW_SPEC_MODE").as_deref() == Some("true");
        config.low_spec_mode = config.low_spec_mode || low_spec;

        if production {
            config.max_concurrency = 2;
            config.max_active_requests = 2;
            config.cache.max_entries = 20;
            config.cache.max_bytes = 20 * 1024 * 1024;
        }

        if let Some(scale) = parse_var::<f64>(&lookup, "IMAGE_SCALE")? {
            config.image_scale = scale;
        }
        if let Some(retries) = parse_var::<usize>(&lookup, "MAX_RETRIES")? {
            config.max_retries = retries;
        }
        if let Some(concurrency) = parse_var::<usize>(&lookup, "MAX_CONCURRENCY")? {
            config.max_concurrency = concurrency;
        }
        if let Some(active) = parse_var::<usize>(&lookup, "MAX_ACTIVE_REQUESTS")? {
            config.max_active_requests = active;
        }
        if let Some(entries) = parse_var::<usize>(&lookup, "CACHE_MAX_ENTRIES")? {
            config.cache.max_entries = entries;
        }
        if let Some(bytes) = parse_var::<usize>(&lookup, "CACHE_MAX_BYTES")? {
            config.cache.max_bytes = bytes;
        }
        if let Some(ttl) = parse_var::<u64>(&lookup, "CACHE_TTL")? {
            config.cache.ttl = Duration::from_secs(ttl);
        }

        // unset timeouts keep the base values unless low-spec mode is switched on here
        if let Some(ms) = parse_var::<u64>(&lookup, "NAVIGATION_TIMEOUT")? {
            config.timeouts.navigation = Duration::from_millis(ms);
        } else if low_spec {
            config.timeouts.navigation = Duration::from_millis(90_000);
        }

        let queue = match parse_var::<u64>(&lookup, "PROTOCOL_TIMEOUT")? {
            Some(ms) => {
                config.timeouts.protocol = Duration::from_millis(ms);
                Some(Duration::from_millis(ms))
            }
            None if low_spec => {
                config.timeouts.protocol = Duration::from_millis(45_000);
                Some(Duration::from_millis(120_000))
            }
            None => None,
        };
        if let Some(queue) = queue {
            config.timeouts.queue = queue;
            config.timeouts.pool_acquire = queue;
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "SCREENSHOT_TIMEOUT")? {
            config.timeouts.screenshot = Duration::from_millis(ms);
        }

        if let Some(url) = lookup("TARGET_URL") {
            config.target_url = url;
        }
        let chrome_path = lookup("CHROME_PATH").or_else(|| lookup("PUPPETEER_EXECUTABLE_PATH"));
        if let Some(path) = chrome_path {
            config.chrome_path = Some(path);
        }
        if let Some(port) = parse_var::<u16>(&lookup, "PORT")? {
            config.port = port;
        }

        if config.low_spec_mode {
            config.apply_low_spec();
        }

        Ok(config)
    }

    /// Per-command limit of the DevTools connection.
    ///
    /// Sits above the longest step timeout so navigation and capture report
    /// their own timeout kinds.
    pub fn cdp_request_timeout(&self) -> Duration {
        let longest = [
            self.timeouts.protocol,
            self.timeouts.navigation,
            self.timeouts.screenshot,
        ]
        .into_iter()
        .max()
        .unwrap_or(self.timeouts.protocol);
        longest + CDP_TIMEOUT_HEADROOM
    }

    /// Constrained hosts render one card at a time, once, at 1x.
    pub fn apply_low_spec(&mut self) {
        self.low_spec_mode = true;
        self.image_scale = 1.0;
        self.max_retries = 1;
        self.max_concurrency = 1;
        self.max_active_requests = 1;
        self.prewarm = self.prewarm.min(1);
    }

    pub fn validate(&self) -> Result<(), RenderError> {
        if self.max_concurrency == 0 {
            return Err(RenderError::Configuration(
                "Max concurrency must be greater than 0".into(),
            ));
        }

        if self.max_active_requests == 0 {
            return Err(RenderError::Configuration(
                "Max active requests must be greater than 0".into(),
            ));
        }

        if self.max_retries == 0 {
            return Err(RenderError::Configuration(
                "Max retries must be greater than 0".into(),
            ));
        }

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(RenderError::Configuration(
                "Viewport dimensions must be greater than 0".into(),
            ));
        }

        if !(self.image_scale > 0.0) {
            return Err(RenderError::Configuration(format!(
                "Image scale must be positive, got {}",
                self.image_scale
            )));
        }

        url::Url::parse(&self.target_url).map_err(|e| {
            RenderError::Configuration(format!("Invalid target url {}: {e}", self.target_url))
        })?;

        Ok(())
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, RenderError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| RenderError::Configuration(format!("{key}={raw}: {e}"))),
        None => Ok(None),
    }
}

/// Generate Chrome command-line arguments based on configuration
///
/// # Examples
///
/// ```rust
/// use card_render::{Config, get_chrome_args};
///
/// let config = Config::default();
/// let args = get_chrome_args(&config);
/// assert!(args.iter().any(|a| a == "--hide-scrollbars"));
/// ```
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-web-security".to_string(),
        "--no-first-run".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-translate".to_string(),
        "--disable-sync".to_string(),
        "--disable-plugins".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
    ];

    if config.low_spec_mode {
        args.extend(
            [
                "--memory-pressure-off",
                "--disable-features=VizDisplayCompositor",
                "--disable-ipc-flooding-protection",
                "--disable-background-media-suspend",
                "--disable-component-extensions-with-background-pages",
                "--disable-client-side-phishing-detection",
            ]
            .iter()
            .map(|arg| arg.to_string()),
        );
    }

    args
}

/// Browser launch settings; `user_data_dir` must be unique per pooled instance.
pub fn create_browser_config(
    config: &Config,
    user_data_dir: &str,
) -> Result<chromiumoxide::browser::BrowserConfig, RenderError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .request_timeout(config.cdp_request_timeout())
        .user_data_dir(user_data_dir)
        .args(get_chrome_args(config));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(RenderError::PoolCreationFailed)
}
