use crate::{install_prometheus, server, AppState, Config, RenderService};
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "card-render")]
#[command(about = "Headless-browser card rendering service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Maximum number of browser instances")]
    pub max_concurrency: Option<usize>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service
    Serve {
        #[arg(short, long, help = "Listen port (default: PORT or 3003)")]
        port: Option<u16>,

        #[arg(long, default_value = "0.0.0.0", help = "Bind address")]
        bind: String,
    },

    /// Render one request body to a file
    Render {
        #[arg(short, long, help = "JSON request body")]
        input: PathBuf,

        #[arg(short, long, help = "Output PNG path")]
        output: PathBuf,

        #[arg(long, help = "Apply the promotional footer")]
        promo: bool,
    },

    /// Print the effective configuration as JSON
    Config,
}

/// Defaults, then the `--config` file, then the environment, then flags.
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let base = match &args.config {
        Some(path) => {
            let content = fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        }
        None => Config::default(),
    };

    let mut config = Config::from_lookup(base, |key| std::env::var(key).ok())?;
    apply_overrides(&mut config, args);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!(
        "Browsers: {}, active renders: {}, attempts: {}, low-spec: {}",
        config.max_concurrency, config.max_active_requests, config.max_retries, config.low_spec_mode
    );
    Ok(config)
}

pub fn apply_overrides(config: &mut Config, args: &Cli) {
    if let Some(max_concurrency) = args.max_concurrency {
        if config.low_spec_mode {
            warn!("Ignoring --max-concurrency in low-spec mode");
        } else {
            config.max_concurrency = max_concurrency;
        }
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }
    if let Commands::Serve {
        port: Some(port), ..
    } = &args.command
    {
        config.port = *port;
    }
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(
        &self,
        command: Commands,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        match command {
            Commands::Serve { bind, .. } => self.run_server(&bind, shutdown).await,
            Commands::Render {
                input,
                output,
                promo,
            } => self.run_render(input, output, promo, shutdown).await,
            Commands::Config => self.show_config(),
        }
    }

    pub async fn run_server(
        &self,
        bind: &str,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("{}:{}", bind, self.config.port)
            .parse()
            .with_context(|| format!("invalid bind address {bind}"))?;

        // The recorder has to exist before the service registers its handles
        let metrics = match install_prometheus() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Metrics disabled: {}", e);
                None
            }
        };

        let service = Arc::new(RenderService::new(self.config.clone()).await?);
        let state = AppState {
            service: Arc::clone(&service),
            metrics,
        };

        let served = server::serve(state, addr, async move {
            let _ = shutdown.recv().await;
            info!("Received shutdown signal, no longer accepting requests");
        })
        .await;

        service.shutdown().await;
        served.map_err(Into::into)
    }

    pub async fn run_render(
        &self,
        input: PathBuf,
        output: PathBuf,
        promo: bool,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let content = fs::read_to_string(&input)
            .await
            .with_context(|| format!("reading {}", input.display()))?;
        let body: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", input.display()))?;

        let service = RenderService::new(self.config.clone()).await?;
        let rendered = tokio::select! {
            result = service.render_body(body, promo) => Some(result),
            _ = shutdown.recv() => None,
        };
        service.shutdown().await;

        let png = match rendered {
            Some(result) => result?,
            None => return Err(anyhow!("interrupted before the render finished")),
        };

        fs::write(&output, &png)
            .await
            .with_context(|| format!("writing {}", output.display()))?;
        info!("Card saved to {} ({} bytes)", output.display(), png.len());
        Ok(())
    }

    pub fn show_config(&self) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(&self.config)?);
        Ok(())
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install logger: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_flags_override_config() {
        let args = Cli::parse_from([
            "card-render",
            "--max-concurrency",
            "4",
            "--chrome-path",
            "/usr/bin/chromium",
            "serve",
            "--port",
            "8080",
        ]);
        let mut config = Config::default();
        apply_overrides(&mut config, &args);

        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.port, 8080);
        assert_eq!(config.chrome_path.as_deref(), Some("/usr/bin/chromium"));
    }

    #[test]
    fn test_low_spec_keeps_single_browser() {
        let args = Cli::parse_from(["card-render", "--max-concurrency", "4", "config"]);
        let mut config = Config::default();
        config.apply_low_spec();
        apply_overrides(&mut config, &args);
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn test_render_command_parses() {
        let args = Cli::parse_from([
            "card-render",
            "render",
            "--input",
            "body.json",
            "--output",
            "card.png",
            "--promo",
        ]);
        match args.command {
            Commands::Render { input, output, promo } => {
                assert_eq!(input, PathBuf::from("body.json"));
                assert_eq!(output, PathBuf::from("card.png"));
                assert!(promo);
            }
            _ => panic!("expected render command"),
        }
    }
}
