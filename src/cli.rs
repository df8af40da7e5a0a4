use crate::{
    extract_domain, format_duration, install_prometheus, serve, validate_config, Analyzer, AppState,
    Config, FullReport, HttpNetworkProbe, NetworkProbe, StatusClass,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Parser)]
#[command(name = "page-vitals")]
#[command(about = "Measure network timings, paint timing and link health of a web page")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Network probe timeout in seconds")]
    pub network_timeout: Option<u64>,

    #[arg(long, global = true, help = "Browser probe timeout in seconds")]
    pub browser_timeout: Option<u64>,

    #[arg(long, global = true, help = "Per-link check timeout in seconds")]
    pub link_timeout: Option<u64>,

    #[arg(long, global = true, help = "Maximum link checks in flight")]
    pub max_concurrent_links: Option<usize>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full analysis of one page
    Analyze {
        #[arg(short, long, help = "Page to analyze")]
        url: String,

        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },

    /// Run only the network timing probe
    Network {
        #[arg(short, long, help = "URL to fetch")]
        url: String,
    },

    /// Serve the HTTP API
    Serve {
        #[arg(short, long, help = "Listen port (default: config, PORT env, then 3000)")]
        port: Option<u16>,

        #[arg(long, help = "Bind address")]
        bind: Option<String>,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Load the config file (if any), then apply `PORT` and the command-line overrides.
    pub async fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => read_config(path).await?,
            None => Config::default(),
        };

        config.apply_env();

        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
        if let Some(secs) = self.network_timeout {
            config.network_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.browser_timeout {
            config.browser_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.link_timeout {
            config.link_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_concurrent_links {
            config.max_concurrent_links = max;
        }

        validate_config(&config)?;

        info!("Configuration loaded successfully");
        info!(
            "Timeouts: network {:?}, browser {:?}, link {:?}; max concurrent links {}",
            config.network_timeout,
            config.browser_timeout,
            config.link_timeout,
            config.max_concurrent_links
        );

        Ok(config)
    }
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run `command`; `shutdown` stops a running analysis or server.
    pub async fn run<F>(&self, command: Commands, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match command {
            Commands::Analyze { url, json } => self.run_analyze(&url, json, shutdown).await,
            Commands::Network { url } => self.run_network(&url).await,
            Commands::Serve { port, bind } => self.run_server(port, bind, shutdown).await,
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    pub async fn run_analyze<F>(&self, url: &str, json: bool, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Analyzing {}", url);

        let analyzer = Analyzer::new(self.config.clone())?;
        let report = analyzer.analyze_until(url, shutdown).await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report);
        }

        Ok(())
    }

    pub async fn run_network(&self, url: &str) -> anyhow::Result<()> {
        let probe = HttpNetworkProbe::from_config(&self.config);
        let stats = probe.probe(url).await?;

        println!("{}", serde_json::to_string_pretty(&stats)?);
        Ok(())
    }

    pub async fn run_server<F>(
        &self,
        port: Option<u16>,
        bind: Option<String>,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut server = self.config.server.clone();
        if let Some(port) = port {
            server.port = port;
        }
        if let Some(bind) = bind {
            server.bind = bind;
        }

        // The recorder has to exist before the analyzer registers its handles
        let prometheus = if server.metrics {
            Some(install_prometheus()?)
        } else {
            None
        };

        let state = AppState {
            analyzer: Arc::new(Analyzer::new(self.config.clone())?),
            prometheus,
        };

        let addr = format!("{}:{}", server.bind, server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;

        serve(listener, state, shutdown).await?;
        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = read_config(&config_path).await?;
        validate_config(&config)?;

        println!("Configuration is valid:");
        println!("  Network timeout: {:?}", config.network_timeout);
        println!("  Browser timeout: {:?}", config.browser_timeout);
        println!("  Link timeout: {:?}", config.link_timeout);
        println!("  Max concurrent links: {}", config.max_concurrent_links);
        println!(
            "  Chrome: {}",
            config.chrome_path.as_deref().unwrap_or("auto-detect")
        );
        println!("  Server: {}:{}", config.server.bind, config.server.port);

        Ok(())
    }
}

async fn read_config(path: &PathBuf) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = serde_json::from_str(&content)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn print_report(report: &FullReport) {
    let network = &report.network;

    println!("Page: {}", network.url);
    if let Some(host) = extract_domain(&network.url) {
        println!("  Host: {host}");
    }
    println!("  Status: {}", network.status_code);

    println!("Network:");
    println!("  DNS lookup:     {}", format_duration(network.dns_lookup));
    println!("  TCP connection: {}", format_duration(network.tcp_connection));
    println!("  TLS handshake:  {}", format_duration(network.tls_handshake));
    println!("  TTFB:           {}", format_duration(network.ttfb));
    println!("  Total:          {}", format_duration(network.total_time));

    println!("Browser:");
    println!("  First contentful paint: {:.1}ms", report.browser.fcp);
    println!("  Links found: {}", report.browser.links.len());

    if report.links_health.is_empty() {
        return;
    }

    println!("Links:");
    for link in &report.links_health {
        let marker = match link.status_class() {
            StatusClass::Success => "ok",
            StatusClass::Redirect => "->",
            StatusClass::Failure => "!!",
            StatusClass::Unknown => "??",
        };
        match &link.error {
            Some(error) => println!("  {marker} {} ({error})", link.url),
            None => println!(
                "  {marker} {} {} in {}",
                link.status_code,
                link.url,
                format_duration(link.duration)
            ),
        }
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
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

/// Resolve once a shutdown signal is broadcast.
///
/// A closed channel means no signal can ever arrive, so it never resolves.
pub async fn wait_for_shutdown(mut shutdown_rx: broadcast::Receiver<()>) {
    match shutdown_rx.recv().await {
        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
    }
}
