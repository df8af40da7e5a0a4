//! Configuration management with serde serialization/deserialization
//!
//! Holds the probe ceilings, the link-check admission limit, the Chrome
//! launch settings and the HTTP surface settings. Probe behavior itself is
//! fixed; only these limits and locations are tunable.

use crate::VitalsError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
///
/// # Examples
///
/// ```rust
/// use page_vitals::Config;
///
/// let config = Config::default();
/// assert_eq!(config.max_concurrent_links, 10);
///
/// let config = Config {
///     max_concurrent_links: 4,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Ceiling for the raw network probe, connect through response headers (default: 10 seconds)
    pub network_timeout: Duration,

    /// Ceiling for the whole browser session: launch, navigation, wait and script (default: 2 minutes)
    pub browser_timeout: Duration,

    /// Ceiling for each individual link HEAD probe (default: 30 seconds)
    pub link_timeout: Duration,

    /// Maximum number of link probes in flight at once (default: 10)
    pub max_concurrent_links: usize,

    /// How often the browser probe re-checks body visibility (default: 100ms)
    pub visibility_poll_interval: Duration,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    ///
    /// If None, chromiumoxide locates an installed Chrome on its own.
    pub chrome_path: Option<String>,

    /// HTTP surface settings
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network_timeout: Duration::from_secs(10),
            browser_timeout: Duration::from_secs(120),
            link_timeout: Duration::from_secs(30),
            max_concurrent_links: 10,
            visibility_poll_interval: Duration::from_millis(100),
            chrome_path: None,
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    pub bind: String,

    /// Listen port (default: 3000, overridden by the `PORT` env var)
    pub port: u16,

    /// Install the Prometheus recorder and serve `/metrics` (default: true)
    pub metrics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            metrics: true,
        }
    }
}

impl Config {
    /// Apply the `PORT` environment variable, if set and numeric.
    pub fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("Ignoring non-numeric PORT value {:?}", port),
            }
        }
    }
}

pub fn validate_config(config: &Config) -> Result<(), VitalsError> {
    if config.network_timeout.is_zero() {
        return Err(VitalsError::Configuration(
            "Network timeout must be greater than 0".to_string(),
        ));
    }

    if config.browser_timeout.is_zero() {
        return Err(VitalsError::Configuration(
            "Browser timeout must be greater than 0".to_string(),
        ));
    }

    if config.link_timeout.is_zero() {
        return Err(VitalsError::Configuration(
            "Link timeout must be greater than 0".to_string(),
        ));
    }

    if config.max_concurrent_links == 0 {
        return Err(VitalsError::Configuration(
            "Max concurrent link checks must be greater than 0".to_string(),
        ));
    }

    if config.visibility_poll_interval.is_zero() {
        return Err(VitalsError::Configuration(
            "Visibility poll interval must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Chrome command-line arguments for one measurement session
///
/// Headless, unsandboxed and without GPU or shared memory so Chrome runs in a
/// minimal container. Audio is muted and scrollbars hidden so they never
/// influence paint timing.
pub fn get_chrome_args() -> Vec<String> {
    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-gpu".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-software-rasterizer".to_string(),
        "--mute-audio".to_string(),
        "--hide-scrollbars".to_string(),
        "--no-first-run".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
    ]
}

/// Build the chromiumoxide launch config for a session with its own profile directory.
pub fn create_browser_config(
    config: &Config,
    profile_dir: &Path,
) -> Result<chromiumoxide::browser::BrowserConfig, VitalsError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .args(get_chrome_args())
        .user_data_dir(profile_dir)
        .request_timeout(config.browser_timeout);

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(VitalsError::BrowserLaunch)
}
