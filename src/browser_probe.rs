//! Headless Chrome measurement session
//!
//! Every probe launches its own Chrome process with a throwaway profile,
//! loads the target, waits for the body to render and runs the embedded
//! measurement script. The script is a black box to this module: only its
//! JSON answer `{ "fcp": number, "links": [string] }` is relied upon.

use crate::{create_browser_config, validate_url, BrowserResult, Config, VitalsError};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// In-page script returning the paint timing and same-origin links as a JSON string
pub const MEASUREMENT_SCRIPT: &str = include_str!("assets/measure.js");

/// `body` exists, is not hidden by style and has a layout box.
const BODY_VISIBLE_CHECK: &str = "(() => { const b = document.body; \
    if (!b || getComputedStyle(b).visibility === 'hidden') return false; \
    return Boolean(b.offsetWidth || b.offsetHeight || b.getClientRects().length); })()";

const BROWSER_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Unbroken run of failed visibility checks after which the page is given up on
const MAX_VISIBILITY_ERRORS: usize = 50;

/// A full page render of the target
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserProbe: Send + Sync {
    async fn probe(&self, target: &str) -> Result<BrowserResult, VitalsError>;
}

/// Parse what the measurement script returned.
pub fn parse_measurement(raw: &str) -> Result<BrowserResult, VitalsError> {
    serde_json::from_str(raw).map_err(|e| VitalsError::ResultParse(e.to_string()))
}

pub struct ChromeBrowserProbe {
    config: Config,
}

impl ChromeBrowserProbe {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    async fn measure(&self, url: &str) -> Result<BrowserResult, VitalsError> {
        let session = BrowserSession::launch(&self.config).await?;
        let result = session.measure(url, self.config.visibility_poll_interval).await;
        session.close().await;
        result
    }
}

#[async_trait]
impl BrowserProbe for ChromeBrowserProbe {
    async fn probe(&self, target: &str) -> Result<BrowserResult, VitalsError> {
        let url = validate_url(target).map_err(|e| VitalsError::InvalidUrl(format!("{target}: {e}")))?;
        let start_time = Instant::now();

        debug!("Starting browser probe for {}", url);

        // On timeout the session future is dropped and its guard releases Chrome
        let result = match timeout(self.config.browser_timeout, self.measure(url.as_str())).await {
            Ok(result) => result?,
            Err(_) => return Err(VitalsError::BrowserTimeout(self.config.browser_timeout)),
        };

        info!(
            "Browser probe for {} finished in {:?}: fcp {:.1}ms, {} links",
            url,
            start_time.elapsed(),
            result.fcp,
            result.links.len()
        );

        Ok(result)
    }
}

/// One Chrome process, its CDP event loop and its profile directory.
///
/// `close` shuts Chrome down politely; dropping the session on any other
/// path aborts the event loop, lets chromiumoxide kill the process and
/// removes the profile.
struct BrowserSession {
    browser: Option<Browser>,
    handler: JoinHandle<()>,
    _profile: ProfileDir,
}

impl BrowserSession {
    async fn launch(config: &Config) -> Result<Self, VitalsError> {
        let profile = ProfileDir::create().await?;
        let browser_config = create_browser_config(config, &profile.0)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| VitalsError::BrowserLaunch(e.to_string()))?;

        // The handler is a Stream and must be polled for any CDP command to complete
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler stopped: {}", e);
                    break;
                }
            }
        });

        debug!("Launched Chrome with profile {}", profile.0.display());

        Ok(Self {
            browser: Some(browser),
            handler,
            _profile: profile,
        })
    }

    async fn measure(&self, url: &str, poll_interval: Duration) -> Result<BrowserResult, VitalsError> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| VitalsError::BrowserLaunch("browser already closed".to_string()))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| VitalsError::BrowserLaunch(e.to_string()))?;

        let result = measure_page(&page, url, poll_interval).await;

        let _ = page.close().await;

        result
    }

    async fn close(mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                debug!("Chrome close command failed: {}", e);
            }
            match timeout(BROWSER_EXIT_GRACE, browser.wait()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("Waiting for Chrome to exit failed: {}", e),
                Err(_) => warn!("Chrome did not exit within {:?}, killing it", BROWSER_EXIT_GRACE),
            }
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

/// Throwaway Chrome profile, removed on drop
struct ProfileDir(PathBuf);

impl ProfileDir {
    async fn create() -> Result<Self, VitalsError> {
        let path = std::env::temp_dir().join(format!("page-vitals-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| VitalsError::BrowserLaunch(format!("Failed to create profile dir: {e}")))?;
        Ok(Self(path))
    }
}

impl Drop for ProfileDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            debug!("Could not remove Chrome profile {}: {}", self.0.display(), e);
        }
    }
}

async fn measure_page(page: &Page, url: &str, poll_interval: Duration) -> Result<BrowserResult, VitalsError> {
    page.goto(url)
        .await
        .map_err(|e| VitalsError::Navigation(e.to_string()))?;

    wait_for_visible_body(page, poll_interval).await?;

    let params = EvaluateParams::builder()
        .expression(MEASUREMENT_SCRIPT)
        .include_command_line_api(true)
        .return_by_value(true)
        .await_promise(true)
        .build()
        .map_err(VitalsError::Script)?;

    let raw: String = page
        .evaluate_expression(params)
        .await
        .map_err(|e| VitalsError::Script(e.to_string()))?
        .into_value()
        .map_err(|e| VitalsError::ResultParse(format!("script did not return a string: {e}")))?;

    parse_measurement(&raw)
}

async fn wait_for_visible_body(page: &Page, poll_interval: Duration) -> Result<(), VitalsError> {
    poll_until_visible(
        move || async move {
            page.evaluate(BODY_VISIBLE_CHECK)
                .await
                .map_err(|e| e.to_string())?
                .into_value::<bool>()
                .map_err(|e| e.to_string())
        },
        poll_interval,
    )
    .await
}

/// Re-run `check` until it reports a visible body.
///
/// A failed check counts as "not visible yet": a client-side redirect
/// destroys the execution context mid-poll and the next document gets its
/// own chance. Only a long unbroken run of failures gives up.
async fn poll_until_visible<F, Fut>(mut check: F, poll_interval: Duration) -> Result<(), VitalsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, String>>,
{
    let mut consecutive_errors = 0;

    loop {
        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => consecutive_errors = 0,
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_VISIBILITY_ERRORS {
                    return Err(VitalsError::VisibilityWait(e));
                }
                debug!("Visibility check failed, retrying: {}", e);
            }
        }

        sleep(poll_interval).await;
    }
}
