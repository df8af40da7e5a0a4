//! Measurement orchestration
//!
//! Runs the network and browser probes side by side, waits for both, then
//! checks every link the browser found. Only a fully successful analysis
//! produces a report.

use crate::{
    BrowserProbe, ChromeBrowserProbe, Config, FullReport, HeadLinkProber, HttpNetworkProbe,
    LinkHealthChecker, LinkProber, NetworkProbe, VitalsError, VitalsMetrics,
};
use crate::utils::AbortOnDrop;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub struct Analyzer {
    network: Arc<dyn NetworkProbe>,
    browser: Arc<dyn BrowserProbe>,
    links: LinkHealthChecker,
    metrics: Arc<VitalsMetrics>,
}

impl Analyzer {
    /// Analyzer backed by the real probes.
    pub fn new(config: Config) -> Result<Self, VitalsError> {
        crate::validate_config(&config)?;

        let network = Arc::new(HttpNetworkProbe::from_config(&config));
        let link_prober = Arc::new(HeadLinkProber::new(config.link_timeout)?);
        let max_concurrent = config.max_concurrent_links;
        let browser = Arc::new(ChromeBrowserProbe::new(config));

        Ok(Self::with_probes(
            network,
            browser,
            link_prober,
            max_concurrent,
            Arc::new(VitalsMetrics::new()),
        ))
    }

    pub fn with_probes(
        network: Arc<dyn NetworkProbe>,
        browser: Arc<dyn BrowserProbe>,
        link_prober: Arc<dyn LinkProber>,
        max_concurrent_links: usize,
        metrics: Arc<VitalsMetrics>,
    ) -> Self {
        Self {
            network,
            browser,
            links: LinkHealthChecker::new(link_prober, max_concurrent_links, metrics.clone()),
            metrics,
        }
    }

    /// Measure `url` and build the full report.
    ///
    /// Dropping the returned future aborts both probes and any link checks
    /// still running.
    pub async fn analyze(&self, url: &str) -> Result<FullReport, VitalsError> {
        let start_time = Instant::now();
        let result = self.run(url).await;

        self.metrics.record_analysis(start_time.elapsed(), result.is_ok());
        match &result {
            Ok(report) => info!(
                "Analysis of {} completed in {:?}: {} links, {} unreachable",
                url,
                start_time.elapsed(),
                report.links_health.len(),
                report.unreachable_links().count()
            ),
            Err(e) => error!("Analysis of {} failed: {}", url, e),
        }

        result
    }

    /// Like `analyze`, but gives up with `Cancelled` as soon as `cancelled` resolves.
    pub async fn analyze_until<F>(&self, url: &str, cancelled: F) -> Result<FullReport, VitalsError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.analyze(url) => result,
            _ = cancelled => {
                warn!("Analysis of {} cancelled", url);
                Err(VitalsError::Cancelled)
            }
        }
    }

    async fn run(&self, url: &str) -> Result<FullReport, VitalsError> {
        let target = url.trim();
        if target.is_empty() {
            return Err(VitalsError::InvalidUrl("target URL is empty".to_string()));
        }

        let network_task = {
            let probe = self.network.clone();
            let target = target.to_string();
            let metrics = self.metrics.clone();
            AbortOnDrop(tokio::spawn(async move {
                let start = Instant::now();
                let result = probe.probe(&target).await;
                metrics.record_network_probe(start.elapsed());
                result
            }))
        };

        let browser_task = {
            let probe = self.browser.clone();
            let target = target.to_string();
            let metrics = self.metrics.clone();
            AbortOnDrop(tokio::spawn(async move {
                let start = Instant::now();
                let result = probe.probe(&target).await;
                metrics.record_browser_probe(start.elapsed());
                result
            }))
        };

        // Both must finish before either outcome is looked at
        let (network, browser) = tokio::join!(network_task, browser_task);
        let network = network.map_err(VitalsError::from).and_then(|r| r);
        let browser = browser.map_err(VitalsError::from).and_then(|r| r);

        let (network, browser) = match (network, browser) {
            (Ok(network), Ok(browser)) => (network, browser),
            (Err(net_err), Err(browser_err)) => {
                warn!("Browser probe also failed: {}", browser_err);
                return Err(net_err);
            }
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => return Err(e),
        };

        let links_health = self.links.check(browser.links.clone()).await;

        Ok(FullReport {
            network,
            browser,
            links_health,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BrowserResult, LinkHealth, MockBrowserProbe, MockLinkProber, MockNetworkProbe, NetworkStats,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn stats(url: &str) -> NetworkStats {
        NetworkStats {
            url: url.to_string(),
            dns_lookup: Duration::from_millis(3),
            tcp_connection: Duration::from_millis(8),
            ttfb: Duration::from_millis(40),
            total_time: Duration::from_millis(55),
            status_code: 200,
            ..Default::default()
        }
    }

    fn page(links: &[&str]) -> BrowserResult {
        BrowserResult {
            fcp: 321.0,
            links: links.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn ok_links() -> MockLinkProber {
        let mut prober = MockLinkProber::new();
        prober
            .expect_check()
            .returning(|url| LinkHealth::reachable(url.to_string(), 200, Duration::from_millis(5)));
        prober
    }

    fn analyzer(
        network: MockNetworkProbe,
        browser: MockBrowserProbe,
        links: MockLinkProber,
    ) -> Analyzer {
        Analyzer::with_probes(
            Arc::new(network),
            Arc::new(browser),
            Arc::new(links),
            10,
            Arc::new(VitalsMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_successful_analysis() {
        let mut network = MockNetworkProbe::new();
        network.expect_probe().times(1).returning(|url| Ok(stats(url)));

        let mut browser = MockBrowserProbe::new();
        browser.expect_probe().times(1).returning(|_| {
            Ok(page(&["https://example.com/a", "https://example.com/b", "https://example.com/a"]))
        });

        let report = analyzer(network, browser, ok_links())
            .analyze("https://example.com")
            .await
            .unwrap();

        assert_eq!(report.network.status_code, 200);
        assert_eq!(report.browser.fcp, 321.0);
        assert_eq!(report.links_health.len(), report.browser.links.len());
        for (health, link) in report.links_health.iter().zip(&report.browser.links) {
            assert_eq!(&health.url, link);
        }
    }

    #[tokio::test]
    async fn test_no_links_gives_empty_health() {
        let mut network = MockNetworkProbe::new();
        network.expect_probe().returning(|url| Ok(stats(url)));
        let mut browser = MockBrowserProbe::new();
        browser.expect_probe().returning(|_| Ok(page(&[])));
        let mut links = MockLinkProber::new();
        links.expect_check().never();

        let report = analyzer(network, browser, links)
            .analyze("https://example.com")
            .await
            .unwrap();

        assert!(report.links_health.is_empty());
    }

    #[tokio::test]
    async fn test_network_failure_fails_analysis() {
        let mut network = MockNetworkProbe::new();
        network
            .expect_probe()
            .returning(|_| Err(VitalsError::Transport("connection refused".into())));
        let mut browser = MockBrowserProbe::new();
        browser.expect_probe().times(1).returning(|_| Ok(page(&["https://example.com/a"])));
        let mut links = MockLinkProber::new();
        links.expect_check().never();

        let err = analyzer(network, browser, links)
            .analyze("https://example.com")
            .await
            .unwrap_err();

        assert!(matches!(err, VitalsError::Transport(_)));
    }

    #[tokio::test]
    async fn test_browser_failure_fails_analysis() {
        let mut network = MockNetworkProbe::new();
        network.expect_probe().times(1).returning(|url| Ok(stats(url)));
        let mut browser = MockBrowserProbe::new();
        browser
            .expect_probe()
            .returning(|_| Err(VitalsError::ResultParse("expected value".into())));
        let mut links = MockLinkProber::new();
        links.expect_check().never();

        let err = analyzer(network, browser, links)
            .analyze("https://example.com")
            .await
            .unwrap_err();

        assert!(matches!(err, VitalsError::ResultParse(_)));
    }

    #[tokio::test]
    async fn test_both_failures_report_network_error() {
        let mut network = MockNetworkProbe::new();
        network
            .expect_probe()
            .returning(|_| Err(VitalsError::NetworkTimeout(Duration::from_secs(10))));
        let mut browser = MockBrowserProbe::new();
        browser
            .expect_probe()
            .returning(|_| Err(VitalsError::Navigation("net::ERR_NAME_NOT_RESOLVED".into())));

        let err = analyzer(network, browser, ok_links())
            .analyze("https://example.com")
            .await
            .unwrap_err();

        assert!(matches!(err, VitalsError::NetworkTimeout(_)));
    }

    #[tokio::test]
    async fn test_empty_url_rejected_before_probing() {
        let mut network = MockNetworkProbe::new();
        network.expect_probe().never();
        let mut browser = MockBrowserProbe::new();
        browser.expect_probe().never();

        let err = analyzer(network, browser, ok_links())
            .analyze("   ")
            .await
            .unwrap_err();

        assert!(matches!(err, VitalsError::InvalidUrl(_)));
    }

    /// Browser probe that never finishes and notes whether it was torn down
    struct HangingBrowser {
        dropped: Arc<AtomicBool>,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl BrowserProbe for HangingBrowser {
        async fn probe(&self, _target: &str) -> Result<BrowserResult, VitalsError> {
            let _guard = SetOnDrop(self.dropped.clone());
            futures::future::pending::<()>().await;
            Ok(page(&[]))
        }
    }

    #[tokio::test]
    async fn test_cancellation_aborts_probes() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut network = MockNetworkProbe::new();
        network.expect_probe().returning(|url| Ok(stats(url)));

        let analyzer = Analyzer::with_probes(
            Arc::new(network),
            Arc::new(HangingBrowser {
                dropped: dropped.clone(),
            }),
            Arc::new(ok_links()),
            10,
            Arc::new(VitalsMetrics::new()),
        );

        let err = analyzer
            .analyze_until("https://example.com", tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert!(matches!(err, VitalsError::Cancelled));

        // Abort is delivered on the task's next poll
        for _ in 0..50 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }
}
