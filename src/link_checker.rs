//! Bounded-concurrency link reachability checks
//!
//! Every link gets its own task immediately; a semaphore caps how many of
//! them are talking to the network at once. Results come back in input
//! order no matter which probe finishes first.

use crate::{LinkHealth, VitalsError, VitalsMetrics};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Reachability probe for a single link. Failures are reported in the
/// returned `LinkHealth`, never as an error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LinkProber: Send + Sync {
    async fn check(&self, url: &str) -> LinkHealth;
}

/// HEAD request through a shared reqwest client
pub struct HeadLinkProber {
    client: reqwest::Client,
}

impl HeadLinkProber {
    pub fn new(timeout: Duration) -> Result<Self, VitalsError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("page-vitals/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VitalsError::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl LinkProber for HeadLinkProber {
    async fn check(&self, url: &str) -> LinkHealth {
        let start = Instant::now();
        match self.client.head(url).send().await {
            Ok(response) => {
                LinkHealth::reachable(url.to_string(), response.status().as_u16(), start.elapsed())
            }
            Err(e) => LinkHealth::unreachable(url.to_string(), start.elapsed(), e.to_string()),
        }
    }
}

pub struct LinkHealthChecker {
    prober: Arc<dyn LinkProber>,
    max_concurrent: usize,
    metrics: Arc<VitalsMetrics>,
}

impl LinkHealthChecker {
    pub fn new(prober: Arc<dyn LinkProber>, max_concurrent: usize, metrics: Arc<VitalsMetrics>) -> Self {
        Self {
            prober,
            max_concurrent: max_concurrent.max(1),
            metrics,
        }
    }

    /// Check every link; the output has the same length and order as `links`.
    ///
    /// Dropping the returned future aborts every probe still queued or in flight.
    pub async fn check(&self, links: Vec<String>) -> Vec<LinkHealth> {
        if links.is_empty() {
            return Vec::new();
        }

        debug!(
            "Checking {} links with at most {} in flight",
            links.len(),
            self.max_concurrent
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        for (index, url) in links.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let prober = self.prober.clone();

            tasks.spawn(async move {
                let start = Instant::now();
                let health = match semaphore.acquire_owned().await {
                    Ok(_permit) => prober.check(&url).await,
                    Err(_) => LinkHealth::unreachable(url, start.elapsed(), "link checker shut down".to_string()),
                };
                (index, health)
            });
        }

        let mut slots: Vec<Option<LinkHealth>> = vec![None; links.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, health)) => {
                    self.metrics.record_link_check(health.duration, health.is_reachable());
                    slots[index] = Some(health);
                }
                Err(e) => warn!("Link probe task failed: {}", e),
            }
        }

        // A slot is only empty if its task panicked
        slots
            .into_iter()
            .zip(links)
            .map(|(slot, url)| {
                slot.unwrap_or_else(|| {
                    LinkHealth::unreachable(url, Duration::ZERO, "link probe task failed".to_string())
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers after a delay derived from the URL so completion order is scrambled
    struct ScrambledProber {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScrambledProber {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LinkProber for ScrambledProber {
        async fn check(&self, url: &str) -> LinkHealth {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let n: u64 = url.rsplit('/').next().and_then(|s| s.parse().ok()).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis((n * 7919) % 23 + 1)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if n % 5 == 0 {
                LinkHealth::unreachable(url.to_string(), Duration::from_millis(1), "refused".to_string())
            } else {
                LinkHealth::reachable(url.to_string(), 200, Duration::from_millis(1))
            }
        }
    }

    fn links(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("https://example.com/{i}")).collect()
    }

    fn checker(prober: Arc<dyn LinkProber>, max_concurrent: usize) -> LinkHealthChecker {
        LinkHealthChecker::new(prober, max_concurrent, Arc::new(VitalsMetrics::new()))
    }

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let input = links(30);
        let results = checker(Arc::new(ScrambledProber::new()), 10).check(input.clone()).await;

        assert_eq!(results.len(), input.len());
        for (i, (health, url)) in results.iter().zip(&input).enumerate() {
            assert_eq!(&health.url, url);
            assert_eq!(health.is_reachable(), i % 5 != 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_never_exceeds_limit() {
        let prober = Arc::new(ScrambledProber::new());
        let results = checker(prober.clone(), 10).check(links(50)).await;

        assert_eq!(results.len(), 50);
        let peak = prober.peak.load(Ordering::SeqCst);
        assert!(peak <= 10, "peak in flight was {peak}");
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn test_limit_of_one_serializes() {
        let prober = Arc::new(ScrambledProber::new());
        let results = checker(prober.clone(), 1).check(links(8)).await;

        assert_eq!(results.len(), 8);
        assert_eq!(prober.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let mut prober = MockLinkProber::new();
        prober.expect_check().never();

        let results = checker(Arc::new(prober), 10).check(Vec::new()).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_are_checked_independently() {
        let mut prober = MockLinkProber::new();
        prober
            .expect_check()
            .times(3)
            .returning(|url| LinkHealth::reachable(url.to_string(), 204, Duration::from_millis(2)));

        let input = vec![
            "https://example.com/a".to_string(),
            "https://example.com/a".to_string(),
            "https://example.com/b".to_string(),
        ];
        let results = checker(Arc::new(prober), 10).check(input).await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|h| h.status_code == 204));
    }

    #[tokio::test]
    async fn test_head_prober_reports_refused_as_status_zero() {
        // Grab a free port and release it so the connect is refused
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let prober = HeadLinkProber::new(Duration::from_secs(5)).unwrap();
        let health = prober.check(&format!("http://{addr}/gone")).await;

        assert_eq!(health.status_code, 0);
        assert!(health.error.is_some());
    }
}
