//! # Page Vitals
//!
//! Measures how a web page performs from three angles in one request:
//!
//! - **Network**: a single cold GET broken into DNS lookup, TCP connect, TLS
//!   handshake and time to first byte.
//! - **Rendering**: a headless Chrome load reporting first contentful paint
//!   and the same-origin links on the page.
//! - **Link health**: a HEAD request against every discovered link, at most
//!   ten at a time, reported in page order.
//!
//! The network and browser probes run in parallel; link checks start once
//! both have finished. Any probe failure fails the whole analysis, while an
//! unreachable link is just data in the report.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use page_vitals::{Analyzer, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let analyzer = Analyzer::new(Config::default())?;
//!     let report = analyzer.analyze("https://example.com").await?;
//!
//!     println!("TTFB: {:?}", report.network.ttfb);
//!     println!("FCP: {:.1}ms", report.browser.fcp);
//!     println!("Broken links: {}", report.unreachable_links().count());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! page-vitals analyze --url https://example.com
//! page-vitals analyze --url https://example.com --json
//! page-vitals network --url https://example.com
//! PORT=8080 page-vitals serve
//! curl -X POST 'http://localhost:8080/check?url=https://example.com'
//! ```

/// Configuration and settings
pub mod config;

/// Error types and error classification
pub mod error;

/// Measurement records and the aggregate report
pub mod report;

/// Instrumented raw HTTP timing probe
pub mod network_probe;

/// Headless Chrome rendering probe
pub mod browser_probe;

/// Bounded-concurrency link reachability checks
pub mod link_checker;

/// Parallel probe orchestration
pub mod analyzer;

/// HTTP API
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Metrics handles and Prometheus exporter
pub mod telemetry;

/// Utility functions and helpers
pub mod utils;


pub use analyzer::*;
pub use browser_probe::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use link_checker::*;
pub use telemetry::*;
pub use network_probe::*;
pub use report::*;
pub use server::*;
pub use utils::*;
