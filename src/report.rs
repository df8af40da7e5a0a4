//! Measurement records produced by the probes and the aggregate report.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing breakdown of one raw HTTP fetch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub url: String,
    /// Time to resolve the host name; zero for IP literals
    #[serde(rename = "dns_lookup_ms", with = "millis")]
    pub dns_lookup: Duration,
    /// Time to establish the TCP connection
    #[serde(rename = "tcp_connection_ms", with = "millis")]
    pub tcp_connection: Duration,
    /// Time to negotiate TLS; zero for plain HTTP
    #[serde(rename = "tls_handshake_ms", with = "millis")]
    pub tls_handshake: Duration,
    /// From the request being fully written to the first response byte
    #[serde(rename = "ttfb_ms", with = "millis")]
    pub ttfb: Duration,
    /// From probe invocation to response headers received
    #[serde(rename = "total_time_ms", with = "millis")]
    pub total_time: Duration,
    pub status_code: u16,
}

/// What the in-page script reported
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserResult {
    /// First contentful paint, in the engine's unit (milliseconds since navigation start)
    pub fcp: f64,
    pub links: Vec<String>,
}

/// Reachability of one discovered link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkHealth {
    pub url: String,
    /// Zero when the probe never got a response
    pub status_code: u16,
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LinkHealth {
    pub fn reachable(url: String, status_code: u16, duration: Duration) -> Self {
        Self {
            url,
            status_code,
            duration,
            error: None,
        }
    }

    pub fn unreachable(url: String, duration: Duration, error: String) -> Self {
        Self {
            url,
            status_code: 0,
            duration,
            error: Some(error),
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.status_code != 0
    }

    pub fn status_class(&self) -> StatusClass {
        StatusClass::of(self.status_code)
    }
}

/// Everything measured for one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullReport {
    pub network: NetworkStats,
    pub browser: BrowserResult,
    /// Same length and order as `browser.links`
    pub links_health: Vec<LinkHealth>,
}

impl FullReport {
    pub fn unreachable_links(&self) -> impl Iterator<Item = &LinkHealth> {
        self.links_health.iter().filter(|link| !link.is_reachable())
    }
}

/// Bucket of an HTTP status code for presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Success,
    Redirect,
    /// 4xx, 5xx, or no response at all
    Failure,
    Unknown,
}

impl StatusClass {
    pub fn of(code: u16) -> Self {
        match code {
            200..=299 => StatusClass::Success,
            300..=399 => StatusClass::Redirect,
            0 | 400.. => StatusClass::Failure,
            _ => StatusClass::Unknown,
        }
    }
}

/// Durations on the wire are fractional milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_nanos() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(ms / 1000.0))
    }
}
