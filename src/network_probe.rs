//! Instrumented raw HTTP probe
//!
//! Issues one cold GET against the target and breaks the fetch into DNS, TCP,
//! TLS and time-to-first-byte phases. The connection is built by hand (tokio
//! lookup and connect, native-tls handshake, hyper HTTP/1.1 client connection)
//! so every lifecycle instant can be observed directly.

use crate::utils::AbortOnDrop;
use crate::{validate_url, Config, NetworkStats, VitalsError};
use async_trait::async_trait;
use futures::future::poll_fn;
use hyper::client::conn;
use hyper::header::{CONNECTION, HOST, USER_AGENT};
use hyper::{Body, Method, Request};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::{native_tls, TlsConnector};
use tracing::{debug, info};
use url::{Host, Url};

const PROBE_USER_AGENT: &str = concat!("page-vitals/", env!("CARGO_PKG_VERSION"));

/// A single timed fetch of the target URL
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn probe(&self, target: &str) -> Result<NetworkStats, VitalsError>;
}

/// Instants observed during one fetch. A phase is only measured when both of
/// its instants were recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTrace {
    pub dns_start: Option<Instant>,
    pub dns_done: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_done: Option<Instant>,
    pub tls_start: Option<Instant>,
    pub tls_done: Option<Instant>,
    pub wrote_request: Option<Instant>,
    pub first_byte: Option<Instant>,
}

impl PhaseTrace {
    pub fn into_stats(
        self,
        url: String,
        status_code: u16,
        started: Instant,
        headers_at: Instant,
    ) -> NetworkStats {
        NetworkStats {
            url,
            dns_lookup: phase(self.dns_start, self.dns_done),
            tcp_connection: phase(self.connect_start, self.connect_done),
            tls_handshake: phase(self.tls_start, self.tls_done),
            ttfb: phase(self.wrote_request, self.first_byte),
            total_time: headers_at.saturating_duration_since(started),
            status_code,
        }
    }
}

/// Length of a phase, zero unless both ends were observed.
pub fn phase(start: Option<Instant>, end: Option<Instant>) -> Duration {
    match (start, end) {
        (Some(start), Some(end)) => end.saturating_duration_since(start),
        _ => Duration::ZERO,
    }
}

/// Network probe over a fresh, unpooled connection with certificate checks off
pub struct HttpNetworkProbe {
    timeout: Duration,
}

impl HttpNetworkProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.network_timeout)
    }

    async fn fetch(&self, url: &Url, started: Instant) -> Result<NetworkStats, VitalsError> {
        let host = url
            .host()
            .ok_or_else(|| VitalsError::InvalidUrl(format!("{url} has no host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| VitalsError::InvalidUrl(format!("{url} has no port")))?;

        let mut trace = PhaseTrace::default();
        let addrs = resolve(&host, port, &mut trace).await?;
        let tcp = connect(&addrs, &mut trace).await?;

        let marks = Arc::new(IoMarks::default());
        let (status_code, headers_at) = if url.scheme() == "https" {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| VitalsError::Transport(format!("TLS setup failed: {e}")))?;
            let connector = TlsConnector::from(connector);
            let domain = host.to_string();

            trace.tls_start = Some(Instant::now());
            let tls = connector
                .connect(domain.trim_start_matches('[').trim_end_matches(']'), tcp)
                .await
                .map_err(|e| VitalsError::Transport(format!("TLS handshake failed: {e}")))?;
            trace.tls_done = Some(Instant::now());

            send_get(tls, url, marks.clone()).await?
        } else {
            send_get(tcp, url, marks.clone()).await?
        };

        (trace.wrote_request, trace.first_byte) = marks.snapshot();

        Ok(trace.into_stats(url.to_string(), status_code, started, headers_at))
    }
}

#[async_trait]
impl NetworkProbe for HttpNetworkProbe {
    async fn probe(&self, target: &str) -> Result<NetworkStats, VitalsError> {
        let started = Instant::now();
        let url = validate_url(target).map_err(|e| VitalsError::InvalidUrl(format!("{target}: {e}")))?;

        debug!("Starting network probe for {}", url);

        let stats = match timeout(self.timeout, self.fetch(&url, started)).await {
            Ok(result) => result?,
            Err(_) => return Err(VitalsError::NetworkTimeout(self.timeout)),
        };

        info!(
            "Network probe for {} finished: status {}, dns {:?}, tcp {:?}, tls {:?}, ttfb {:?}, total {:?}",
            stats.url,
            stats.status_code,
            stats.dns_lookup,
            stats.tcp_connection,
            stats.tls_handshake,
            stats.ttfb,
            stats.total_time
        );

        Ok(stats)
    }
}

async fn resolve(
    host: &Host<&str>,
    port: u16,
    trace: &mut PhaseTrace,
) -> Result<Vec<SocketAddr>, VitalsError> {
    // IP literals never hit the resolver, so the DNS phase stays unrecorded
    let domain = match host {
        Host::Ipv4(ip) => return Ok(vec![SocketAddr::new((*ip).into(), port)]),
        Host::Ipv6(ip) => return Ok(vec![SocketAddr::new((*ip).into(), port)]),
        Host::Domain(domain) => *domain,
    };

    trace.dns_start = Some(Instant::now());
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((domain, port))
        .await
        .map_err(|e| VitalsError::Transport(format!("DNS lookup for {domain} failed: {e}")))?
        .collect();
    trace.dns_done = Some(Instant::now());

    if addrs.is_empty() {
        return Err(VitalsError::Transport(format!(
            "DNS lookup for {domain} returned no addresses"
        )));
    }

    Ok(addrs)
}

async fn connect(addrs: &[SocketAddr], trace: &mut PhaseTrace) -> Result<TcpStream, VitalsError> {
    let mut last_error = None;
    for addr in addrs {
        // Only the attempt that succeeds counts toward the connect phase
        trace.connect_start = Some(Instant::now());
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                trace.connect_done = Some(Instant::now());
                return Ok(stream);
            }
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(VitalsError::Transport(format!(
        "TCP connect failed: {}",
        last_error.map(|e| e.to_string()).unwrap_or_else(|| "no address".to_string())
    )))
}

/// Send the GET over an already established stream and wait for the response head.
async fn send_get<S>(
    stream: S,
    url: &Url,
    marks: Arc<IoMarks>,
) -> Result<(u16, Instant), VitalsError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, connection) = conn::handshake(TracedStream::new(stream, marks))
        .await
        .map_err(|e| VitalsError::Transport(e.to_string()))?;

    // Aborted on every exit path, including cancellation of the caller
    let _driver = AbortOnDrop(tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Timed connection closed with error: {}", e);
        }
    }));

    poll_fn(|cx| sender.poll_ready(cx))
        .await
        .map_err(|e| VitalsError::Transport(e.to_string()))?;

    let request = Request::builder()
        .method(Method::GET)
        .uri(request_target(url))
        .header(HOST, host_header(url))
        .header(USER_AGENT, PROBE_USER_AGENT)
        .header(CONNECTION, "close")
        .body(Body::empty())
        .map_err(|e| VitalsError::InvalidUrl(e.to_string()))?;

    let result = sender.send_request(request).await;
    let headers_at = Instant::now();

    // The body is never read; dropping it and the driver closes the socket
    result
        .map(|response| (response.status().as_u16(), headers_at))
        .map_err(|e| VitalsError::Transport(e.to_string()))
}

fn request_target(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Instants recorded from inside the hyper connection task
#[derive(Debug, Default)]
struct IoMarks {
    wrote_request: Mutex<Option<Instant>>,
    first_byte: OnceLock<Instant>,
}

impl IoMarks {
    fn record_write(&self) {
        // Only writes that precede the response belong to the request
        if self.first_byte.get().is_some() {
            return;
        }
        if let Ok(mut wrote) = self.wrote_request.lock() {
            *wrote = Some(Instant::now());
        }
    }

    fn record_read(&self) {
        self.first_byte.get_or_init(Instant::now);
    }

    fn snapshot(&self) -> (Option<Instant>, Option<Instant>) {
        let wrote = self.wrote_request.lock().ok().and_then(|wrote| *wrote);
        (wrote, self.first_byte.get().copied())
    }
}

/// Stream wrapper that timestamps the last request write and the first response byte
struct TracedStream<S> {
    inner: S,
    marks: Arc<IoMarks>,
}

impl<S> TracedStream<S> {
    fn new(inner: S, marks: Arc<IoMarks>) -> Self {
        Self { inner, marks }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TracedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.marks.record_read();
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TracedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            this.marks.record_write();
        }
        poll
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            this.marks.record_write();
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        if matches!(poll, Poll::Ready(Ok(()))) {
            this.marks.record_write();
        }
        poll
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
