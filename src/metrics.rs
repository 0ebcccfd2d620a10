use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;

use crate::io_util::{shutdown_with_timeout, write_all_with_timeout};
use crate::proxy::request::read_request;

const METRICS_PATH: &str = "/metrics";
const METRICS_MAX_REQUEST_BYTES: usize = 8192;
const METRICS_IO_TIMEOUT: Duration = Duration::from_secs(5);
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

struct ProxyMetrics {
    registry: Registry,
    requests: IntCounterVec,
    statuses: IntCounterVec,
    latency: HistogramVec,
    cache_lookups: IntCounterVec,
    cache_stores: IntCounter,
    cache_store_errors: IntCounter,
    origin_errors: IntCounterVec,
}

static METRICS: Lazy<ProxyMetrics> = Lazy::new(ProxyMetrics::new);

fn registered<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> C {
    registry
        .register(Box::new(collector.clone()))
        .expect("metric registered twice");
    collector
}

impl ProxyMetrics {
    fn new() -> Self {
        let registry = Registry::new();
        let counter_vec = |name: &str, help: &str, label: &str| {
            registered(
                &registry,
                IntCounterVec::new(Opts::new(name, help), &[label]).expect("valid counter opts"),
            )
        };
        let counter = |name: &str, help: &str| {
            registered(&registry, IntCounter::new(name, help).expect("valid counter opts"))
        };

        let requests = counter_vec("requests_total", "Client requests by disposition", "disposition");
        let statuses = counter_vec("requests_status_total", "Client responses by status class", "status_class");
        let latency = registered(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("request_latency_seconds", "Connection handling time by disposition")
                    .buckets(LATENCY_BUCKETS.to_vec()),
                &["disposition"],
            )
            .expect("valid histogram opts"),
        );
        let cache_lookups = counter_vec("cache_lookups_total", "Cache lookups by result", "result");
        let cache_stores = counter("cache_stores_total", "Responses written to the cache");
        let cache_store_errors = counter("cache_store_errors_total", "Failed cache writes");
        let origin_errors = counter_vec("origin_errors_total", "Origin fetch failures by kind", "kind");

        Self {
            registry,
            requests,
            statuses,
            latency,
            cache_lookups,
            cache_stores,
            cache_store_errors,
            origin_errors,
        }
    }
}

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "none",
    }
}

pub fn record_request(disposition: &str, status: u16, elapsed: Duration) {
    METRICS.requests.with_label_values(&[disposition]).inc();
    METRICS
        .statuses
        .with_label_values(&[status_class(status)])
        .inc();
    METRICS
        .latency
        .with_label_values(&[disposition])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(result: &str) {
    METRICS.cache_lookups.with_label_values(&[result]).inc();
}

pub fn record_cache_store() {
    METRICS.cache_stores.inc();
}

pub fn record_cache_store_error() {
    METRICS.cache_store_errors.inc();
}

pub fn record_origin_error(kind: &str) {
    METRICS.origin_errors.with_label_values(&[kind]).inc();
}

/// Current values in the Prometheus text exposition format.
pub fn gather() -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&METRICS.registry.gather(), &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "failed to accept metrics connection");
                continue;
            }
        };
        tokio::spawn(async move {
            if let Err(err) =
                handle_scrape(stream, METRICS_IO_TIMEOUT, METRICS_MAX_REQUEST_BYTES).await
            {
                tracing::debug!(peer = %peer, error = %err, "metrics request failed");
            }
        });
    }
}

async fn handle_scrape<S>(stream: S, io_timeout: Duration, max_request_bytes: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let Some((request, _)) = read_request(&mut reader, io_timeout, max_request_bytes)
        .await
        .context("failed reading metrics request")?
    else {
        return Ok(());
    };

    let (status_line, content_type, body) = if request.uri == METRICS_PATH {
        ("200 OK", "text/plain; version=0.0.4", gather())
    } else {
        ("404 Not Found", "text/plain", b"not found\n".to_vec())
    };
    let mut response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(&body);

    let stream = reader.get_mut();
    write_all_with_timeout(stream, &response, io_timeout, "writing metrics response").await?;
    shutdown_with_timeout(stream, io_timeout).await
}
