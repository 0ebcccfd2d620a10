use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, trace, warn};

use super::AppContext;
use super::cache::{CacheEntry, CacheKey};
use super::origin::OriginRequest;
use super::request::{RequestReadError, read_request};
use super::response::{Disposition, OriginResponse};
use super::target::NormalizedTarget;
use crate::io_util::{shutdown_with_timeout, write_all_with_timeout};
use crate::logging::AccessLogBuilder;
use crate::metrics;

/// Serves exactly one request on `stream` and closes it.
pub async fn handle_client<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let started = Instant::now();
    let client_timeout = app.settings.client_timeout();
    let mut client = BufReader::new(stream);
    let log = AccessLogBuilder::new(peer);

    let (request, bytes_in) = match read_request(
        &mut client,
        client_timeout,
        app.settings.max_request_header_size,
    )
    .await
    {
        Ok(Some(parsed)) => parsed,
        Ok(None) => {
            trace!(peer = %peer, "client closed without sending a request");
            return Ok(());
        }
        Err(RequestReadError::Io(err)) => {
            log.disposition("client_error")
                .error("client_read", err.to_string())
                .elapsed(started.elapsed())
                .log();
            return Err(err).context("failed reading client request");
        }
        Err(err) => {
            debug!(peer = %peer, error = %err, "rejecting client request");
            let (status, reason) = match err {
                RequestReadError::Timeout => (StatusCode::REQUEST_TIMEOUT, "client_timeout"),
                RequestReadError::TooLarge { .. } => (StatusCode::BAD_REQUEST, "request_too_large"),
                _ => (StatusCode::BAD_REQUEST, "malformed_request"),
            };
            let log = log.error(reason, err.to_string());
            return respond_error(client.get_mut(), status, client_timeout, 0, started, log).await;
        }
    };
    let bytes_in = bytes_in as u64;

    let target = NormalizedTarget::from_uri(&request.uri);
    let key = CacheKey::from(&target);
    let log = log.request(request.method.as_str(), &target.host, &target.path);

    let lookup = match app.cache.lookup(&key).await {
        Some(entry) if app.cache.is_valid(&entry, SystemTime::now()) => {
            metrics::record_cache_lookup("hit");
            trace!(key = %key, "serving response from cache");
            let status = status_code(&OriginResponse::parse(&entry.response));
            let result = relay(client.get_mut(), &entry.response, client_timeout).await;
            finish(
                log.cache_lookup("hit").disposition("cache_hit"),
                status,
                bytes_in,
                &entry.response,
                &result,
                started,
            );
            return result;
        }
        Some(_) => "stale",
        None => "miss",
    };
    metrics::record_cache_lookup(lookup);
    let log = log.cache_lookup(lookup);

    let origin_request = OriginRequest {
        method: request.method.as_str(),
        host: &target.host,
        path: &target.path,
        version: &request.version,
    };
    let fetched = match app.origin.fetch(&origin_request).await {
        Ok(fetched) => fetched,
        Err(err) => {
            metrics::record_origin_error(err.kind.as_str());
            warn!(host = %target.host, kind = %err.kind, error = %err, "origin fetch failed");
            let log = log.error("origin_unreachable", err.to_string());
            return respond_error(
                client.get_mut(),
                StatusCode::BAD_GATEWAY,
                client_timeout,
                bytes_in,
                started,
                log,
            )
            .await;
        }
    };

    let response = OriginResponse::parse(&fetched.raw);
    let disposition = response.classify();
    if let Disposition::Redirect { location } = &disposition {
        debug!(host = %target.host, location = location.as_deref(), "relaying origin redirect");
    }
    let result = relay(client.get_mut(), &fetched.raw, client_timeout).await;
    drop(client);

    let cache_store = match disposition.store_max_age() {
        Some(max_age) => {
            let entry = CacheEntry::new(fetched.raw.clone(), max_age);
            match app.cache.store(&key, &entry).await {
                Ok(()) => {
                    metrics::record_cache_store();
                    "stored"
                }
                Err(err) => {
                    metrics::record_cache_store_error();
                    warn!(key = %key, error = %err, "failed to store cache entry");
                    "failed"
                }
            }
        }
        None => "skipped",
    };

    finish(
        log.cache_store(cache_store)
            .disposition(disposition.as_str())
            .origin(fetched.origin_addr),
        status_code(&response),
        bytes_in,
        &fetched.raw,
        &result,
        started,
    );
    result
}

fn status_code(response: &OriginResponse) -> u16 {
    response.status().map(|status| status.as_u16()).unwrap_or(0)
}

async fn relay<S>(stream: &mut S, bytes: &[u8], timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_all_with_timeout(stream, bytes, timeout_dur, "writing response to client").await?;
    shutdown_with_timeout(stream, timeout_dur).await
}

fn finish(
    log: AccessLogBuilder,
    status: u16,
    bytes_in: u64,
    response: &[u8],
    result: &Result<()>,
    started: Instant,
) {
    let (log, bytes_out) = match result {
        Ok(()) => (log, response.len() as u64),
        Err(err) => (
            log.error("client_write", format!("{err:#}")),
            0,
        ),
    };
    log.status(status)
        .bytes(bytes_in, bytes_out)
        .elapsed(started.elapsed())
        .log();
}

async fn respond_error<S>(
    stream: &mut S,
    status: StatusCode,
    timeout_dur: Duration,
    bytes_in: u64,
    started: Instant,
    log: AccessLogBuilder,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let body = format!("{} {}\n", status.as_u16(), reason);
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
        status.as_u16(),
        reason,
        body.len(),
        body
    );
    let result = relay(stream, response.as_bytes(), timeout_dur).await;
    finish(
        log.disposition("error"),
        status.as_u16(),
        bytes_in,
        response.as_bytes(),
        &result,
        started,
    );
    result
}
