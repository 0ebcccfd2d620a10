use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub const ACCESS_LOG_TARGET: &str = "access_log";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = fmt::fmt().with_env_filter(filter);

    match format {
        LogFormat::Json => builder
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .try_init(),
        LogFormat::Text => builder.compact().try_init(),
    }
    .map_err(|err| anyhow!(err))
}

/// One line per client connection.
#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub peer: SocketAddr,
    pub method: Option<String>,
    pub host: Option<String>,
    pub path: Option<String>,
    pub cache_lookup: Option<&'static str>,
    pub cache_store: Option<&'static str>,
    pub disposition: &'static str,
    pub status: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elapsed: Duration,
    pub origin: Option<SocketAddr>,
    pub error: Option<(&'static str, String)>,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            event: AccessLogEvent {
                peer,
                method: None,
                host: None,
                path: None,
                cache_lookup: None,
                cache_store: None,
                disposition: "unknown",
                status: 0,
                bytes_in: 0,
                bytes_out: 0,
                elapsed: Duration::ZERO,
                origin: None,
                error: None,
            },
        }
    }

    pub fn request(mut self, method: &str, host: &str, path: &str) -> Self {
        self.event.method = Some(method.to_string());
        self.event.host = Some(host.to_string());
        self.event.path = Some(path.to_string());
        self
    }

    pub fn cache_lookup(mut self, result: &'static str) -> Self {
        self.event.cache_lookup = Some(result);
        self
    }

    pub fn cache_store(mut self, result: &'static str) -> Self {
        self.event.cache_store = Some(result);
        self
    }

    pub fn disposition(mut self, disposition: &'static str) -> Self {
        self.event.disposition = disposition;
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.event.status = status;
        self
    }

    pub fn bytes(mut self, bytes_in: u64, bytes_out: u64) -> Self {
        self.event.bytes_in = bytes_in;
        self.event.bytes_out = bytes_out;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed = elapsed;
        self
    }

    pub fn origin(mut self, addr: SocketAddr) -> Self {
        self.event.origin = Some(addr);
        self
    }

    /// Replaces any earlier error.
    pub fn error(mut self, reason: &'static str, detail: impl Into<String>) -> Self {
        self.event.error = Some((reason, detail.into()));
        self
    }

    pub fn build(self) -> AccessLogEvent {
        self.event
    }

    pub fn log(self) {
        log_access(&self.build());
    }
}

pub fn log_access(event: &AccessLogEvent) {
    let ts = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    let (error_reason, error_detail) = match &event.error {
        Some((reason, detail)) => (Some(*reason), Some(detail.as_str())),
        None => (None, None),
    };
    let origin = event.origin.map(|addr| addr.to_string());

    tracing::info!(
        target: ACCESS_LOG_TARGET,
        ts,
        client = %event.peer,
        method = event.method.as_deref(),
        host = event.host.as_deref(),
        path = event.path.as_deref(),
        cache_lookup = event.cache_lookup,
        cache_store = event.cache_store,
        disposition = event.disposition,
        status = event.status,
        bytes_in = event.bytes_in,
        bytes_out = event.bytes_out,
        elapsed_ms = event.elapsed.as_millis() as u64,
        origin = origin.as_deref(),
        error_reason,
        error_detail
    );

    crate::metrics::record_request(event.disposition, event.status, event.elapsed);
}
