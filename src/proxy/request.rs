use std::time::Duration;

use http::Method;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::{Instant, timeout};

/// The request line of a client request. Header lines are read and discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: String,
    pub version: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed request: {reason}")]
pub struct MalformedRequest {
    pub reason: String,
}

impl MalformedRequest {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RequestReadError {
    #[error(transparent)]
    Malformed(#[from] MalformedRequest),
    #[error("request head exceeds configured limit of {limit} bytes")]
    TooLarge { limit: usize },
    #[error("timed out reading request head")]
    Timeout,
    #[error("failed reading request head")]
    Io(#[source] std::io::Error),
}

impl ProxyRequest {
    /// Accepts exactly three whitespace-separated tokens: method, request-target, version.
    /// The version is passed through unchecked.
    pub fn parse_request_line(line: &str) -> Result<Self, MalformedRequest> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [method, uri, version] = tokens.as_slice() else {
            return Err(MalformedRequest::new(format!(
                "expected 3 request line tokens, found {}",
                tokens.len()
            )));
        };
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| MalformedRequest::new(format!("invalid method '{method}'")))?;
        Ok(Self {
            method,
            uri: uri.to_string(),
            version: version.to_string(),
        })
    }
}

/// Reads the request line and drains header lines up to the blank line.
///
/// Returns `Ok(None)` when the client closes without sending anything. The whole head,
/// request line included, must arrive within `head_timeout` and fit in `max_head_bytes`.
pub async fn read_request<S>(
    reader: &mut BufReader<S>,
    head_timeout: Duration,
    max_head_bytes: usize,
) -> Result<Option<(ProxyRequest, usize)>, RequestReadError>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + head_timeout;
    let mut total = 0usize;

    let Some(request_line) = read_line(reader, deadline, max_head_bytes, &mut total).await? else {
        return Ok(None);
    };
    let request_line = String::from_utf8(request_line)
        .map_err(|_| MalformedRequest::new("request line contained invalid bytes"))?;
    let request = ProxyRequest::parse_request_line(&request_line)?;

    loop {
        match read_line(reader, deadline, max_head_bytes, &mut total).await? {
            None => break,
            Some(line) if trim_line_ending(&line).is_empty() => break,
            Some(_) => {}
        }
    }

    Ok(Some((request, total)))
}

async fn read_line<S>(
    reader: &mut BufReader<S>,
    deadline: Instant,
    max_head_bytes: usize,
    total: &mut usize,
) -> Result<Option<Vec<u8>>, RequestReadError>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(RequestReadError::Timeout)?;
        let available = match timeout(remaining, reader.fill_buf()).await {
            Ok(Ok(available)) => available,
            Ok(Err(err)) => return Err(RequestReadError::Io(err)),
            Err(_) => return Err(RequestReadError::Timeout),
        };

        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            break;
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());
        if total.saturating_add(consume) > max_head_bytes {
            return Err(RequestReadError::TooLarge {
                limit: max_head_bytes,
            });
        }

        line.extend_from_slice(&available[..consume]);
        reader.consume(consume);
        *total += consume;

        if newline_pos.is_some() {
            break;
        }
    }
    Ok(Some(trim_line_ending(&line).to_vec()))
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
