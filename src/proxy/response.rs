use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// A raw origin response split into status line, header map and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginResponse {
    pub status_line: String,
    /// Lowercased names; the last occurrence of a repeated header wins.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    PassThrough,
    Redirect { location: Option<String> },
    Cacheable { max_age: Option<Duration> },
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::PassThrough => "pass_through",
            Disposition::Redirect { .. } => "redirect",
            Disposition::Cacheable { .. } => "cacheable",
        }
    }

    /// Freshness lifetime to store the response under, if it should be stored at all.
    pub fn store_max_age(&self) -> Option<Duration> {
        match self {
            Disposition::Cacheable { max_age } => *max_age,
            _ => None,
        }
    }
}

impl OriginResponse {
    pub fn parse(raw: &Bytes) -> Self {
        let (head, body) = match raw
            .windows(HEAD_TERMINATOR.len())
            .position(|window| window == HEAD_TERMINATOR)
        {
            Some(idx) => (&raw[..idx], raw.slice(idx + HEAD_TERMINATOR.len()..)),
            None => (&raw[..], Bytes::new()),
        };
        let head = String::from_utf8_lossy(head);
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default().to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        Self {
            status_line,
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// The numeric code from the second token of the status line.
    pub fn status(&self) -> Option<StatusCode> {
        let code = self.status_line.split_whitespace().nth(1)?;
        if code.len() != 3 {
            return None;
        }
        StatusCode::from_bytes(code.as_bytes()).ok()
    }

    pub fn classify(&self) -> Disposition {
        let Some(status) = self.status() else {
            return Disposition::PassThrough;
        };
        if status.is_client_error() || status.is_server_error() {
            return Disposition::PassThrough;
        }
        if status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND {
            return Disposition::Redirect {
                location: self.header("location").map(str::to_string),
            };
        }
        Disposition::Cacheable {
            max_age: self.header("cache-control").and_then(cache_max_age),
        }
    }
}

/// `max-age` from a `Cache-Control` value, or `None` when absent or when the
/// response also forbids storage.
fn cache_max_age(value: &str) -> Option<Duration> {
    let mut max_age = None;
    let mut no_store = false;
    for part in value.split(',') {
        let part = part.trim();
        if part.eq_ignore_ascii_case("no-store") {
            no_store = true;
            continue;
        }
        let Some((name, arg)) = part.split_once('=') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("max-age") {
            let arg = arg.trim().trim_matches('"').trim();
            if let Ok(secs) = arg.parse::<u64>() {
                max_age = Some(Duration::from_secs(secs));
            }
        }
    }
    if no_store { None } else { max_age }
}
