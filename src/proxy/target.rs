/// The origin host and path a proxied request resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTarget {
    pub host: String,
    /// Always begins with `/`.
    pub path: String,
}

const SCHEME_PREFIXES: [&str; 2] = ["http://", "https://"];
const TRAVERSAL_SEGMENT: &str = "/..";

impl NormalizedTarget {
    /// Splits a raw request-target into host and path.
    ///
    /// A single leading `http://` or `https://` (optionally preceded by one `/`) is
    /// stripped, every `/..` is removed, and the remainder is split at the first `/`.
    /// The host is not validated; unusable hosts fail later when the origin is
    /// resolved.
    pub fn from_uri(uri: &str) -> Self {
        let without_scheme = strip_scheme(uri);
        let cleaned = without_scheme.replace(TRAVERSAL_SEGMENT, "");
        match cleaned.split_once('/') {
            Some((host, rest)) => Self {
                host: host.to_string(),
                path: format!("/{rest}"),
            },
            None => Self {
                host: cleaned,
                path: "/".to_string(),
            },
        }
    }
}

fn strip_scheme(uri: &str) -> &str {
    let candidate = uri.strip_prefix('/').unwrap_or(uri);
    for prefix in SCHEME_PREFIXES {
        if let Some(rest) = candidate.strip_prefix(prefix) {
            return rest;
        }
    }
    uri
}
