use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::CacheReadError;
use crate::util::unix_millis;

/// Written on the metadata line of every disk entry. Files carrying any other value
/// were produced by a different freshness scheme and are never served.
pub(super) const ENTRY_FORMAT: &str = "stashproxy/1";

/// A cached origin response together with its freshness metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub max_age: Duration,
    pub stored_at: SystemTime,
    /// Status line, headers and body exactly as the origin sent them.
    pub response: Bytes,
}

impl CacheEntry {
    pub fn new(response: Bytes, max_age: Duration) -> Self {
        Self::stored_at(response, max_age, SystemTime::now())
    }

    pub fn stored_at(response: Bytes, max_age: Duration, stored_at: SystemTime) -> Self {
        Self {
            max_age,
            stored_at,
            response,
        }
    }

    /// Fresh while no more than `max_age` has elapsed since the entry was stored.
    /// An entry stamped in the future (clock moved backwards) counts as zero elapsed.
    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        let age = now.duration_since(self.stored_at).unwrap_or_default();
        age <= self.max_age
    }

    pub(super) fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let meta = EntryMeta {
            format: ENTRY_FORMAT.to_string(),
            max_age: self.max_age.as_secs(),
            stored_at_ms: unix_millis(self.stored_at),
        };
        let mut encoded = serde_json::to_vec(&meta)?;
        encoded.push(b'\n');
        encoded.extend_from_slice(&self.response);
        Ok(encoded)
    }

    pub(super) fn decode(mut data: Bytes) -> Result<Self, CacheReadError> {
        let newline = data
            .iter()
            .position(|byte| *byte == b'\n')
            .ok_or(CacheReadError::MissingMetadata)?;
        let meta_line = data.split_to(newline + 1);
        let meta: EntryMeta = serde_json::from_slice(&meta_line[..newline])
            .map_err(CacheReadError::InvalidMetadata)?;
        if meta.format != ENTRY_FORMAT {
            return Err(CacheReadError::ForeignFormat(meta.format));
        }
        Ok(Self {
            max_age: Duration::from_secs(meta.max_age),
            stored_at: UNIX_EPOCH + Duration::from_millis(meta.stored_at_ms),
            response: data,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    format: String,
    max_age: u64,
    stored_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(1_700_000_000);

    fn entry_with_max_age(secs: u64) -> CacheEntry {
        CacheEntry::stored_at(
            Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\nhello"),
            Duration::from_secs(secs),
            UNIX_EPOCH + T,
        )
    }

    #[test]
    fn freshness_boundary_at_max_age() {
        let entry = entry_with_max_age(60);
        let stored = UNIX_EPOCH + T;
        assert!(entry.is_fresh_at(stored + Duration::from_secs(59)));
        assert!(entry.is_fresh_at(stored + Duration::from_secs(60)));
        assert!(!entry.is_fresh_at(stored + Duration::from_millis(60_001)));
        assert!(!entry.is_fresh_at(stored + Duration::from_secs(61)));
    }

    #[test]
    fn zero_max_age_is_fresh_only_at_the_stored_instant() {
        let entry = entry_with_max_age(0);
        let stored = UNIX_EPOCH + T;
        assert!(entry.is_fresh_at(stored));
        assert!(!entry.is_fresh_at(stored + Duration::from_millis(1)));
    }

    #[test]
    fn future_timestamp_counts_as_fresh() {
        let entry = entry_with_max_age(10);
        assert!(entry.is_fresh_at(UNIX_EPOCH + T - Duration::from_secs(5)));
    }

    #[test]
    fn decode_restores_metadata_and_verbatim_response() {
        let entry = entry_with_max_age(120);
        let decoded = CacheEntry::decode(Bytes::from(entry.encode().unwrap())).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn response_bytes_may_contain_newlines_and_json() {
        let response = Bytes::from_static(b"HTTP/1.1 200 OK\r\nX: {\"a\":1}\n\r\n\r\n{\n}");
        let entry = CacheEntry::stored_at(response.clone(), Duration::from_secs(5), UNIX_EPOCH + T);
        let decoded = CacheEntry::decode(Bytes::from(entry.encode().unwrap())).unwrap();
        assert_eq!(decoded.response, response);
    }

    #[test]
    fn raw_response_without_metadata_is_rejected() {
        let err = CacheEntry::decode(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\nbody"))
            .expect_err("plain responses carry no metadata line");
        assert!(matches!(err, CacheReadError::InvalidMetadata(_)));

        let err = CacheEntry::decode(Bytes::from_static(b"no newline at all"))
            .expect_err("truncated metadata");
        assert!(matches!(err, CacheReadError::MissingMetadata));
    }

    #[test]
    fn foreign_format_is_rejected() {
        let data = b"{\"format\":\"mtime/1\",\"max_age\":60,\"stored_at_ms\":0}\nHTTP/1.1 200 OK\r\n\r\n";
        let err = CacheEntry::decode(Bytes::from_static(data)).expect_err("foreign scheme");
        assert!(matches!(err, CacheReadError::ForeignFormat(format) if format == "mtime/1"));
    }
}
