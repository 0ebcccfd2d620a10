use std::fmt;

use crate::proxy::target::NormalizedTarget;

/// Appended to the host when the path is the root resource. `%` only ever appears in
/// escaped paths as `%25` or `%5F`, so no real path can produce this suffix.
pub const DEFAULT_RESOURCE_SUFFIX: &str = "%default";

const PATH_FILLER: char = '_';

/// Identifies one cached response; usable directly as a file name under the cache root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(host: &str, path: &str) -> Self {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let mut key = String::with_capacity(host.len() + path.len() + 1);
        push_escaped(&mut key, host);
        key.push(PATH_FILLER);
        if trimmed.is_empty() {
            key.push_str(DEFAULT_RESOURCE_SUFFIX);
        } else {
            push_escaped(&mut key, trimmed);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The first unescaped filler in a key always separates host from path, which keeps
/// distinct `(host, path)` pairs on distinct keys.
fn push_escaped(key: &mut String, raw: &str) {
    for ch in raw.chars() {
        match ch {
            '/' => key.push(PATH_FILLER),
            '%' => key.push_str("%25"),
            '_' => key.push_str("%5F"),
            other => key.push(other),
        }
    }
}

impl From<&NormalizedTarget> for CacheKey {
    fn from(target: &NormalizedTarget) -> Self {
        Self::new(&target.host, &target.path)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_and_empty_paths_share_the_default_key() {
        let root = CacheKey::new("example.com", "/");
        let empty = CacheKey::new("example.com", "");
        assert_eq!(root, empty);
        assert!(root.as_str().ends_with(DEFAULT_RESOURCE_SUFFIX));
        assert_eq!(root.as_str(), "example.com_%default");
    }

    #[test]
    fn path_separators_become_underscores() {
        let key = CacheKey::new("a.com", "/x/y");
        assert!(key.as_str().contains("a.com"));
        assert!(key.as_str().contains("_x_y"));
        assert_eq!(key.as_str(), "a.com_x_y");
    }

    #[test]
    fn page_key_matches_flat_layout() {
        assert_eq!(CacheKey::new("example.com", "/page").as_str(), "example.com_page");
    }

    #[test]
    fn literal_underscores_do_not_collide_with_separators() {
        let slashed = CacheKey::new("a.com", "/x/y");
        let underscored = CacheKey::new("a.com", "/x_y");
        assert_ne!(slashed, underscored);
        assert_eq!(underscored.as_str(), "a.com_x%5Fy");
    }

    #[test]
    fn underscores_in_hosts_are_escaped() {
        let host_underscore = CacheKey::new("a_b", "/c");
        let path_split = CacheKey::new("a", "/b/c");
        assert_ne!(host_underscore, path_split);
        assert_eq!(host_underscore.as_str(), "a%5Fb_c");
    }

    #[test]
    fn default_suffix_is_unreachable_from_a_path() {
        let root = CacheKey::new("a.com", "/");
        assert_ne!(root, CacheKey::new("a.com", "/%default"));
        assert_ne!(root, CacheKey::new("a.com", "/default"));
    }

    #[test]
    fn keys_never_contain_path_separators() {
        let key = CacheKey::new("a.com", "/deep/nested/resource.html?x=/y");
        assert!(!key.as_str().contains('/'));
    }

    #[test]
    fn derives_from_normalized_target() {
        let target = NormalizedTarget::from_uri("http://example.com/a/b");
        assert_eq!(CacheKey::from(&target).as_str(), "example.com_a_b");
    }
}
