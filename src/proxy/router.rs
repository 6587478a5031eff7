use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::{ProxyError, ProxyResult};

/// Maps request paths to locations, longest registered prefix wins.
/// Reads are concurrent; add/remove take the writer lock.
pub struct PathMatcher<L> {
    entries: RwLock<Vec<(String, Arc<L>)>>,
}

impl<L> Default for PathMatcher<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> PathMatcher<L> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn add_location(&self, pattern: &str, location: Arc<L>) -> ProxyResult<()> {
        if pattern.is_empty() || !pattern.starts_with('/') {
            return Err(ProxyError::Config(format!(
                "invalid location pattern: {:?}",
                pattern
            )));
        }
        let mut entries = self.entries.write();
        if entries.iter().any(|(p, _)| p == pattern) {
            return Err(ProxyError::Config(format!(
                "location pattern already registered: {}",
                pattern
            )));
        }
        entries.push((pattern.to_string(), location));
        Ok(())
    }

    pub fn remove_location(&self, pattern: &str) -> ProxyResult<()> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(p, _)| p != pattern);
        if entries.len() == before {
            return Err(ProxyError::Config(format!(
                "location pattern not registered: {}",
                pattern
            )));
        }
        Ok(())
    }

    /// Returns the location owning the longest pattern that matches `path`,
    /// or None when nothing matches.
    pub fn route(&self, path: &str) -> Option<Arc<L>> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, path))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, location)| location.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Prefix match on segment boundaries. A pattern without a trailing slash
/// matches the bare path, the path with a slash appended, and anything
/// below it; a pattern with a trailing slash requires the path to continue
/// past the slash, so "/a/b/" matches "/a/b/" but not "/a/b".
fn pattern_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('/') {
        match path.strip_prefix(prefix) {
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    } else {
        match path.strip_prefix(pattern) {
            Some("") => true,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Loc(&'static str);

    fn matcher() -> PathMatcher<Loc> {
        PathMatcher::new()
    }

    #[test]
    fn route_on_empty_matcher_returns_none() {
        let m = matcher();
        assert!(m.route("/").is_none());
    }

    #[test]
    fn remove_nonexistent_fails() {
        let m = matcher();
        assert!(m.remove_location("/missing").is_err());
    }

    #[test]
    fn add_twice_fails() {
        let m = matcher();
        m.add_location("/a", Arc::new(Loc("a"))).unwrap();
        assert!(m.add_location("/a", Arc::new(Loc("a"))).is_err());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let m = matcher();
        assert!(m.add_location("", Arc::new(Loc("a"))).is_err());
        assert!(m.add_location("no-slash", Arc::new(Loc("a"))).is_err());
        assert!(m.is_empty());
    }

    #[test]
    fn root_matches_everything() {
        let m = matcher();
        m.add_location("/", Arc::new(Loc("root"))).unwrap();
        assert_eq!(m.route("/").unwrap().0, "root");
        assert_eq!(m.route("/health").unwrap().0, "root");
        assert_eq!(m.route("/deep/nested/path").unwrap().0, "root");
    }

    #[test]
    fn bare_pattern_matches_with_and_without_trailing_slash() {
        let m = matcher();
        m.add_location("/a/b", Arc::new(Loc("ab"))).unwrap();

        assert!(m.route("/a/b").is_some());
        assert!(m.route("/a/b/").is_some());
        assert!(m.route("/a/b/x").is_some());
        assert!(m.route("/a/bx").is_none());
        assert!(m.route("/a").is_none());
    }

    #[test]
    fn trailing_slash_pattern_requires_the_slash() {
        let m = matcher();
        m.add_location("/a/b/", Arc::new(Loc("ab"))).unwrap();

        assert!(m.route("/a/b").is_none());
        assert!(m.route("/a/b/").is_some());
        assert!(m.route("/a/b/x").is_some());
    }

    #[test]
    fn multiple_disjoint_locations() {
        let m = matcher();
        m.add_location("/a/there", Arc::new(Loc("a"))).unwrap();
        m.add_location("/c", Arc::new(Loc("c"))).unwrap();

        assert_eq!(m.route("/a/there").unwrap().0, "a");
        assert_eq!(m.route("/c").unwrap().0, "c");
        assert!(m.route("/b").is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let m = matcher();
        m.add_location("/a", Arc::new(Loc("short"))).unwrap();
        m.add_location("/a/b", Arc::new(Loc("long"))).unwrap();

        assert_eq!(m.route("/a/b/x").unwrap().0, "long");
        assert_eq!(m.route("/a/b").unwrap().0, "long");
        assert_eq!(m.route("/a/x").unwrap().0, "short");
        assert_eq!(m.route("/a").unwrap().0, "short");
    }

    #[test]
    fn routing_survives_removal() {
        let m = matcher();
        m.add_location("/a", Arc::new(Loc("a"))).unwrap();
        m.add_location("/b", Arc::new(Loc("b"))).unwrap();

        m.remove_location("/b").unwrap();

        assert_eq!(m.route("/a").unwrap().0, "a");
        assert!(m.route("/b").is_none());
    }
}
