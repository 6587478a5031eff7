use axum::http::HeaderMap;
use std::fmt;
use url::Url;

/// An addressable backend the proxy may forward to. Identity is the `id`
/// field alone: two endpoints with the same id compare equal no matter
/// what else differs, which is what the cursor table and weight handler
/// rely on across registry updates.
#[derive(Debug, Clone)]
pub struct Endpoint {
    id: String,
    url: Url,
    headers: HeaderMap,
    active: bool,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            url,
            headers: HeaderMap::new(),
            active: true,
        }
    }

    /// Endpoint whose id is its own url, the form instruction upstreams
    /// take since their selector state must survive proxy restarts.
    pub fn from_url(url: Url) -> Self {
        let id = url.to_string();
        Self::new(id, url)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Header overrides merged into the outbound request after everything
    /// else, so they win.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Endpoint {}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint({}, {})", self.id, self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn equality_is_by_id_only() {
        let a = Endpoint::new("u1", url("http://one.example:5000"));
        let b = Endpoint::new("u1", url("http://two.example:6000"));
        let c = Endpoint::new("u2", url("http://one.example:5000"));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn from_url_uses_url_as_id() {
        let e = Endpoint::from_url(url("http://backend.example:8080/api"));
        assert_eq!(e.id(), "http://backend.example:8080/api");
        assert!(e.is_active());
    }

    #[test]
    fn activity_flag_toggles() {
        let mut e = Endpoint::new("u1", url("http://one.example"));
        assert!(e.is_active());
        e.set_active(false);
        assert!(!e.is_active());
    }
}
