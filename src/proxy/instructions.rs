use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

use crate::error::{ProxyError, ProxyResult};
use crate::proxy::endpoint::Endpoint;

/// The control plane's verdict for one request. Rejection is signalled by
/// an HTTP error from the control server, never by an empty upstream list.
#[derive(Debug, Clone, Deserialize)]
pub struct Instructions {
    #[serde(default)]
    pub failover: bool,

    /// Identity strings for rate accounting. Every token must pass the
    /// throttler for the request to proceed.
    #[serde(default)]
    pub tokens: Vec<String>,

    pub upstreams: Vec<UpstreamSpec>,

    /// Extra headers merged into the proxied request.
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSpec {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
}

impl Instructions {
    /// Validates the document and resolves upstream specs into endpoints.
    pub fn endpoints(&self) -> ProxyResult<Vec<Endpoint>> {
        if self.upstreams.is_empty() {
            return Err(ProxyError::ControlUnavailable(
                "control server returned no upstreams".to_string(),
            ));
        }
        self.upstreams
            .iter()
            .map(|spec| {
                let url = Url::parse(&spec.url).map_err(|e| {
                    ProxyError::ControlUnavailable(format!(
                        "control server returned invalid upstream url {}: {}",
                        spec.url, e
                    ))
                })?;
                Ok(Endpoint::from_url(url).with_headers(header_map(&spec.headers)))
            })
            .collect()
    }

    pub fn header_map(&self) -> HeaderMap {
        header_map(&self.headers)
    }
}

fn header_map(raw: &HashMap<String, Vec<String>>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in raw {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            tracing::warn!("dropping invalid instruction header name: {}", name);
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => {
                    tracing::warn!("dropping invalid instruction header value for {}", name)
                }
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_full_document() {
        let raw = r#"{
            "failover": true,
            "tokens": ["acc-77", "203.0.113.9"],
            "upstreams": [
                {"url": "http://backend-a:5000"},
                {"url": "http://backend-b:5001", "headers": {"X-Region": ["eu"]}}
            ],
            "headers": {"X-Routed-By": ["control"]}
        }"#;

        let instructions: Instructions = serde_json::from_str(raw).unwrap();
        assert!(instructions.failover);
        assert_eq!(instructions.tokens.len(), 2);

        let endpoints = instructions.endpoints().unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(
            endpoints[1].headers().get("x-region").unwrap(),
            &HeaderValue::from_static("eu")
        );
        assert_eq!(
            instructions.header_map().get("x-routed-by").unwrap(),
            &HeaderValue::from_static("control")
        );
    }

    #[test]
    fn missing_optional_fields_default() {
        let raw = r#"{"upstreams": [{"url": "http://backend:5000"}]}"#;
        let instructions: Instructions = serde_json::from_str(raw).unwrap();
        assert!(!instructions.failover);
        assert!(instructions.tokens.is_empty());
        assert!(instructions.headers.is_empty());
    }

    #[test]
    fn empty_upstream_list_is_an_error() {
        let raw = r#"{"upstreams": []}"#;
        let instructions: Instructions = serde_json::from_str(raw).unwrap();
        assert!(instructions.endpoints().is_err());
    }

    #[test]
    fn invalid_upstream_url_is_an_error() {
        let raw = r#"{"upstreams": [{"url": "not a url"}]}"#;
        let instructions: Instructions = serde_json::from_str(raw).unwrap();
        assert!(instructions.endpoints().is_err());
    }

    #[test]
    fn endpoint_ids_are_stable_urls() {
        let raw = r#"{"upstreams": [{"url": "http://backend:5000/base"}]}"#;
        let instructions: Instructions = serde_json::from_str(raw).unwrap();
        let a = instructions.endpoints().unwrap();
        let b = instructions.endpoints().unwrap();
        assert_eq!(a[0].id(), b[0].id());
    }
}
