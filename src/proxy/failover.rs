use axum::http::Method;

use crate::proxy::request::ProxyRequest;

/// Decides, from the request's attempt history, whether the forwarder may
/// try another endpoint. Composable so deployments can tighten or loosen
/// the policy per location.
#[derive(Debug, Clone)]
pub enum FailoverPredicate {
    /// Allow at most this many attempts in total.
    MaxAttempts(usize),
    /// Only after a transport error or a 5xx.
    OnErrors,
    /// Only for GET requests.
    OnGets,
    And(Vec<FailoverPredicate>),
    Or(Vec<FailoverPredicate>),
}

impl FailoverPredicate {
    /// Failover on errors, twice at most, GET requests only.
    pub fn default_policy() -> Self {
        FailoverPredicate::And(vec![
            FailoverPredicate::MaxAttempts(2),
            FailoverPredicate::OnErrors,
            FailoverPredicate::OnGets,
        ])
    }

    pub fn allows(&self, req: &ProxyRequest) -> bool {
        match self {
            FailoverPredicate::MaxAttempts(n) => req.attempts().len() < *n,
            FailoverPredicate::OnErrors => req
                .last_attempt()
                .map(|attempt| attempt.failed())
                .unwrap_or(false),
            FailoverPredicate::OnGets => req.method == Method::GET,
            FailoverPredicate::And(preds) => preds.iter().all(|p| p.allows(req)),
            FailoverPredicate::Or(preds) => preds.iter().any(|p| p.allows(req)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::body::ReplayableBody;
    use crate::proxy::endpoint::Endpoint;
    use crate::proxy::request::{Attempt, AttemptOutcome};
    use axum::http::StatusCode;
    use std::time::Duration;
    use url::Url;

    fn request(method: Method) -> ProxyRequest {
        ProxyRequest::new(
            method,
            "/".parse().unwrap(),
            Default::default(),
            ReplayableBody::from_bytes(""),
            "127.0.0.1:4000".parse().unwrap(),
        )
    }

    fn failed_attempt() -> Attempt {
        Attempt {
            endpoint: Endpoint::new("u1", Url::parse("http://backend.example").unwrap()),
            outcome: AttemptOutcome::Error("connection refused".into()),
            duration: Duration::ZERO,
        }
    }

    fn ok_attempt() -> Attempt {
        Attempt {
            endpoint: Endpoint::new("u1", Url::parse("http://backend.example").unwrap()),
            outcome: AttemptOutcome::Response(StatusCode::OK),
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn default_policy_allows_one_retry_of_a_failed_get() {
        let policy = FailoverPredicate::default_policy();
        let mut req = request(Method::GET);

        req.add_attempt(failed_attempt());
        assert!(policy.allows(&req));
    }

    #[test]
    fn default_policy_never_exceeds_two_attempts() {
        let policy = FailoverPredicate::default_policy();
        let mut req = request(Method::GET);

        req.add_attempt(failed_attempt());
        req.add_attempt(failed_attempt());
        assert!(!policy.allows(&req));
    }

    #[test]
    fn default_policy_never_retries_non_gets() {
        let policy = FailoverPredicate::default_policy();
        let mut req = request(Method::POST);

        req.add_attempt(failed_attempt());
        assert!(!policy.allows(&req));
    }

    #[test]
    fn default_policy_does_not_retry_successes() {
        let policy = FailoverPredicate::default_policy();
        let mut req = request(Method::GET);

        req.add_attempt(ok_attempt());
        assert!(!policy.allows(&req));
    }

    #[test]
    fn five_hundreds_count_as_errors() {
        let policy = FailoverPredicate::OnErrors;
        let mut req = request(Method::GET);
        req.add_attempt(Attempt {
            endpoint: Endpoint::new("u1", Url::parse("http://backend.example").unwrap()),
            outcome: AttemptOutcome::Response(StatusCode::BAD_GATEWAY),
            duration: Duration::ZERO,
        });
        assert!(policy.allows(&req));
    }

    #[test]
    fn or_combinator_short_circuits() {
        let policy = FailoverPredicate::Or(vec![
            FailoverPredicate::OnGets,
            FailoverPredicate::MaxAttempts(5),
        ]);
        let req = request(Method::POST);
        assert!(policy.allows(&req));
    }

    #[test]
    fn and_combinator_requires_all() {
        let policy = FailoverPredicate::And(vec![
            FailoverPredicate::OnGets,
            FailoverPredicate::MaxAttempts(1),
        ]);
        let mut req = request(Method::GET);
        assert!(policy.allows(&req));
        req.add_attempt(failed_attempt());
        assert!(!policy.allows(&req));
    }
}
