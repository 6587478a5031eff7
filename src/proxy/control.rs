use axum::http::header::{AUTHORIZATION, HOST};
#[cfg(test)]
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ProxyError, ProxyResult};
use crate::proxy::instructions::Instructions;
use crate::proxy::request::ProxyRequest;

/// Asks the control servers what to do with a request. Servers are tried
/// in the order the balancer produced: first parseable 2xx wins, 5xx and
/// transport errors move on to the next server, and a 4xx is the control
/// plane's final word so it propagates verbatim.
pub struct ControlClient {
    client: reqwest::Client,
    servers: Vec<Url>,
}

impl ControlClient {
    pub fn new(
        servers: Vec<Url>,
        dial_timeout: Duration,
        read_timeout: Duration,
    ) -> ProxyResult<Self> {
        if servers.is_empty() {
            return Err(ProxyError::Config(
                "supply at least one control server".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .timeout(read_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to build control client: {}", e)))?;
        Ok(Self { client, servers })
    }

    pub fn servers(&self) -> &[Url] {
        &self.servers
    }

    pub async fn fetch_instructions(
        &self,
        ordered: &[Url],
        req: &ProxyRequest,
    ) -> ProxyResult<Instructions> {
        let mut last_error = String::from("no control servers configured");

        for server in ordered {
            let mut request = self
                .client
                .get(server.clone())
                .query(&[
                    ("method", req.method.as_str()),
                    ("url", &req.uri.to_string()),
                    ("length", &req.body.len().unwrap_or(0).to_string()),
                ]);
            for name in [AUTHORIZATION, HOST] {
                if let Some(value) = req.headers.get(&name) {
                    request = request.header(name.clone(), value.clone());
                }
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!("control server {} unreachable: {}", server, e);
                    last_error = format!("{}: {}", server, e);
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                match response.json::<Instructions>().await {
                    Ok(instructions) => {
                        debug!("control server {} accepted the request", server);
                        return Ok(instructions);
                    }
                    Err(e) => {
                        warn!("control server {} returned unparseable verdict: {}", server, e);
                        last_error = format!("{}: {}", server, e);
                        continue;
                    }
                }
            }

            if status.is_client_error() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProxyError::ControlPlane { status, body });
            }

            warn!("control server {} returned {}, trying next", server, status);
            last_error = format!("{} returned {}", server, status);
        }

        Err(ProxyError::ControlUnavailable(last_error))
    }
}
