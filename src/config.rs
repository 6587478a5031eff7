use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::{
    DEFAULT_HTTP_DIAL_TIMEOUT_SECS, DEFAULT_HTTP_READ_TIMEOUT_SECS, DEFAULT_LISTEN_PORT,
    DEFAULT_MAX_BODY_BYTES,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
}

/// One requests-per-period budget applied to every (token, upstream) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSetting {
    pub limit: u64,
    pub period_secs: u64,
}

/// Runtime settings for the proxy service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Control servers consulted for per-request routing verdicts,
    /// tried in balancer order.
    #[serde(default)]
    pub control_servers: Vec<String>,

    /// Name reported in X-Forwarded-Server.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Append to an existing X-Forwarded-For chain instead of replacing it.
    #[serde(default)]
    pub trust_forward_header: bool,

    /// How long to wait for upstream response data. Zero means default.
    #[serde(default = "default_read_timeout")]
    pub http_read_timeout_secs: u64,

    /// How long to wait for the upstream connection. Zero means default.
    #[serde(default = "default_dial_timeout")]
    pub http_dial_timeout_secs: u64,

    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,

    #[serde(default)]
    pub balancer: BalancerKind,

    /// Throttling budgets. Empty disables throttling entirely.
    #[serde(default)]
    pub rates: Vec<RateSetting>,
}

fn default_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "tiller".to_string())
}

fn default_read_timeout() -> u64 {
    DEFAULT_HTTP_READ_TIMEOUT_SECS
}

fn default_dial_timeout() -> u64 {
    DEFAULT_HTTP_DIAL_TIMEOUT_SECS
}

fn default_max_body() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            control_servers: Vec::new(),
            hostname: default_hostname(),
            trust_forward_header: false,
            http_read_timeout_secs: default_read_timeout(),
            http_dial_timeout_secs: default_dial_timeout(),
            max_body_bytes: default_max_body(),
            balancer: BalancerKind::default(),
            rates: Vec::new(),
        }
    }
}

impl ProxySettings {
    /// Loads settings from the JSON file named by TILLER_CONFIG, falling
    /// back to defaults when the variable is unset.
    pub fn load() -> Result<Self, String> {
        match std::env::var("TILLER_CONFIG") {
            Ok(path) if !path.trim().is_empty() => {
                let raw = std::fs::read_to_string(path.trim())
                    .map_err(|e| format!("failed to read config file: {}", e))?;
                serde_json::from_str(&raw)
                    .map_err(|e| format!("failed to parse config file: {}", e))
            }
            _ => Ok(Self::default()),
        }
    }

    /// Both timeouts fall back to the 10 second default whenever the
    /// configured value is zero.
    pub fn normalize(&mut self) {
        if self.http_read_timeout_secs == 0 {
            self.http_read_timeout_secs = DEFAULT_HTTP_READ_TIMEOUT_SECS;
        }
        if self.http_dial_timeout_secs == 0 {
            self.http_dial_timeout_secs = DEFAULT_HTTP_DIAL_TIMEOUT_SECS;
        }
        if self.max_body_bytes == 0 {
            self.max_body_bytes = DEFAULT_MAX_BODY_BYTES;
        }
    }
}

pub fn apply_env_overrides(settings: &mut ProxySettings) {
    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    settings.port = p;
                    info!("Using proxy port from environment: {}", p);
                }
                _ => warn!("ignoring invalid PORT value: {}", port),
            }
        }
    }

    if let Ok(servers) = std::env::var("TILLER_CONTROL_SERVERS") {
        let parsed: Vec<String> = servers
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !parsed.is_empty() {
            info!("Using {} control server(s) from environment", parsed.len());
            settings.control_servers = parsed;
        }
    }

    if let Ok(hostname) = std::env::var("TILLER_HOSTNAME") {
        if !hostname.trim().is_empty() {
            settings.hostname = hostname.trim().to_string();
        }
    }
}

/// Startup validation. Collects every problem instead of bailing at the
/// first one so an operator can fix a config file in a single pass.
pub fn validate_settings(settings: &ProxySettings) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if settings.control_servers.is_empty() {
        errors.push("supply at least one control server".to_string());
    }
    for server in &settings.control_servers {
        if url::Url::parse(server).is_err() {
            errors.push(format!("invalid control server url: {}", server));
        }
    }
    if settings.port == 0 {
        errors.push("listen port can not be zero".to_string());
    }
    for rate in &settings.rates {
        if rate.limit == 0 {
            errors.push("throttle rate limit can not be zero".to_string());
        }
        if rate.period_secs == 0 {
            errors.push("throttle rate period can not be zero".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeouts_fall_back_to_defaults() {
        let mut settings = ProxySettings {
            http_read_timeout_secs: 0,
            http_dial_timeout_secs: 0,
            ..ProxySettings::default()
        };
        settings.normalize();
        assert_eq!(settings.http_read_timeout_secs, 10);
        assert_eq!(settings.http_dial_timeout_secs, 10);
    }

    #[test]
    fn nonzero_timeouts_survive_normalize() {
        let mut settings = ProxySettings {
            http_read_timeout_secs: 3,
            http_dial_timeout_secs: 7,
            ..ProxySettings::default()
        };
        settings.normalize();
        assert_eq!(settings.http_read_timeout_secs, 3);
        assert_eq!(settings.http_dial_timeout_secs, 7);
    }

    #[test]
    fn validation_requires_control_servers() {
        let settings = ProxySettings::default();
        let errors = validate_settings(&settings).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("control server")));
    }

    #[test]
    fn validation_rejects_bad_urls_and_rates() {
        let settings = ProxySettings {
            control_servers: vec!["not a url".to_string()],
            rates: vec![RateSetting {
                limit: 0,
                period_secs: 0,
            }],
            ..ProxySettings::default()
        };
        let errors = validate_settings(&settings).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn validation_accepts_complete_settings() {
        let settings = ProxySettings {
            control_servers: vec!["http://127.0.0.1:9000".to_string()],
            rates: vec![RateSetting {
                limit: 100,
                period_secs: 60,
            }],
            ..ProxySettings::default()
        };
        assert!(validate_settings(&settings).is_ok());
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: ProxySettings =
            serde_json::from_str(r#"{"control_servers":["http://localhost:9000"]}"#).unwrap();
        assert_eq!(settings.port, DEFAULT_LISTEN_PORT);
        assert_eq!(settings.balancer, BalancerKind::RoundRobin);
        assert!(settings.rates.is_empty());
    }
}
