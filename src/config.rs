use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = crate::heartbeat::HEARTBEAT_INTERVAL.as_secs();

/// Connection settings supplied by the host. Replaced as a whole on reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub use_https: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: String::new(),
            port: None,
            use_https: false,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

impl GatewayConfig {
    pub fn new(host: &str, username: &str, password: &str) -> Self {
        Self {
            host: host.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
            ..Default::default()
        }
    }

    /// Check required fields. All problems are reported at once.
    pub fn validate(&self) -> std::result::Result<(), GatewayError> {
        let mut problems = Vec::new();
        for (name, value) in [
            ("host", &self.host),
            ("username", &self.username),
            ("password", &self.password),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("{} is required", name));
            }
        }
        let host = self.host.trim();
        if host.contains(char::is_whitespace) || host.contains('/') {
            problems.push(format!("host '{}' is not a hostname or address", self.host));
        } else if host.contains(':') && self.ipv6_host().is_none() {
            problems.push(format!(
                "host '{}' must not include a port; use the port setting",
                self.host
            ));
        } else if !host.is_empty() {
            if let Err(e) = reqwest::Url::parse(&self.base_url()) {
                problems.push(format!("host '{}' gives no valid url: {}", self.host, e));
            }
        }
        if self.port == Some(0) {
            problems.push("port must not be 0".to_owned());
        }
        if self.request_timeout_secs == 0 {
            problems.push("request_timeout_secs must be > 0".to_owned());
        }
        if self.heartbeat_interval_secs == 0 {
            problems.push("heartbeat_interval_secs must be > 0".to_owned());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Config(problems.join(", ")))
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.use_https {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        })
    }

    /// IPv6 literal given as host, with or without brackets.
    fn ipv6_host(&self) -> Option<std::net::Ipv6Addr> {
        let host = self.host.trim();
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        bare.parse().ok()
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        match self.ipv6_host() {
            Some(ip) => format!("{}://[{}]:{}", scheme, ip, self.port()),
            None => format!("{}://{}:{}", scheme, self.host.trim(), self.port()),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).context("parsing gateway config")
    }
}

/// Kind of input the host renders for a config field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConfigFieldKind {
    TextInput { regex: Option<String> },
    SecretText,
    Number { min: u64, max: u64, default: u64 },
    Checkbox { default: bool },
    StaticText { value: String },
}

/// One field of the host's config form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigField {
    pub id: &'static str,
    pub label: &'static str,
    pub width: u8,
    pub required: bool,
    #[serde(flatten)]
    pub kind: ConfigFieldKind,
}

/// Config form schema handed to the host.
pub fn config_fields() -> Vec<ConfigField> {
    vec![
        ConfigField {
            id: "info",
            label: "Information",
            width: 12,
            required: false,
            kind: ConfigFieldKind::StaticText {
                value: "Controls a Tieline gateway over its HTTP API using digest authentication."
                    .to_owned(),
            },
        },
        ConfigField {
            id: "host",
            label: "Gateway IP / hostname",
            width: 8,
            required: true,
            kind: ConfigFieldKind::TextInput {
                regex: Some(r"^[A-Za-z0-9.\-:\[\]]+$".to_owned()),
            },
        },
        ConfigField {
            id: "port",
            label: "Port",
            width: 4,
            required: false,
            kind: ConfigFieldKind::Number {
                min: 1,
                max: 65535,
                default: DEFAULT_HTTP_PORT as u64,
            },
        },
        ConfigField {
            id: "username",
            label: "Username",
            width: 6,
            required: true,
            kind: ConfigFieldKind::TextInput { regex: None },
        },
        ConfigField {
            id: "password",
            label: "Password",
            width: 6,
            required: true,
            kind: ConfigFieldKind::SecretText,
        },
        ConfigField {
            id: "use_https",
            label: "Use HTTPS",
            width: 4,
            required: false,
            kind: ConfigFieldKind::Checkbox { default: false },
        },
        ConfigField {
            id: "request_timeout_secs",
            label: "Request timeout (s)",
            width: 4,
            required: false,
            kind: ConfigFieldKind::Number {
                min: 1,
                max: 60,
                default: DEFAULT_REQUEST_TIMEOUT_SECS,
            },
        },
        ConfigField {
            id: "heartbeat_interval_secs",
            label: "Keepalive interval (s)",
            width: 4,
            required: false,
            kind: ConfigFieldKind::Number {
                min: 1,
                max: 55,
                default: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            },
        },
    ]
}

pub fn load_config(path: &str) -> Result<GatewayConfig> {
    let data = std::fs::read_to_string(path).context(format!("reading config from {}", path))?;
    GatewayConfig::from_json(&data)
}

pub fn save_config(path: &str, config: &GatewayConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data).context(format!("writing config to {}", path))
}
