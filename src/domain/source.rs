use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use super::error::ConfigError;

/// Peer key meaning "accept traffic from any peer IP".
pub const WILDCARD_IP: &str = "0.0.0.0";

pub const DEFAULT_MAX_EVENTS_PER_FILE: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[serde(alias = "UDP")]
    Udp,
    #[serde(alias = "TCP")]
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(ConfigError::InvalidValue {
                field: "protocol".to_string(),
                message: format!("unsupported protocol '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Contains,
    Equals,
    Regex,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Include,
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub field: String,
    pub operator: FilterOperator,
    pub value: String,
    pub action: FilterAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRule {
    pub group_by: Vec<String>,
    #[serde(with = "crate::app::config::serde_helpers")]
    pub time_window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HecFormat {
    #[default]
    Ndjson,
    Array,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_events_per_file")]
    pub max_events_per_file: usize,
}

fn default_max_events_per_file() -> usize {
    DEFAULT_MAX_EVENTS_PER_FILE
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_events_per_file: DEFAULT_MAX_EVENTS_PER_FILE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HecConfig {
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_token_scheme")]
    pub token_scheme: String,
    #[serde(default)]
    pub format: HecFormat,
    #[serde(default)]
    pub compress: bool,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

fn default_token_scheme() -> String {
    "Splunk".to_string()
}

fn default_verify_tls() -> bool {
    true
}

impl HecConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            token_scheme: default_token_scheme(),
            format: HecFormat::default(),
            compress: false,
            verify_tls: true,
        }
    }
}

/// Destination settings, serialized as `{"type": ..., "config": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum DestinationKind {
    Storage(StorageConfig),
    Hec(HecConfig),
}

impl DestinationKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            DestinationKind::Storage(_) => "storage",
            DestinationKind::Hec(_) => "hec",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DestinationKind::Storage(storage) => {
                if storage.path.as_os_str().is_empty() {
                    return Err(ConfigError::MissingField("storage path".to_string()));
                }
                if storage.max_events_per_file == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "max_events_per_file".to_string(),
                        message: "must be greater than zero".to_string(),
                    });
                }
            }
            DestinationKind::Hec(hec) => {
                if hec.url.trim().is_empty() {
                    return Err(ConfigError::MissingField("HEC url".to_string()));
                }
                let url = Url::parse(&hec.url).map_err(|e| ConfigError::InvalidValue {
                    field: "url".to_string(),
                    message: e.to_string(),
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(ConfigError::InvalidValue {
                        field: "url".to_string(),
                        message: format!("unsupported scheme '{}'", url.scheme()),
                    });
                }
                if hec.api_key.trim().is_empty() {
                    return Err(ConfigError::MissingField("HEC api_key".to_string()));
                }
                if hec.token_scheme.trim().is_empty() {
                    return Err(ConfigError::MissingField("HEC token_scheme".to_string()));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: DestinationKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl DestinationConfig {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_bind_ip")]
    pub ip: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub simulation_mode: bool,
    #[serde(default)]
    pub filter_rules: Vec<FilterRule>,
    #[serde(default)]
    pub aggregation_rules: Vec<AggregationRule>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

fn default_bind_ip() -> String {
    WILDCARD_IP.to_string()
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
            protocol,
            simulation_mode: false,
            filter_rules: Vec::new(),
            aggregation_rules: Vec::new(),
            destinations: Vec::new(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.peer_key().is_ok_and(|key| key == WILDCARD_IP)
    }

    /// Normalized peer key used for routing on a shared listener.
    /// Both `0.0.0.0` and `::` map to the wildcard key.
    pub fn peer_key(&self) -> Result<String, ConfigError> {
        let ip: IpAddr = self.ip.trim().parse().map_err(|_| ConfigError::InvalidValue {
            field: "ip".to_string(),
            message: format!("'{}' is not an IP address", self.ip),
        })?;
        if ip.is_unspecified() {
            return Ok(WILDCARD_IP.to_string());
        }
        Ok(ip.to_canonical().to_string())
    }

    pub fn enabled_destinations(&self) -> impl Iterator<Item = &DestinationConfig> {
        self.destinations.iter().filter(|d| d.enabled)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("source name".to_string()));
        }
        if self.ip.trim().is_empty() {
            return Err(ConfigError::MissingField("source ip".to_string()));
        }
        self.peer_key()?;
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port".to_string(),
                message: "port must be between 1 and 65535".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for destination in &self.destinations {
            if destination.id.trim().is_empty() {
                return Err(ConfigError::MissingField("destination id".to_string()));
            }
            if !seen.insert(destination.id.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "destinations".to_string(),
                    message: format!("duplicate destination id '{}'", destination.id),
                });
            }
            if destination.enabled {
                destination.kind.validate()?;
            }
        }

        for rule in &self.aggregation_rules {
            if rule.group_by.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "aggregation_rules.group_by".to_string(),
                    message: "at least one field is required".to_string(),
                });
            }
        }

        Ok(())
    }
}
