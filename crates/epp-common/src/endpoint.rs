use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identity of a backend replica, always `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which inference phase a replica serves.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    Prefill,
    Decode,
    #[default]
    Unified,
}

impl EndpointRole {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointRole::Prefill => "prefill",
            EndpointRole::Decode => "decode",
            EndpointRole::Unified => "unified",
        }
    }
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown endpoint role '{0}', expected prefill, decode or unified")]
pub struct ParseRoleError(pub String);

impl FromStr for EndpointRole {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prefill" => Ok(EndpointRole::Prefill),
            "decode" => Ok(EndpointRole::Decode),
            "unified" | "both" => Ok(EndpointRole::Unified),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}

/// One replica declared in the endpoints file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointSpec {
    pub address: String,
    #[serde(default)]
    pub role: EndpointRole,
    /// Scrape target override, defaults to `http://{address}`.
    #[serde(default)]
    pub metrics_url: Option<String>,
}

impl EndpointSpec {
    pub fn id(&self) -> EndpointId {
        EndpointId::new(self.address.clone())
    }

    pub fn metrics_base_url(&self) -> String {
        self.metrics_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.address))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointsFileError {
    #[error("malformed endpoints file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("endpoint address '{0}' is not host:port")]
    BadAddress(String),
    #[error("endpoint '{0}' is listed more than once")]
    Duplicate(String),
}

/// Membership source read by the collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointsFile {
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
}

impl EndpointsFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, EndpointsFileError> {
        let file: EndpointsFile = serde_json::from_slice(bytes)?;
        let mut seen = std::collections::HashSet::new();
        for ep in &file.endpoints {
            if !is_host_port(&ep.address) {
                return Err(EndpointsFileError::BadAddress(ep.address.clone()));
            }
            if !seen.insert(ep.address.as_str()) {
                return Err(EndpointsFileError::Duplicate(ep.address.clone()));
            }
        }
        Ok(file)
    }
}

fn is_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
