//! Engine configuration types
//!
//! This module defines the deployment-level settings of the query engine: the
//! data-volume budget, the multi-frame transport protocol, cache behaviour and
//! per-device log file passwords. Per-request parameters live on
//! [`SignalQuery`](crate::types::SignalQuery).

use crate::types::QueryError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How the walker reacts once the data-volume budget is exceeded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPolicy {
    /// Skip the overflowing file and every file after it
    #[default]
    StopAtFirstOverflow,
    /// Skip the overflowing file but keep checking later files against the remaining budget
    BestEffort,
}

/// Multi-frame transport protocol applied before signal decoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    None,
    /// ISO-TP (ISO 15765-2) as used by UDS and OBD-II
    Uds,
    /// J1939-21 transport protocol (BAM and RTS/CTS)
    J1939,
    /// NMEA 2000 fast packet
    Nmea,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::None => write!(f, "none"),
            TransportProtocol::Uds => write!(f, "uds"),
            TransportProtocol::J1939 => write!(f, "j1939"),
            TransportProtocol::Nmea => write!(f, "nmea"),
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(TransportProtocol::None),
            "uds" => Ok(TransportProtocol::Uds),
            "j1939" => Ok(TransportProtocol::J1939),
            "nmea" => Ok(TransportProtocol::Nmea),
            _ => Err(QueryError::UnknownVariant {
                field: "tp_type",
                value: s.to_string(),
            }),
        }
    }
}

/// Configuration for the query engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Data-volume budget per request, in megabytes
    pub limit_mb: u64,

    /// Budget exhaustion policy
    pub budget_policy: BudgetPolicy,

    /// Transport protocol used to reassemble multi-frame messages
    #[serde(alias = "tp_type")]
    pub transport: TransportProtocol,

    /// Time-to-live of cached file loads and request results, in seconds
    pub cache_ttl_secs: u64,

    /// Maximum number of entries per cache (0 disables caching)
    pub cache_capacity: usize,

    /// Log file passwords by device ID
    pub passwords: BTreeMap<String, String>,

    /// Report value-table descriptions as text instead of raw numbers
    pub value_descriptions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limit_mb: 100,
            budget_policy: BudgetPolicy::default(),
            transport: TransportProtocol::default(),
            cache_ttl_secs: 50,
            cache_capacity: 25,
            passwords: BTreeMap::new(),
            value_descriptions: false,
        }
    }
}

impl EngineConfig {
    /// Create a new engine configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the data-volume budget
    pub fn with_limit_mb(mut self, limit_mb: u64) -> Self {
        self.limit_mb = limit_mb;
        self
    }

    /// Builder method: set the budget exhaustion policy
    pub fn with_budget_policy(mut self, policy: BudgetPolicy) -> Self {
        self.budget_policy = policy;
        self
    }

    /// Builder method: set the transport protocol
    pub fn with_transport(mut self, transport: TransportProtocol) -> Self {
        self.transport = transport;
        self
    }

    /// Builder method: set the cache time-to-live
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = ttl.as_secs();
        self
    }

    /// Builder method: set the cache capacity
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Builder method: add a log file password for a device
    pub fn with_password(mut self, device: impl Into<String>, password: impl Into<String>) -> Self {
        self.passwords.insert(device.into(), password.into());
        self
    }

    /// Builder method: report value-table descriptions as text
    pub fn with_value_descriptions(mut self, enabled: bool) -> Self {
        self.value_descriptions = enabled;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Password for a device's log files, if configured
    pub fn password_for(&self, device: &str) -> Option<&str> {
        self.passwords.get(device).map(String::as_str)
    }
}
