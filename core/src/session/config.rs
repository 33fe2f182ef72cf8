// Relay session configuration

use super::RelayError;
use crate::topology::HostCapabilities;
use std::time::Duration;

/// Name advertised when neither the profile nor the caller supplies one
pub const FALLBACK_ADVERTISED_NAME: &str = "MITM-Proxy";

/// GAP Device Name limit
const MAX_NAME_LEN: usize = 248;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bound on the upstream connect
    pub connect_timeout: Duration,
    /// Bound on every upstream discovery, read, write and subscription change
    pub operation_timeout: Duration,
    /// Subscribe upstream to every notifying characteristic at activation
    pub auto_subscribe: bool,
    /// Serve only mandatory attributes until the victim has paired
    pub require_pairing: bool,
    /// Overrides the profile's advertised name
    pub advertise_name: Option<String>,
    pub host_capabilities: HostCapabilities,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            auto_subscribe: true,
            require_pairing: true,
            advertise_name: None,
            host_capabilities: HostCapabilities::default(),
        }
    }
}

impl RelayConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_auto_subscribe(mut self, enabled: bool) -> Self {
        self.auto_subscribe = enabled;
        self
    }

    pub fn with_require_pairing(mut self, required: bool) -> Self {
        self.require_pairing = required;
        self
    }

    pub fn with_advertise_name(mut self, name: impl Into<String>) -> Self {
        self.advertise_name = Some(name.into());
        self
    }

    pub fn with_host_capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.host_capabilities = capabilities;
        self
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.connect_timeout.is_zero() {
            return Err(RelayError::Config("connect timeout must be positive".into()));
        }
        if self.operation_timeout.is_zero() {
            return Err(RelayError::Config("operation timeout must be positive".into()));
        }
        if let Some(name) = &self.advertise_name {
            if name.is_empty() || name.len() > MAX_NAME_LEN {
                return Err(RelayError::Config(format!(
                    "advertised name must be 1..={} bytes",
                    MAX_NAME_LEN
                )));
            }
        }
        Ok(())
    }
}
