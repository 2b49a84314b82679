//! Discovery configuration
//!
//! Read once when a pool is created; later changes only affect pools
//! built afterwards.

use crate::error::{DiscoveryError, Result, TransportError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default per-transaction STUN timeout in milliseconds
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 3000;

/// Default number of local bind attempts
pub const DEFAULT_BIND_RETRIES: u32 = 10;

/// Default upper bound for binding-lifetime discovery, in seconds
pub const DEFAULT_MAX_BINDING_LIFETIME_SECS: u32 = 300;

/// Address discovery configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Master switch for STUN classification
    pub stun_enabled: bool,
    /// STUN server as `host:port`. There is no built-in default; without
    /// one STUN is disabled.
    pub stun_server: Option<String>,
    /// How long to wait for each STUN response
    pub transaction_timeout_ms: u64,
    /// Attempts at binding the local STUN socket
    pub bind_retries: u32,
    /// Range the local STUN port is drawn from (inclusive)
    pub port_range: (u16, u16),
    /// Measure how long the NAT keeps idle bindings
    pub discover_binding_lifetime: bool,
    /// Upper bound of the binding-lifetime search, in seconds
    pub max_binding_lifetime_secs: u32,
    /// Whether IPv6 addresses enter the pool
    pub include_ipv6: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            stun_enabled: true,
            stun_server: None,
            transaction_timeout_ms: DEFAULT_TRANSACTION_TIMEOUT_MS,
            bind_retries: DEFAULT_BIND_RETRIES,
            port_range: (1024, 65535),
            discover_binding_lifetime: false,
            max_binding_lifetime_secs: DEFAULT_MAX_BINDING_LIFETIME_SECS,
            include_ipv6: true,
        }
    }
}

impl DiscoveryConfig {
    /// Configuration with STUN pointed at `server`
    #[must_use]
    pub fn with_stun_server(server: impl Into<String>) -> Self {
        Self {
            stun_server: Some(server.into()),
            ..Self::default()
        }
    }

    /// Configuration with STUN switched off
    #[must_use]
    pub fn stun_disabled() -> Self {
        Self {
            stun_enabled: false,
            ..Self::default()
        }
    }

    /// Per-transaction timeout as a [`Duration`]
    #[must_use]
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Whether STUN is switched on and has a server to talk to
    #[must_use]
    pub fn stun_active(&self) -> bool {
        self.stun_enabled && self.stun_server.is_some()
    }

    /// Resolve the configured STUN server
    ///
    /// Returns `Ok(None)` when STUN is disabled or no server is set.
    /// IPv4 results are preferred since binding discovery runs over IPv4.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Resolve`] if the lookup fails or yields
    /// no addresses.
    pub async fn resolve_stun_server(&self) -> Result<Option<SocketAddr>> {
        let Some(server) = self.stun_server.as_deref().filter(|_| self.stun_enabled) else {
            return Ok(None);
        };

        let resolve_error = |source| TransportError::Resolve {
            host: server.to_string(),
            source,
        };

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(server)
            .await
            .map_err(resolve_error)?
            .collect();

        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .map(Some)
            .ok_or_else(|| {
                resolve_error(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no addresses returned",
                ))
                .into()
            })
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidConfig`] describing the first
    /// offending field.
    pub fn validate(&self) -> Result<()> {
        self.validate_limits()?;

        if let Some(server) = &self.stun_server {
            validate_host_port(server)?;
        }

        Ok(())
    }

    /// Validate everything except the STUN server, which degrades to
    /// "STUN disabled" when unusable
    pub(crate) fn validate_limits(&self) -> Result<()> {
        if self.transaction_timeout_ms == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "transaction_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.bind_retries == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "bind_retries must be greater than zero".to_string(),
            ));
        }

        let (low, high) = self.port_range;
        if low == 0 || low > high {
            return Err(DiscoveryError::InvalidConfig(format!(
                "invalid port_range ({low}, {high})"
            )));
        }

        if self.discover_binding_lifetime && self.max_binding_lifetime_secs == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "max_binding_lifetime_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Validate a `host:port` string. IPv6 literals must be bracketed.
fn validate_host_port(value: &str) -> Result<()> {
    if value.parse::<SocketAddr>().is_ok() {
        return Ok(());
    }

    let invalid = || DiscoveryError::InvalidConfig(format!("invalid stun_server: {value}"));

    let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.contains(':') || host.contains(char::is_whitespace) {
        return Err(invalid());
    }

    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(()),
        _ => Err(invalid()),
    }
}
