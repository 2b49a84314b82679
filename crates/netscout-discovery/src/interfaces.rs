//! Local network interface enumeration

use crate::error::{DiscoveryError, Result};
use std::net::IpAddr;

/// Source of (interface name, bound address) pairs for the current host
///
/// Called once per [`AddressPool::init_pool`](crate::AddressPool::init_pool).
pub trait InterfaceEnumerator: Send + Sync {
    /// List every address bound to every interface
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Enumeration`] if the host's interfaces
    /// cannot be read.
    fn enumerate(&self) -> Result<Vec<(String, IpAddr)>>;
}

/// Interfaces of the running host, read through the OS
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceEnumerator for SystemInterfaces {
    fn enumerate(&self) -> Result<Vec<(String, IpAddr)>> {
        local_ip_address::list_afinet_netifas()
            .map_err(|e| DiscoveryError::Enumeration(e.to_string()))
    }
}

/// Fixed interface list
///
/// For embedding callers that already know their addresses, and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces {
    interfaces: Vec<(String, IpAddr)>,
}

impl StaticInterfaces {
    /// Wrap a list of (interface, address) pairs
    #[must_use]
    pub fn new(interfaces: Vec<(String, IpAddr)>) -> Self {
        Self { interfaces }
    }

    /// Add one address bound to `interface`
    #[must_use]
    pub fn with(mut self, interface: impl Into<String>, address: IpAddr) -> Self {
        self.interfaces.push((interface.into(), address));
        self
    }
}

impl InterfaceEnumerator for StaticInterfaces {
    fn enumerate(&self) -> Result<Vec<(String, IpAddr)>> {
        Ok(self.interfaces.clone())
    }
}
