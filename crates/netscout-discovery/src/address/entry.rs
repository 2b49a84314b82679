//! One local (address, interface) pair and its classification result.

use super::{AddressPreference, FirewallDescriptor};
use crate::error::{DiscoveryError, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

/// Identity of an [`AddressPoolEntry`]
///
/// Ordered by address first so pool iteration is stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    /// Local IP address
    pub address: IpAddr,
    /// Name of the owning network interface
    pub interface: String,
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%{}", self.address, self.interface)
    }
}

/// A local address candidate
///
/// The (address, interface) pair never changes. If the host's address
/// changes a new entry is built. Classification predicates are pure
/// functions of the address; preference and firewall descriptor are
/// written once by the diagnostics run that owns this entry.
#[derive(Debug)]
pub struct AddressPoolEntry {
    key: EntryKey,
    preference: OnceLock<AddressPreference>,
    firewall: OnceLock<FirewallDescriptor>,
}

impl AddressPoolEntry {
    /// Wrap `address` owned by `interface`
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidArgument`] for the unspecified
    /// (wildcard) address, which names no host.
    pub fn new(address: IpAddr, interface: impl Into<String>) -> Result<Self> {
        if address.is_unspecified() {
            return Err(DiscoveryError::InvalidArgument(
                "pool entry address must not be the wildcard address",
            ));
        }

        Ok(Self {
            key: EntryKey {
                address,
                interface: interface.into(),
            },
            preference: OnceLock::new(),
            firewall: OnceLock::new(),
        })
    }

    /// Entry identity
    #[must_use]
    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    /// Wrapped address
    #[must_use]
    pub fn address(&self) -> IpAddr {
        self.key.address
    }

    /// Owning interface name
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.key.interface
    }

    /// True for IPv6 addresses
    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        self.key.address.is_ipv6()
    }

    /// Link-local in either the IPv4 (169.254/16) or IPv6 (fe80::/10) sense
    #[must_use]
    pub fn is_link_local(&self) -> bool {
        match self.key.address {
            IpAddr::V4(v4) => is_autoconf_v4(v4),
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        }
    }

    /// IPv4 address assigned by Windows/zeroconf autoconfiguration (169.254/16)
    #[must_use]
    pub fn is_ipv4_link_local_autoconf(&self) -> bool {
        match self.key.address {
            IpAddr::V4(v4) => is_autoconf_v4(v4),
            IpAddr::V6(_) => false,
        }
    }

    /// IPv4 address in 10/8, 172.16/12 or 192.168/16
    #[must_use]
    pub fn is_private_ipv4(&self) -> bool {
        match self.key.address {
            IpAddr::V4(v4) => is_private_v4(v4),
            IpAddr::V6(_) => false,
        }
    }

    /// IPv6 6to4 address (2002::/16)
    #[must_use]
    pub fn is_6to4(&self) -> bool {
        match self.key.address {
            IpAddr::V4(_) => false,
            IpAddr::V6(v6) => is_6to4_v6(v6),
        }
    }

    /// Loopback address
    #[must_use]
    pub fn is_loopback(&self) -> bool {
        self.key.address.is_loopback()
    }

    /// Not link-local, not autoconfigured, not private and not loopback
    #[must_use]
    pub fn is_globally_routable(&self) -> bool {
        !self.is_link_local()
            && !self.is_ipv4_link_local_autoconf()
            && !self.is_private_ipv4()
            && !self.is_loopback()
    }

    /// Final preference, `None` until diagnostics finished
    #[must_use]
    pub fn preference(&self) -> Option<AddressPreference> {
        self.preference.get().copied()
    }

    /// Detected firewall, `None` if none was classified
    #[must_use]
    pub fn firewall_descriptor(&self) -> Option<&FirewallDescriptor> {
        self.firewall.get()
    }

    /// Record the diagnosed preference. Later writes are ignored.
    pub(crate) fn set_address_preference(&self, preference: AddressPreference) -> bool {
        let stored = self.preference.set(preference).is_ok();
        if !stored {
            tracing::debug!(entry = %self.key, "preference already set, ignoring {}", preference);
        }
        stored
    }

    /// Record the detected firewall. Later writes are ignored.
    pub(crate) fn set_firewall_descriptor(&self, descriptor: FirewallDescriptor) -> bool {
        let stored = self.firewall.set(descriptor).is_ok();
        if !stored {
            tracing::debug!(entry = %self.key, "firewall descriptor already set");
        }
        stored
    }
}

impl fmt::Display for AddressPoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.preference() {
            Some(pref) => write!(f, "{} (preference {})", self.key, pref),
            None => write!(f, "{} (unclassified)", self.key),
        }
    }
}

fn is_autoconf_v4(addr: Ipv4Addr) -> bool {
    let [a, b, _, _] = addr.octets();
    a == 169 && b == 254
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    let [a, b, _, _] = addr.octets();
    a == 10 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168)
}

fn is_6to4_v6(addr: Ipv6Addr) -> bool {
    addr.segments()[0] == 0x2002
}
