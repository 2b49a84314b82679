//! Firewall / NAT description attached to a diagnosed address.

use super::AddressPreference;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Default NAT binding lifetime assumed when it was not measured
pub const DEFAULT_BINDINGS_LIFETIME_SECS: u32 = 30;

/// Firewall / NAT behaviour class (RFC 3489 terms)
///
/// Ordered by increasing restriction on inbound traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallType {
    /// No NAT, no filtering
    OpenInternet,
    /// Any external host can send to the mapped address
    FullCone,
    /// Only hosts we contacted (any port) can send
    RestrictedCone,
    /// Only host:port pairs we contacted can send
    PortRestrictedCone,
    /// Different mapping per destination, or a symmetric UDP firewall
    Symmetric,
}

impl FirewallType {
    /// Points removed from an address's provisional preference
    #[must_use]
    pub const fn preference_subtrahend(self) -> AddressPreference {
        match self {
            Self::OpenInternet => AddressPreference::new(0),
            Self::FullCone => AddressPreference::new(5),
            Self::RestrictedCone => AddressPreference::new(10),
            Self::PortRestrictedCone => AddressPreference::new(15),
            Self::Symmetric => AddressPreference::new(40),
        }
    }
}

impl fmt::Display for FirewallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenInternet => write!(f, "Open Internet"),
            Self::FullCone => write!(f, "Full Cone"),
            Self::RestrictedCone => write!(f, "Restricted Cone"),
            Self::PortRestrictedCone => write!(f, "Port Restricted Cone"),
            Self::Symmetric => write!(f, "Symmetric"),
        }
    }
}

/// Detected firewall / NAT in front of one local address
///
/// Built by the diagnostics run, then read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallDescriptor {
    firewall_type: FirewallType,
    preference_subtrahend: AddressPreference,
    bindings_lifetime_seconds: u32,
    is_translating_addresses: bool,
    public_address: Option<SocketAddr>,
}

impl FirewallDescriptor {
    /// Empty descriptor: open internet, no subtrahend, default lifetime
    pub(crate) fn new() -> Self {
        Self {
            firewall_type: FirewallType::OpenInternet,
            preference_subtrahend: AddressPreference::MIN,
            bindings_lifetime_seconds: DEFAULT_BINDINGS_LIFETIME_SECS,
            is_translating_addresses: false,
            public_address: None,
        }
    }

    /// Descriptor for `firewall_type` with its standard subtrahend
    pub(crate) fn classified(firewall_type: FirewallType, translating: bool) -> Self {
        let mut descriptor = Self::new();
        descriptor.set_firewall_type(firewall_type);
        descriptor.set_preference_subtrahend(firewall_type.preference_subtrahend());
        descriptor.set_translating_addresses(translating);
        descriptor
    }

    /// Firewall / NAT class
    #[must_use]
    pub fn firewall_type(&self) -> FirewallType {
        self.firewall_type
    }

    /// Points removed from the base preference
    #[must_use]
    pub fn preference_subtrahend(&self) -> AddressPreference {
        self.preference_subtrahend
    }

    /// How long the NAT keeps an idle UDP binding, in seconds
    #[must_use]
    pub fn bindings_lifetime_seconds(&self) -> u32 {
        self.bindings_lifetime_seconds
    }

    /// Whether the device rewrites our source address
    #[must_use]
    pub fn is_translating_addresses(&self) -> bool {
        self.is_translating_addresses
    }

    /// Address the STUN server observed for us
    #[must_use]
    pub fn public_address(&self) -> Option<SocketAddr> {
        self.public_address
    }

    pub(crate) fn set_firewall_type(&mut self, firewall_type: FirewallType) {
        self.firewall_type = firewall_type;
    }

    pub(crate) fn set_preference_subtrahend(&mut self, subtrahend: AddressPreference) {
        self.preference_subtrahend = subtrahend;
    }

    pub(crate) fn set_bindings_lifetime_seconds(&mut self, seconds: u32) {
        self.bindings_lifetime_seconds = seconds;
    }

    pub(crate) fn set_translating_addresses(&mut self, translating: bool) {
        self.is_translating_addresses = translating;
    }

    pub(crate) fn set_public_address(&mut self, address: Option<SocketAddr>) {
        self.public_address = address;
    }
}
