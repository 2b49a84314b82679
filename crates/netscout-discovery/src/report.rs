//! Result of a STUN binding discovery run.

use crate::address::FirewallType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// NAT classification as reported by RFC 3489 binding discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    /// Discovery did not reach a conclusion
    Unknown,
    /// No NAT, no filtering
    OpenInternet,
    /// UDP is blocked altogether
    UdpBlockingFirewall,
    /// No NAT, but only replies from contacted endpoints get through
    SymmetricUdpFirewall,
    /// Full-cone NAT
    FullConeNat,
    /// Symmetric NAT
    SymmetricNat,
    /// Restricted-cone NAT
    RestrictedConeNat,
    /// Port-restricted-cone NAT
    PortRestrictedConeNat,
}

impl NatType {
    /// Firewall class an entry receives for this outcome, if any
    #[must_use]
    pub fn firewall_type(self) -> Option<FirewallType> {
        match self {
            Self::OpenInternet => Some(FirewallType::OpenInternet),
            Self::FullConeNat => Some(FirewallType::FullCone),
            Self::RestrictedConeNat => Some(FirewallType::RestrictedCone),
            Self::PortRestrictedConeNat => Some(FirewallType::PortRestrictedCone),
            Self::SymmetricNat | Self::SymmetricUdpFirewall => Some(FirewallType::Symmetric),
            Self::Unknown | Self::UdpBlockingFirewall => None,
        }
    }

    /// Whether the outcome involves address translation
    #[must_use]
    pub fn is_nat(self) -> bool {
        matches!(
            self,
            Self::FullConeNat
                | Self::SymmetricNat
                | Self::RestrictedConeNat
                | Self::PortRestrictedConeNat
        )
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unknown => "Unknown",
            Self::OpenInternet => "Open Internet",
            Self::UdpBlockingFirewall => "UDP Blocking Firewall",
            Self::SymmetricUdpFirewall => "Symmetric UDP Firewall",
            Self::FullConeNat => "Full Cone NAT",
            Self::SymmetricNat => "Symmetric NAT",
            Self::RestrictedConeNat => "Restricted Cone NAT",
            Self::PortRestrictedConeNat => "Port Restricted Cone NAT",
        };
        f.write_str(label)
    }
}

/// NAT label plus the public address the STUN server saw
///
/// Equality compares both fields; two reports without a public address
/// are equal when their NAT types match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StunDiscoveryReport {
    nat_type: NatType,
    public_address: Option<SocketAddr>,
}

impl StunDiscoveryReport {
    /// Build a report
    #[must_use]
    pub fn new(nat_type: NatType, public_address: Option<SocketAddr>) -> Self {
        Self {
            nat_type,
            public_address,
        }
    }

    /// Report for a run that reached no conclusion
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(NatType::Unknown, None)
    }

    /// Classified NAT type
    #[must_use]
    pub fn nat_type(&self) -> NatType {
        self.nat_type
    }

    /// Server-observed public address
    #[must_use]
    pub fn public_address(&self) -> Option<SocketAddr> {
        self.public_address
    }
}

impl Default for StunDiscoveryReport {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for StunDiscoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.public_address {
            Some(addr) => write!(f, "{} (public address {})", self.nat_type, addr),
            None => write!(f, "{}", self.nat_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_with_null_addresses() {
        let a = StunDiscoveryReport::new(NatType::SymmetricNat, None);
        let b = StunDiscoveryReport::new(NatType::SymmetricNat, None);
        assert_eq!(a, b);
        assert_ne!(a, StunDiscoveryReport::new(NatType::FullConeNat, None));
    }

    #[test]
    fn test_equality_compares_address() {
        let addr1 = "203.0.113.5:4000".parse().unwrap();
        let addr2 = "203.0.113.5:4001".parse().unwrap();
        let a = StunDiscoveryReport::new(NatType::FullConeNat, Some(addr1));
        assert_eq!(a, StunDiscoveryReport::new(NatType::FullConeNat, Some(addr1)));
        assert_ne!(a, StunDiscoveryReport::new(NatType::FullConeNat, Some(addr2)));
        assert_ne!(a, StunDiscoveryReport::new(NatType::FullConeNat, None));
    }

    #[test]
    fn test_default_is_unknown() {
        let report = StunDiscoveryReport::default();
        assert_eq!(report.nat_type(), NatType::Unknown);
        assert!(report.public_address().is_none());
    }

    #[test]
    fn test_firewall_mapping() {
        assert_eq!(NatType::UdpBlockingFirewall.firewall_type(), None);
        assert_eq!(
            NatType::SymmetricUdpFirewall.firewall_type(),
            Some(FirewallType::Symmetric)
        );
        assert!(NatType::RestrictedConeNat.is_nat());
        assert!(!NatType::SymmetricUdpFirewall.is_nat());
    }

    #[test]
    fn test_display() {
        let report = StunDiscoveryReport::new(
            NatType::PortRestrictedConeNat,
            Some("198.51.100.2:3478".parse().unwrap()),
        );
        assert_eq!(
            report.to_string(),
            "Port Restricted Cone NAT (public address 198.51.100.2:3478)"
        );
    }
}
