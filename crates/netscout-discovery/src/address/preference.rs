//! Numeric usability ranking for a local address.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Usability of an address for unsolicited inbound connectivity
///
/// Always within `[MIN, MAX]`. Higher is better. Constructing from an
/// out-of-range value clips it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub struct AddressPreference(u8);

impl AddressPreference {
    /// Lowest preference: unusable
    pub const MIN: Self = Self(0);
    /// Highest preference
    pub const MAX: Self = Self(100);

    /// IPv6 link-local address
    pub const LOCAL_IPV6: Self = Self(40);
    /// IPv4 address in a private (RFC 1918) range
    pub const PRIVATE_IPV4: Self = Self(50);
    /// Globally routable IPv4 address
    pub const GLOBAL_IPV4: Self = Self(60);
    /// Globally routable IPv6 address
    pub const GLOBAL_IPV6: Self = Self(70);

    /// Create a preference, clipping `value` to `[0, 100]`
    #[must_use]
    pub const fn new(value: i32) -> Self {
        if value < 0 {
            Self::MIN
        } else if value > 100 {
            Self::MAX
        } else {
            Self(value as u8)
        }
    }

    /// Raw numeric value
    #[must_use]
    pub const fn value(self) -> i32 {
        self.0 as i32
    }

    /// Signed difference `self - other`, the sign of which orders the two
    #[must_use]
    pub const fn compare_to(self, other: Self) -> i32 {
        self.value() - other.value()
    }

    /// Remove `subtrahend` points, never going below `MIN`
    #[must_use]
    pub const fn saturating_sub(self, subtrahend: Self) -> Self {
        Self::new(self.value() - subtrahend.value())
    }
}

impl Default for AddressPreference {
    fn default() -> Self {
        Self::MIN
    }
}

impl Ord for AddressPreference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for AddressPreference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<i32> for AddressPreference {
    fn from(value: i32) -> Self {
        Self::new(value)
    }
}

impl From<AddressPreference> for i32 {
    fn from(pref: AddressPreference) -> Self {
        pref.value()
    }
}

impl fmt::Display for AddressPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
