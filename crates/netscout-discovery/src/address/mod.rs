//! Local address candidates and their ranking
//!
//! - [`AddressPreference`]: bounded 0–100 usability score
//! - [`FirewallDescriptor`]: NAT / firewall detected in front of an address
//! - [`AddressPoolEntry`]: one (address, interface) pair plus its result

pub mod entry;
pub mod firewall;
pub mod preference;

pub use entry::{AddressPoolEntry, EntryKey};
pub use firewall::{DEFAULT_BINDINGS_LIFETIME_SECS, FirewallDescriptor, FirewallType};
pub use preference::AddressPreference;
