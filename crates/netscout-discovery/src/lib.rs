//! # netscout discovery
//!
//! Local address discovery and NAT/firewall classification.
//!
//! This crate provides:
//! - Address pool built from the host's network interfaces
//! - RFC 3489 STUN client (tests I, II and III)
//! - Per-address diagnostics that classify the NAT in front of each address
//! - Address ranking by [`AddressPreference`]
//!
//! ## Ranking
//!
//! Every non-loopback address gets a base preference from its kind
//! (link-local IPv6 40, private IPv4 50, global IPv4 60, global IPv6 70).
//! IPv4 addresses are then probed against a STUN server and lose points
//! according to the NAT found in front of them, so a private address
//! behind a full-cone NAT can outrank a public one behind a symmetric
//! firewall.
//!
//! ## Example
//!
//! ```rust,no_run
//! use netscout_discovery::{DiscoveryConfig, NetworkAddressManager, SystemInterfaces};
//! use std::sync::Arc;
//!
//! # async fn run() -> netscout_discovery::Result<()> {
//! let config = DiscoveryConfig::with_stun_server("stun.example.org:3478");
//! let manager = NetworkAddressManager::start(config, Arc::new(SystemInterfaces)).await?;
//!
//! println!("best local address: {}", manager.best_local_address());
//! println!("NAT: {}", manager.discovery_report());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod interfaces;
pub mod manager;
pub mod pool;
pub mod report;
pub mod stun;

// Re-export commonly used types
pub use address::{
    AddressPoolEntry, AddressPreference, EntryKey, FirewallDescriptor, FirewallType,
};
pub use config::DiscoveryConfig;
pub use diagnostics::{AddressDiagnosticsKit, DiagnosticsState};
pub use error::{DiscoveryError, ProtocolError, Result, TransportError};
pub use interfaces::{InterfaceEnumerator, StaticInterfaces, SystemInterfaces};
pub use manager::NetworkAddressManager;
pub use pool::AddressPool;
pub use report::{NatType, StunDiscoveryReport};
pub use stun::{BindingResponse, ChangeRequest, StunClient, StunMessage};
