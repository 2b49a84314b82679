//! Pool of local address candidates
//!
//! [`AddressPool::init_pool`] enumerates the host's interfaces, wraps
//! every non-loopback address in an [`AddressPoolEntry`] and runs one
//! [`AddressDiagnosticsKit`] per entry as its own tokio task. A failure in
//! one kit never reaches another kit or the pool.

use crate::address::{AddressPoolEntry, EntryKey};
use crate::config::DiscoveryConfig;
use crate::diagnostics::{AddressDiagnosticsKit, DiagnosticsState};
use crate::error::Result;
use crate::interfaces::InterfaceEnumerator;
use crate::report::StunDiscoveryReport;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local address candidates and their diagnostics
pub struct AddressPool {
    config: Arc<DiscoveryConfig>,
    enumerator: Arc<dyn InterfaceEnumerator>,
    kits: BTreeMap<EntryKey, Arc<AddressDiagnosticsKit>>,
    tasks: Mutex<Vec<JoinHandle<DiagnosticsState>>>,
    stun_server: Option<SocketAddr>,
    initialized: bool,
    cancel: CancellationToken,
}

impl AddressPool {
    /// Create an empty pool
    ///
    /// `config` is snapshotted here; nothing runs until
    /// [`init_pool`](Self::init_pool).
    pub fn new(config: DiscoveryConfig, enumerator: Arc<dyn InterfaceEnumerator>) -> Self {
        Self {
            config: Arc::new(config),
            enumerator,
            kits: BTreeMap::new(),
            tasks: Mutex::new(Vec::new()),
            stun_server: None,
            initialized: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Enumerate local addresses and start diagnosing each one
    ///
    /// Returns the number of entries. Diagnostics keep running in the
    /// background; use [`wait_for_diagnostics`](Self::wait_for_diagnostics)
    /// to await them. A pool is initialized once; build a new pool to
    /// re-diagnose.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Enumeration`](crate::DiscoveryError::Enumeration)
    /// if the interfaces cannot be listed, and
    /// [`DiscoveryError::InvalidConfig`](crate::DiscoveryError::InvalidConfig)
    /// for unusable limits. An unresolvable STUN server only disables STUN.
    pub async fn init_pool(&mut self) -> Result<usize> {
        if self.initialized {
            warn!("address pool already initialized");
            return Ok(self.kits.len());
        }

        self.config.validate_limits()?;
        let interfaces = self.enumerator.enumerate()?;
        self.initialized = true;

        self.stun_server = match self.config.resolve_stun_server().await {
            Ok(server) => server,
            Err(e) => {
                warn!("STUN disabled: {}", e);
                None
            }
        };

        let mut tasks = self.tasks.lock().await;
        for (interface, address) in interfaces {
            if address.is_loopback() {
                continue;
            }
            if address.is_ipv6() && !self.config.include_ipv6 {
                debug!(%address, %interface, "skipping IPv6 address");
                continue;
            }

            let entry = match AddressPoolEntry::new(address, interface) {
                Ok(entry) => Arc::new(entry),
                Err(e) => {
                    debug!(%address, "skipping address: {}", e);
                    continue;
                }
            };
            if self.kits.contains_key(entry.key()) {
                continue;
            }

            let kit = Arc::new(AddressDiagnosticsKit::new(
                entry.clone(),
                self.config.clone(),
                self.stun_server,
                self.cancel.child_token(),
            ));

            let runner = kit.clone();
            tasks.push(tokio::spawn(async move { runner.run().await }));
            self.kits.insert(entry.key().clone(), kit);
        }

        info!(
            entries = self.kits.len(),
            stun_server = ?self.stun_server,
            "address pool initialized"
        );
        Ok(self.kits.len())
    }

    /// Wait until every diagnostics task has finished
    pub async fn wait_for_diagnostics(&self) {
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("diagnostics task failed: {}", e);
            }
        }
    }

    /// Entries ranked by descending preference
    ///
    /// Entries still being diagnosed sort last; ties keep key order.
    #[must_use]
    pub fn entries(&self) -> Vec<Arc<AddressPoolEntry>> {
        let mut entries: Vec<_> = self.kits.values().map(|kit| kit.entry().clone()).collect();
        entries.sort_by_key(|entry| Reverse(entry.preference()));
        entries
    }

    /// Number of entries
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.kits.len()
    }

    /// True if the pool holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kits.is_empty()
    }

    /// Diagnostics state of the entry with `key`
    pub async fn state_of(&self, key: &EntryKey) -> Option<DiagnosticsState> {
        match self.kits.get(key) {
            Some(kit) => Some(kit.state().await),
            None => None,
        }
    }

    /// Diagnostics kit of the entry with `key`
    #[must_use]
    pub fn kit(&self, key: &EntryKey) -> Option<&Arc<AddressDiagnosticsKit>> {
        self.kits.get(key)
    }

    /// NAT report of the entry with `key`, if its kit produced one
    #[must_use]
    pub fn report_of(&self, key: &EntryKey) -> Option<StunDiscoveryReport> {
        self.kits.get(key).and_then(|kit| kit.report())
    }

    /// Resolved STUN server, `None` when STUN is off
    #[must_use]
    pub fn stun_server(&self) -> Option<SocketAddr> {
        self.stun_server
    }

    /// Configuration snapshot
    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Cancel all running diagnostics
    ///
    /// Kits stop at their next wait, release their sockets and keep
    /// their provisional preference.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            debug!("cancelling address diagnostics");
            self.cancel.cancel();
        }
    }
}

impl Drop for AddressPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for AddressPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressPool")
            .field("entries", &self.kits.keys().collect::<Vec<_>>())
            .field("stun_server", &self.stun_server)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}
