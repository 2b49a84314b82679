//! Address selection over a diagnosed pool

use crate::address::AddressPreference;
use crate::config::DiscoveryConfig;
use crate::error::{Result, TransportError};
use crate::interfaces::InterfaceEnumerator;
use crate::pool::AddressPool;
use crate::report::StunDiscoveryReport;
use crate::stun::{ChangeRequest, StunClient};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Port used when asking the OS for a route; nothing is sent
const ROUTE_PROBE_PORT: u16 = 9;

/// Best-address and NAT-report queries over a diagnosed [`AddressPool`]
///
/// "No usable address" is a normal outcome: selection then falls back to
/// the wildcard address instead of failing.
#[derive(Debug)]
pub struct NetworkAddressManager {
    pool: AddressPool,
}

impl NetworkAddressManager {
    /// Build a pool, diagnose every address and wait for the results
    ///
    /// # Errors
    ///
    /// Returns the errors of [`AddressPool::init_pool`].
    pub async fn start(
        config: DiscoveryConfig,
        enumerator: Arc<dyn InterfaceEnumerator>,
    ) -> Result<Self> {
        let mut pool = AddressPool::new(config, enumerator);
        pool.init_pool().await?;
        pool.wait_for_diagnostics().await;
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    #[must_use]
    pub fn from_pool(pool: AddressPool) -> Self {
        Self { pool }
    }

    /// Underlying pool
    #[must_use]
    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Highest-preference usable local address
    ///
    /// Entries ranked at [`AddressPreference::MIN`] or not yet diagnosed
    /// are not usable. Returns `0.0.0.0` when nothing is.
    #[must_use]
    pub fn best_local_address(&self) -> IpAddr {
        self.pool
            .entries()
            .iter()
            .find(|entry| entry.preference().is_some_and(|p| p > AddressPreference::MIN))
            .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |entry| entry.address())
    }

    /// Public (address, port) a peer should use to reach local `port`
    ///
    /// With STUN available this binds `best:port`, runs a test I and
    /// returns the mapped address. Otherwise, or when the server does not
    /// answer, returns `best:port` unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Transport`](crate::DiscoveryError::Transport)
    /// if `port` cannot be bound on the best address or the request
    /// cannot be sent.
    pub async fn public_address_for(&self, port: u16) -> Result<SocketAddr> {
        let best = self.best_local_address();
        let local = SocketAddr::new(best, port);

        let server = match self.pool.stun_server() {
            Some(server) if !best.is_unspecified() && server.is_ipv4() == best.is_ipv4() => server,
            _ => return Ok(local),
        };

        let client = StunClient::bind(local).await?;
        let response = client
            .binding_request(server, ChangeRequest::NONE, self.pool.config().transaction_timeout())
            .await;
        client.shutdown();

        match response? {
            Some(response) => match response.mapped_address {
                Some(mapped) => Ok(mapped),
                None => {
                    warn!(%server, "binding response without MAPPED-ADDRESS");
                    Ok(local)
                }
            },
            None => {
                debug!(%server, "no binding response, using local address");
                Ok(local)
            }
        }
    }

    /// NAT report of the best-ranked entry that produced one
    #[must_use]
    pub fn discovery_report(&self) -> StunDiscoveryReport {
        self.pool
            .entries()
            .iter()
            .find_map(|entry| self.pool.report_of(entry.key()))
            .unwrap_or_default()
    }

    /// Local address the OS would route through to reach `destination`
    ///
    /// Falls back to the wildcard address of the destination's family when
    /// there is no route.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Transport`](crate::DiscoveryError::Transport)
    /// if no socket can be opened at all.
    pub async fn local_host_for(&self, destination: IpAddr) -> Result<IpAddr> {
        let wildcard = match destination {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let bind_addr = SocketAddr::new(wildcard, 0);

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: bind_addr,
                source,
            })?;

        // connect() on UDP only selects a route
        if let Err(e) = socket
            .connect(SocketAddr::new(destination, ROUTE_PROBE_PORT))
            .await
        {
            debug!(%destination, "no route: {}", e);
            return Ok(wildcard);
        }

        Ok(socket.local_addr().map_or(wildcard, |addr| addr.ip()))
    }
}
