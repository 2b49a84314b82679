//! Per-address NAT/firewall classification
//!
//! One [`AddressDiagnosticsKit`] runs the RFC 3489 §10.1 binding
//! discovery for one [`AddressPoolEntry`] and writes the entry's final
//! preference (and, when classified, its firewall descriptor) exactly once.
//!
//! ```text
//! Off -> DiscoveringConfig -> Resolving -> [DiscoveringBindLifetime] -> Completed
//!                  |               |                    |
//!                  +---------------+--------------------+-------------> Terminated
//! ```

use crate::address::{AddressPoolEntry, AddressPreference, FirewallDescriptor, FirewallType};
use crate::config::DiscoveryConfig;
use crate::error::{ProtocolError, TransportError};
use crate::report::{NatType, StunDiscoveryReport};
use crate::stun::{BindingResponse, ChangeRequest, StunClient};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Diagnostics state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticsState {
    /// Not started
    Off,
    /// Classifying the address itself
    DiscoveringConfig,
    /// Running STUN tests
    Resolving,
    /// Measuring how long the NAT keeps idle bindings
    DiscoveringBindLifetime,
    /// Finished with a full result
    Completed,
    /// Finished, possibly early; the entry keeps whatever was decided
    Terminated,
}

impl DiagnosticsState {
    /// True for [`Completed`](Self::Completed) and [`Terminated`](Self::Terminated)
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }
}

impl fmt::Display for DiagnosticsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::DiscoveringConfig => write!(f, "discovering config"),
            Self::Resolving => write!(f, "resolving"),
            Self::DiscoveringBindLifetime => write!(f, "discovering bind lifetime"),
            Self::Completed => write!(f, "completed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Outcome of the STUN test sequence
struct Classification {
    nat_type: NatType,
    public_address: Option<SocketAddr>,
}

impl Classification {
    fn new(nat_type: NatType, public_address: Option<SocketAddr>) -> Self {
        Self {
            nat_type,
            public_address,
        }
    }
}

/// Runs the classification algorithm for one pool entry
pub struct AddressDiagnosticsKit {
    entry: Arc<AddressPoolEntry>,
    config: Arc<DiscoveryConfig>,
    stun_server: Option<SocketAddr>,
    state: RwLock<DiagnosticsState>,
    report: OnceLock<StunDiscoveryReport>,
    cancel: CancellationToken,
}

impl AddressDiagnosticsKit {
    /// Create a kit for `entry`
    ///
    /// `stun_server` is the already resolved primary server; `None` disables
    /// STUN for this kit. Cancelling `cancel` makes a running kit stop at
    /// its next wait.
    #[must_use]
    pub fn new(
        entry: Arc<AddressPoolEntry>,
        config: Arc<DiscoveryConfig>,
        stun_server: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            entry,
            config,
            stun_server,
            state: RwLock::new(DiagnosticsState::Off),
            report: OnceLock::new(),
            cancel,
        }
    }

    /// Entry under diagnosis
    #[must_use]
    pub fn entry(&self) -> &Arc<AddressPoolEntry> {
        &self.entry
    }

    /// Current state
    pub async fn state(&self) -> DiagnosticsState {
        *self.state.read().await
    }

    /// NAT report, available once the STUN tests ran to a conclusion
    #[must_use]
    pub fn report(&self) -> Option<StunDiscoveryReport> {
        self.report.get().copied()
    }

    /// Run the diagnostics and return the final state
    ///
    /// A kit runs once; calling this again returns the current state.
    pub async fn run(&self) -> DiagnosticsState {
        {
            let mut state = self.state.write().await;
            if *state != DiagnosticsState::Off {
                warn!(entry = %self.entry.key(), "diagnostics already started");
                return *state;
            }
            *state = DiagnosticsState::DiscoveringConfig;
        }

        let span = info_span!(
            "diagnostics",
            address = %self.entry.address(),
            interface = %self.entry.interface()
        );
        self.diagnose().instrument(span).await
    }

    async fn diagnose(&self) -> DiagnosticsState {
        let entry = &self.entry;

        if entry.is_ipv6() {
            if entry.is_link_local() {
                return self
                    .finish(AddressPreference::LOCAL_IPV6, DiagnosticsState::Terminated)
                    .await;
            }
            if entry.is_6to4() {
                debug!("6to4 addresses are not supported");
                return self
                    .finish(AddressPreference::MIN, DiagnosticsState::Terminated)
                    .await;
            }
            // Binding discovery is IPv4-only
            return self
                .finish(AddressPreference::GLOBAL_IPV6, DiagnosticsState::Completed)
                .await;
        }

        if entry.is_ipv4_link_local_autoconf() {
            return self
                .finish(AddressPreference::MIN, DiagnosticsState::Terminated)
                .await;
        }

        let provisional = if entry.is_private_ipv4() {
            AddressPreference::PRIVATE_IPV4
        } else {
            AddressPreference::GLOBAL_IPV4
        };

        let server = match self.stun_server {
            Some(server) if self.config.stun_enabled => server,
            _ => {
                debug!("STUN disabled, keeping provisional preference {}", provisional);
                return self.finish(provisional, DiagnosticsState::Terminated).await;
            }
        };

        self.set_state(DiagnosticsState::Resolving).await;

        let client = match StunClient::bind_with_retries(
            entry.address(),
            self.config.port_range,
            self.config.bind_retries,
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                warn!("could not bind STUN socket: {}", e);
                return self.finish(provisional, DiagnosticsState::Terminated).await;
            }
        };

        let outcome = tokio::select! {
            () = self.cancel.cancelled() => Err(TransportError::Closed),
            result = self.classify_and_measure(&client, server, provisional) => result,
        };
        client.shutdown();

        match outcome {
            Ok((preference, state)) => self.finish(preference, state).await,
            Err(TransportError::Closed) if self.cancel.is_cancelled() => {
                debug!("diagnostics cancelled");
                self.finish(provisional, DiagnosticsState::Terminated).await
            }
            Err(e) => {
                warn!("STUN transport failure: {}", e);
                self.finish(provisional, DiagnosticsState::Terminated).await
            }
        }
    }

    /// Classify, record the descriptor and report, and optionally measure
    /// the binding lifetime. Returns the final preference and state.
    async fn classify_and_measure(
        &self,
        client: &StunClient,
        server: SocketAddr,
        provisional: AddressPreference,
    ) -> Result<(AddressPreference, DiagnosticsState), TransportError> {
        let classification = self.classify(client, server).await?;
        let _ = self.report.set(StunDiscoveryReport::new(
            classification.nat_type,
            classification.public_address,
        ));

        let Some(firewall_type) = classification.nat_type.firewall_type() else {
            warn!(
                nat_type = %classification.nat_type,
                "no usable classification, keeping provisional preference"
            );
            return Ok((provisional, DiagnosticsState::Terminated));
        };

        let mut descriptor =
            FirewallDescriptor::classified(firewall_type, classification.nat_type.is_nat());
        descriptor.set_public_address(classification.public_address);

        let mut state = DiagnosticsState::Terminated;
        if self.config.discover_binding_lifetime && firewall_type != FirewallType::OpenInternet {
            self.set_state(DiagnosticsState::DiscoveringBindLifetime).await;
            match self.discover_binding_lifetime(client, server).await {
                Ok(Some(lifetime)) => {
                    descriptor.set_bindings_lifetime_seconds(lifetime);
                    state = DiagnosticsState::Completed;
                }
                Ok(None) => debug!("binding lifetime undetermined, keeping default"),
                Err(TransportError::Closed) if self.cancel.is_cancelled() => {
                    return Err(TransportError::Closed);
                }
                Err(e) => warn!("binding lifetime discovery failed: {}", e),
            }
        }

        let preference = provisional.saturating_sub(descriptor.preference_subtrahend());
        info!(
            firewall = %firewall_type,
            translating = descriptor.is_translating_addresses(),
            public_address = ?descriptor.public_address(),
            "classified as {}, preference {}",
            classification.nat_type,
            preference
        );
        self.entry.set_firewall_descriptor(descriptor);

        Ok((preference, state))
    }

    /// RFC 3489 §10.1 test sequence
    async fn classify(
        &self,
        client: &StunClient,
        server: SocketAddr,
    ) -> Result<Classification, TransportError> {
        let timeout = self.config.transaction_timeout();

        debug!(%server, "test I");
        let Some(test1) = client.binding_request(server, ChangeRequest::NONE, timeout).await? else {
            warn!(%server, "no response to test I, UDP appears blocked");
            return Ok(Classification::new(NatType::UdpBlockingFirewall, None));
        };

        let Some(mapped) = test1.mapped_address else {
            error!(
                %server,
                "malformed test I response: {}",
                ProtocolError::MissingAttribute("MAPPED-ADDRESS")
            );
            return Ok(Classification::new(NatType::Unknown, None));
        };

        let no_nat = mapped == client.local_addr();
        debug!(%mapped, no_nat, "test II");
        let test2 = client
            .binding_request(server, ChangeRequest::IP_AND_PORT, timeout)
            .await?
            .filter(|reply| from_changed_origin(reply, server, ChangeRequest::IP_AND_PORT));

        if test2.is_some() {
            let nat_type = if no_nat {
                NatType::OpenInternet
            } else {
                NatType::FullConeNat
            };
            return Ok(Classification::new(nat_type, Some(mapped)));
        }

        if no_nat {
            return Ok(Classification::new(NatType::SymmetricUdpFirewall, Some(mapped)));
        }

        let Some(secondary) = test1.changed_address else {
            error!(
                %server,
                "malformed test I response: {}",
                ProtocolError::MissingAttribute("CHANGED-ADDRESS")
            );
            return Ok(Classification::new(NatType::Unknown, Some(mapped)));
        };

        debug!(%secondary, "test I against secondary server");
        let Some(secondary_test1) = client
            .binding_request(secondary, ChangeRequest::NONE, timeout)
            .await?
        else {
            error!(%secondary, "secondary STUN server did not answer");
            return Ok(Classification::new(NatType::Unknown, Some(mapped)));
        };

        match secondary_test1.mapped_address {
            Some(secondary_mapped) if secondary_mapped != mapped => {
                debug!(%secondary_mapped, "mapping differs per destination");
                return Ok(Classification::new(NatType::SymmetricNat, Some(mapped)));
            }
            Some(_) => {}
            None => {
                error!(
                    %secondary,
                    "malformed secondary test I response: {}",
                    ProtocolError::MissingAttribute("MAPPED-ADDRESS")
                );
                return Ok(Classification::new(NatType::Unknown, Some(mapped)));
            }
        }

        debug!("test III");
        let test3 = client
            .binding_request(server, ChangeRequest::PORT_ONLY, timeout)
            .await?
            .filter(|reply| from_changed_origin(reply, server, ChangeRequest::PORT_ONLY));
        let nat_type = if test3.is_some() {
            NatType::RestrictedConeNat
        } else {
            NatType::PortRestrictedConeNat
        };
        Ok(Classification::new(nat_type, Some(mapped)))
    }

    /// Binary search for the longest idle period the NAT binding of
    /// `client` survives, in whole seconds
    ///
    /// Each probe refreshes the mapping with a test I, idles, then has a
    /// second socket ask the server to answer to the mapped address.
    async fn discover_binding_lifetime(
        &self,
        client: &StunClient,
        server: SocketAddr,
    ) -> Result<Option<u32>, TransportError> {
        let timeout = self.config.transaction_timeout();
        let probe = StunClient::bind_with_retries(
            self.entry.address(),
            self.config.port_range,
            self.config.bind_retries,
        )
        .await?;

        let mut low = 1;
        let mut high = self.config.max_binding_lifetime_secs;
        let mut longest_alive = None;

        while low <= high {
            let idle = low + (high - low) / 2;

            let Some(mapped) = client
                .binding_request(server, ChangeRequest::NONE, timeout)
                .await?
                .and_then(|response| response.mapped_address)
            else {
                debug!("lost contact with STUN server while refreshing binding");
                break;
            };

            tokio::select! {
                () = self.cancel.cancelled() => {
                    probe.shutdown();
                    return Err(TransportError::Closed);
                }
                () = tokio::time::sleep(Duration::from_secs(u64::from(idle))) => {}
            }

            let alive = client
                .binding_request_with_response_address(&probe, server, mapped, timeout)
                .await?
                .is_some();
            debug!(idle, alive, "binding lifetime probe");

            if alive {
                longest_alive = Some(idle);
                low = idle + 1;
            } else {
                high = idle - 1;
            }
        }

        probe.shutdown();
        Ok(longest_alive)
    }

    async fn set_state(&self, next: DiagnosticsState) {
        let mut state = self.state.write().await;
        debug!(from = %*state, to = %next, "state transition");
        *state = next;
    }

    async fn finish(
        &self,
        preference: AddressPreference,
        state: DiagnosticsState,
    ) -> DiagnosticsState {
        self.entry.set_address_preference(preference);
        self.set_state(state).await;
        info!(preference = preference.value(), "diagnostics {}", state);
        state
    }
}

/// True if a reply to `change` left the server from somewhere other than
/// the address the request went to
///
/// A server that ignores CHANGE-REQUEST answers from `server` itself,
/// which would pass every filter the test is meant to probe. Both the
/// datagram source and any SOURCE-ADDRESS attribute are checked. A
/// change-IP reply is judged on the full endpoint, since a single-host
/// server may serve its alternate address from another port.
fn from_changed_origin(reply: &BindingResponse, server: SocketAddr, change: ChangeRequest) -> bool {
    let same_origin = |origin: SocketAddr| {
        if change.change_ip {
            origin == server
        } else if change.change_port {
            origin.port() == server.port()
        } else {
            false
        }
    };

    let ignored = same_origin(reply.from) || reply.source_address.is_some_and(same_origin);
    if ignored {
        warn!(
            %server,
            "discarding reply: {}",
            ProtocolError::ChangeRequestIgnored { from: reply.from }
        );
    }
    !ignored
}

impl fmt::Debug for AddressDiagnosticsKit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressDiagnosticsKit")
            .field("entry", self.entry.key())
            .field("stun_server", &self.stun_server)
            .field("report", &self.report.get())
            .finish_non_exhaustive()
    }
}
