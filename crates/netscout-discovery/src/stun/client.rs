//! STUN transaction client
//!
//! One bound UDP socket, one receive task. Each outstanding binding
//! request registers a one-shot slot keyed by its transaction ID; the
//! receive task decodes incoming datagrams and completes the matching
//! slot. Callers wait on their slot with a timeout, so a response that
//! races the wait is never lost.

use super::message::{
    ChangeRequest, MAX_MESSAGE_SIZE, StunAttribute, StunMessage, StunMessageClass, TransactionId,
};
use crate::error::{ProtocolError, TransportError};
use dashmap::DashMap;
use rand::Rng;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type PendingMap = DashMap<TransactionId, oneshot::Sender<(StunMessage, SocketAddr)>>;

/// Successful Binding Response, reduced to what discovery needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingResponse {
    /// MAPPED-ADDRESS (or XOR-MAPPED-ADDRESS); `None` means the server
    /// answered without it
    pub mapped_address: Option<SocketAddr>,
    /// CHANGED-ADDRESS (or OTHER-ADDRESS)
    pub changed_address: Option<SocketAddr>,
    /// SOURCE-ADDRESS
    pub source_address: Option<SocketAddr>,
    /// Datagram source as seen by our socket
    pub from: SocketAddr,
}

impl BindingResponse {
    fn from_message(message: &StunMessage, from: SocketAddr) -> Option<Self> {
        match message.message_class {
            StunMessageClass::SuccessResponse => Some(Self {
                mapped_address: message.mapped_address(),
                changed_address: message.changed_address(),
                source_address: message.source_address(),
                from,
            }),
            StunMessageClass::ErrorResponse => {
                let (code, reason) = message.error_code().unwrap_or((0, ""));
                let error = ProtocolError::ErrorResponse {
                    code,
                    reason: reason.to_string(),
                };
                warn!(%from, "{}", error);
                None
            }
            StunMessageClass::Request | StunMessageClass::Indication => None,
        }
    }
}

/// STUN client bound to one local UDP socket
pub struct StunClient {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    pending: Arc<PendingMap>,
    receive_failure: Arc<OnceLock<io::Error>>,
    shutdown: CancellationToken,
}

impl StunClient {
    /// Bind to `local` and start the receive task
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the socket cannot be bound.
    pub async fn bind(local: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransportError::Bind { addr: local, source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| TransportError::Bind { addr: local, source })?;

        let socket = Arc::new(socket);
        let pending = Arc::new(PendingMap::new());
        let receive_failure = Arc::new(OnceLock::new());
        let shutdown = CancellationToken::new();

        spawn_receiver(
            socket.clone(),
            pending.clone(),
            receive_failure.clone(),
            shutdown.clone(),
        );
        debug!(%local_addr, "STUN client bound");

        Ok(Self {
            socket: Mutex::new(Some(socket)),
            local_addr,
            pending,
            receive_failure,
            shutdown,
        })
    }

    /// Bind on `ip` using a random port from `port_range`, retrying with a
    /// fresh port up to `retries` times
    ///
    /// # Errors
    ///
    /// Returns the last [`TransportError`] once the budget is spent, or
    /// immediately for a failure a new port cannot fix.
    pub async fn bind_with_retries(
        ip: IpAddr,
        port_range: (u16, u16),
        retries: u32,
    ) -> Result<Self, TransportError> {
        let (low, high) = port_range;
        if low > high {
            return Err(TransportError::Bind {
                addr: SocketAddr::new(ip, 0),
                source: io::Error::new(io::ErrorKind::InvalidInput, "inverted port range"),
            });
        }
        let mut last_error = None;

        for attempt in 1..=retries {
            let port = rand::thread_rng().gen_range(low..=high);
            let addr = SocketAddr::new(ip, port);

            match Self::bind(addr).await {
                Ok(client) => return Ok(client),
                Err(e) if e.is_transient() => {
                    debug!(%addr, attempt, "bind failed, retrying: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::Bind {
            addr: SocketAddr::new(ip, 0),
            source: io::Error::new(io::ErrorKind::InvalidInput, "bind retry budget is zero"),
        }))
    }

    /// Local socket address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True once [`shutdown`](Self::shutdown) ran
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Send a Binding Request to `server` and wait for the matching response
    ///
    /// Returns `Ok(None)` on timeout, on an error response and when the
    /// server's answer could not be decoded.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Send`] if the datagram cannot be sent,
    /// [`TransportError::Receive`] once the socket stopped delivering
    /// datagrams, and [`TransportError::Closed`] if the client is or gets
    /// shut down.
    pub async fn binding_request(
        &self,
        server: SocketAddr,
        change: ChangeRequest,
        timeout: Duration,
    ) -> Result<Option<BindingResponse>, TransportError> {
        let request = StunMessage::binding_request(change);
        let socket = self.socket()?;
        self.transact(&socket, server, request, timeout).await
    }

    /// Have `via` send a Binding Request whose RESPONSE-ADDRESS is
    /// `response_address`, and wait for the response on this client
    ///
    /// Used to test whether a NAT binding of this client is still alive:
    /// the request leaves from a different socket, so the response only
    /// arrives if the mapping `response_address` still routes here.
    ///
    /// # Errors
    ///
    /// Same as [`binding_request`](Self::binding_request), for either client.
    pub async fn binding_request_with_response_address(
        &self,
        via: &StunClient,
        server: SocketAddr,
        response_address: SocketAddr,
        timeout: Duration,
    ) -> Result<Option<BindingResponse>, TransportError> {
        let mut request = StunMessage::binding_request(ChangeRequest::NONE);
        request.add_attribute(StunAttribute::ResponseAddress(response_address));
        // The response comes back to this client, so the wait is ours
        self.socket()?;
        let socket = via.socket()?;
        self.transact(&socket, server, request, timeout).await
    }

    /// Abort in-flight waits and release the socket. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.pending.clear();
        debug!(local_addr = %self.local_addr, "STUN client shut down");
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::Closed)
    }

    /// The error that stopped the receive task, if any
    fn receive_error(&self) -> Option<TransportError> {
        self.receive_failure
            .get()
            .map(|e| TransportError::Receive(io::Error::new(e.kind(), e.to_string())))
    }

    async fn transact(
        &self,
        socket: &UdpSocket,
        server: SocketAddr,
        request: StunMessage,
        timeout: Duration,
    ) -> Result<Option<BindingResponse>, TransportError> {
        let transaction_id = request.transaction_id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(transaction_id, tx);

        // The receive task clears the map after recording its failure, so
        // a slot inserted past that point is caught here
        if let Some(e) = self.receive_error() {
            self.pending.remove(&transaction_id);
            return Err(e);
        }

        trace!(%server, ?transaction_id, "sending binding request");
        if let Err(source) = socket.send_to(&request.encode(), server).await {
            self.pending.remove(&transaction_id);
            return Err(TransportError::Send { dest: server, source });
        }

        let outcome = tokio::select! {
            () = self.shutdown.cancelled() => None,
            result = tokio::time::timeout(timeout, rx) => Some(result),
        };
        self.pending.remove(&transaction_id);

        match outcome {
            None => Err(TransportError::Closed),
            Some(Ok(Err(_))) => Err(self.receive_error().unwrap_or(TransportError::Closed)),
            Some(Err(_elapsed)) => {
                debug!(%server, "binding request timed out after {:?}", timeout);
                Ok(None)
            }
            Some(Ok(Ok((message, from)))) => Ok(BindingResponse::from_message(&message, from)),
        }
    }
}

impl Drop for StunClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for StunClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StunClient")
            .field("local_addr", &self.local_addr)
            .field("pending", &self.pending.len())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

/// ICMP port/host unreachable from an earlier send, reported on the next
/// receive by some platforms; the socket itself is fine
fn is_ignorable_receive_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Record why the receive task stopped and wake every waiter
fn fail_pending(failure: &OnceLock<io::Error>, pending: &PendingMap, error: io::Error) {
    let _ = failure.set(error);
    pending.clear();
}

/// Spawn the receive task that routes responses to waiting transactions
fn spawn_receiver(
    socket: Arc<UdpSocket>,
    pending: Arc<PendingMap>,
    failure: Arc<OnceLock<io::Error>>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

        loop {
            let (len, from) = tokio::select! {
                () = shutdown.cancelled() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) if is_ignorable_receive_error(&e) => {
                        debug!("receive error, continuing: {}", e);
                        continue;
                    }
                    Err(e) => {
                        warn!("STUN receive task stopped: {}", e);
                        fail_pending(&failure, &pending, e);
                        break;
                    }
                },
            };

            let message = match StunMessage::decode(&buf[..len]) {
                Ok(message) => message,
                Err(e) => {
                    debug!(%from, "dropping malformed datagram: {}", e);
                    continue;
                }
            };

            if matches!(
                message.message_class,
                StunMessageClass::Request | StunMessageClass::Indication
            ) {
                trace!(%from, "ignoring non-response STUN message");
                continue;
            }

            match pending.remove(&message.transaction_id) {
                Some((_, waiter)) => {
                    let _ = waiter.send((message, from));
                }
                None => trace!(%from, "response for unknown transaction"),
            }
        }
    });
}
