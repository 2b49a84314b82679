//! Scripted in-process STUN server
//!
//! Answers RFC 3489 binding requests on loopback according to a
//! [`ServerBehavior`], so every branch of the NAT classification can be
//! driven deterministically without a real NAT.
//!
//! "Changed IP" replies are sent from a separate socket on another port;
//! clients correlate by transaction ID, so only the fact that the reply
//! comes from elsewhere matters.
//!
//! # Example
//!
//! ```no_run
//! use netscout_integration_tests::fixtures::{ScriptedStunServer, ServerBehavior};
//!
//! # async fn run() {
//! let server = ScriptedStunServer::spawn(ServerBehavior::open_internet()).await;
//! println!("STUN server on {}", server.addr());
//! # }
//! ```

use netscout_discovery::stun::{StunAttribute, StunMessage, StunMessageClass};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// What the server reports as MAPPED-ADDRESS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// The request's source address (no NAT)
    Echo,
    /// A fixed public address (NAT in front of the client)
    Fixed(SocketAddr),
}

/// How the scripted server answers
#[derive(Debug, Clone, Copy)]
pub struct ServerBehavior {
    /// MAPPED-ADDRESS policy
    pub mapping: Mapping,
    /// Answer test I at all
    pub respond: bool,
    /// Answer requests with change-IP set (test II)
    pub answer_change_ip: bool,
    /// Answer requests with only change-port set (test III)
    pub answer_change_port: bool,
    /// Leave MAPPED-ADDRESS out of responses
    pub omit_mapped_address: bool,
    /// Reply with a Binding Error Response instead
    pub error_response: bool,
    /// CHANGED-ADDRESS to advertise
    pub changed_address: Option<SocketAddr>,
    /// Answer every request from the primary socket, whatever its
    /// CHANGE-REQUEST asks for
    pub ignore_change_request: bool,
}

impl ServerBehavior {
    /// Never answers
    pub fn silent() -> Self {
        Self {
            mapping: Mapping::Echo,
            respond: false,
            answer_change_ip: false,
            answer_change_port: false,
            omit_mapped_address: false,
            error_response: false,
            changed_address: None,
            ignore_change_request: false,
        }
    }

    /// No NAT, no filtering
    pub fn open_internet() -> Self {
        Self {
            respond: true,
            answer_change_ip: true,
            answer_change_port: true,
            ..Self::silent()
        }
    }

    /// No NAT, but replies from other addresses are dropped
    pub fn symmetric_firewall() -> Self {
        Self {
            respond: true,
            ..Self::silent()
        }
    }

    /// NAT mapping every client to `public`; filtering decided by flags
    pub fn nat(public: SocketAddr) -> Self {
        Self {
            mapping: Mapping::Fixed(public),
            respond: true,
            ..Self::silent()
        }
    }

    /// Answers everything from its primary address, like a server that
    /// only speaks RFC 5389
    pub fn ignoring_change_request(mapping: Mapping) -> Self {
        Self {
            mapping,
            respond: true,
            ignore_change_request: true,
            ..Self::silent()
        }
    }

    /// Advertise `secondary` as CHANGED-ADDRESS
    pub fn with_changed_address(mut self, secondary: SocketAddr) -> Self {
        self.changed_address = Some(secondary);
        self
    }
}

/// A running scripted server
pub struct ScriptedStunServer {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl ScriptedStunServer {
    /// Bind on loopback and start answering
    pub async fn spawn(behavior: ServerBehavior) -> Self {
        let primary = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let alternate_ip = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let alternate_port = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = primary.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));

        let counter = requests.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, from)) = primary.recv_from(&mut buf).await {
                let Ok(request) = StunMessage::decode(&buf[..len]) else {
                    continue;
                };
                if request.message_class != StunMessageClass::Request {
                    continue;
                }
                counter.fetch_add(1, Ordering::SeqCst);

                if !behavior.respond {
                    continue;
                }

                let change = request.change_request();
                let reply_socket = if behavior.ignore_change_request {
                    &primary
                } else if change.change_ip {
                    if !behavior.answer_change_ip {
                        continue;
                    }
                    &alternate_ip
                } else if change.change_port {
                    if !behavior.answer_change_port {
                        continue;
                    }
                    &alternate_port
                } else {
                    &primary
                };

                let response = if behavior.error_response {
                    StunMessage::binding_error(request.transaction_id, 400, "Bad Request")
                } else {
                    let mut attributes = Vec::new();
                    if !behavior.omit_mapped_address {
                        let mapped = match behavior.mapping {
                            Mapping::Echo => from,
                            Mapping::Fixed(public) => public,
                        };
                        attributes.push(StunAttribute::MappedAddress(mapped));
                    }
                    if let Ok(source) = reply_socket.local_addr() {
                        attributes.push(StunAttribute::SourceAddress(source));
                    }
                    if let Some(changed) = behavior.changed_address {
                        attributes.push(StunAttribute::ChangedAddress(changed));
                    }
                    StunMessage::binding_response(request.transaction_id, attributes)
                };

                let target = request.response_address().unwrap_or(from);
                let _ = reply_socket.send_to(&response.encode(), target).await;
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    /// Primary server address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Binding requests received so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for ScriptedStunServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
