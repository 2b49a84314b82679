//! RFC 3489 STUN binding discovery
//!
//! [`message`] is the wire codec, [`client`] runs request/response
//! transactions over one UDP socket.

pub mod client;
pub mod message;

pub use client::{BindingResponse, StunClient};
pub use message::{
    ChangeRequest, StunAttribute, StunMessage, StunMessageClass, StunMessageType, TransactionId,
};
