//! STUN message codec (RFC 3489 §11)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      STUN Message Type        |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Transaction ID (128 bits)
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Attributes follow as type/length/value triples. RFC 3489 attribute
//! values are multiples of four bytes; values from RFC 5389 servers
//! (SOFTWARE, for example) are padded to four bytes on the wire.

use crate::error::ProtocolError;
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::warn;

/// RFC 5389 magic cookie, used as the first 32 bits of our transaction IDs
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Largest datagram we expect from a STUN server
pub const MAX_MESSAGE_SIZE: usize = 2048;

/// Longest SOFTWARE value or ERROR-CODE reason phrase we put on the wire
/// (RFC 5389 §15.6 and §15.10)
pub const MAX_TEXT_VALUE: usize = 763;

/// Largest attribute section that fits the 16-bit length field while
/// staying four-byte aligned
const MAX_BODY_SIZE: usize = u16::MAX as usize & !0x3;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_RESPONSE_ADDRESS: u16 = 0x0002;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_SOURCE_ADDRESS: u16 = 0x0004;
const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_REFLECTED_FROM: u16 = 0x000B;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_XOR_MAPPED_ADDRESS_LEGACY: u16 = 0x8020;
const ATTR_SOFTWARE: u16 = 0x8022;
const ATTR_OTHER_ADDRESS: u16 = 0x802C;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

const CHANGE_IP_FLAG: u32 = 0x04;
const CHANGE_PORT_FLAG: u32 = 0x02;

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
    /// Indication (no response expected)
    Indication,
}

/// STUN message type
///
/// RFC 3489 only defines the Binding and Shared Secret methods; we speak
/// Binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    /// Binding request/response
    Binding,
}

impl StunMessageType {
    /// Encode method and class into the 16-bit type field
    ///
    /// The class bits sit at positions 4 and 8, which yields the RFC 3489
    /// constants 0x0001 (request), 0x0101 (response) and 0x0111 (error).
    fn encode(self, class: StunMessageClass) -> u16 {
        let method: u16 = match self {
            Self::Binding => 0x0001,
        };

        let class_bits: u16 = match class {
            StunMessageClass::Request => 0b00,
            StunMessageClass::Indication => 0b01,
            StunMessageClass::SuccessResponse => 0b10,
            StunMessageClass::ErrorResponse => 0b11,
        };

        let m0_m3 = method & 0x0F;
        let c0 = (class_bits & 0x01) << 4;
        let m4_m6 = (method & 0x70) << 1;
        let c1 = (class_bits & 0x02) << 7;
        let m7_m11 = (method & 0xF80) << 2;

        m0_m3 | c0 | m4_m6 | c1 | m7_m11
    }

    fn decode(raw: u16) -> Result<(Self, StunMessageClass), ProtocolError> {
        if raw & 0xC000 != 0 {
            return Err(ProtocolError::UnknownMessageType(raw));
        }

        let c0 = (raw >> 4) & 0x01;
        let c1 = (raw >> 8) & 0x01;
        let class = match c0 | (c1 << 1) {
            0b00 => StunMessageClass::Request,
            0b01 => StunMessageClass::Indication,
            0b10 => StunMessageClass::SuccessResponse,
            _ => StunMessageClass::ErrorResponse,
        };

        let method = (raw & 0x0F) | ((raw >> 1) & 0x70) | ((raw >> 2) & 0xF80);
        match method {
            0x0001 => Ok((Self::Binding, class)),
            _ => Err(ProtocolError::UnknownMessageType(raw)),
        }
    }
}

/// 128-bit transaction ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 16]);

impl TransactionId {
    /// Fresh random ID
    ///
    /// The first four bytes carry the magic cookie so RFC 5389 servers
    /// recognise the request and add XOR-MAPPED-ADDRESS; the remaining 96
    /// bits are random.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut bytes[4..]);
        Self(bytes)
    }

    /// Wrap raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    fn has_magic_cookie(&self) -> bool {
        self.0[..4] == MAGIC_COOKIE.to_be_bytes()
    }
}

/// CHANGE-REQUEST flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeRequest {
    /// Ask the server to answer from its alternate IP
    pub change_ip: bool,
    /// Ask the server to answer from its alternate port
    pub change_port: bool,
}

impl ChangeRequest {
    /// Test I: answer from the address we sent to
    pub const NONE: Self = Self {
        change_ip: false,
        change_port: false,
    };

    /// Test II: answer from the alternate IP and port
    pub const IP_AND_PORT: Self = Self {
        change_ip: true,
        change_port: true,
    };

    /// Test III: answer from the alternate port only
    pub const PORT_ONLY: Self = Self {
        change_ip: false,
        change_port: true,
    };

    fn to_flags(self) -> u32 {
        let mut flags = 0;
        if self.change_ip {
            flags |= CHANGE_IP_FLAG;
        }
        if self.change_port {
            flags |= CHANGE_PORT_FLAG;
        }
        flags
    }

    fn from_flags(flags: u32) -> Self {
        Self {
            change_ip: flags & CHANGE_IP_FLAG != 0,
            change_port: flags & CHANGE_PORT_FLAG != 0,
        }
    }
}

/// STUN attributes understood by this client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// MAPPED-ADDRESS (0x0001): request source as seen by the server
    MappedAddress(SocketAddr),
    /// RESPONSE-ADDRESS (0x0002): where the server should send its reply
    ResponseAddress(SocketAddr),
    /// CHANGE-REQUEST (0x0003)
    ChangeRequest(ChangeRequest),
    /// SOURCE-ADDRESS (0x0004): address the reply was sent from
    SourceAddress(SocketAddr),
    /// CHANGED-ADDRESS (0x0005): the server's alternate address
    ChangedAddress(SocketAddr),
    /// ERROR-CODE (0x0009)
    ErrorCode {
        /// Class * 100 + number
        code: u16,
        /// Reason phrase
        reason: String,
    },
    /// REFLECTED-FROM (0x000B)
    ReflectedFrom(SocketAddr),
    /// XOR-MAPPED-ADDRESS (0x0020, or legacy 0x8020)
    XorMappedAddress(SocketAddr),
    /// SOFTWARE (0x8022)
    Software(String),
    /// OTHER-ADDRESS (0x802C), RFC 5780 name for CHANGED-ADDRESS
    OtherAddress(SocketAddr),
    /// Anything else, kept opaque
    Unknown(u16, Vec<u8>),
}

impl StunAttribute {
    fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            Self::ResponseAddress(_) => ATTR_RESPONSE_ADDRESS,
            Self::ChangeRequest(_) => ATTR_CHANGE_REQUEST,
            Self::SourceAddress(_) => ATTR_SOURCE_ADDRESS,
            Self::ChangedAddress(_) => ATTR_CHANGED_ADDRESS,
            Self::ErrorCode { .. } => ATTR_ERROR_CODE,
            Self::ReflectedFrom(_) => ATTR_REFLECTED_FROM,
            Self::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Self::Software(_) => ATTR_SOFTWARE,
            Self::OtherAddress(_) => ATTR_OTHER_ADDRESS,
            Self::Unknown(t, _) => *t,
        }
    }

    fn encode(&self, transaction_id: &TransactionId, out: &mut Vec<u8>) {
        let mut value = self.encode_value(transaction_id);
        let len = u16::try_from(value.len()).unwrap_or(u16::MAX);
        value.truncate(usize::from(len));

        out.extend_from_slice(&self.attr_type().to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&value);

        let padding = (4 - (value.len() % 4)) % 4;
        out.extend(std::iter::repeat_n(0, padding));
    }

    fn encode_value(&self, transaction_id: &TransactionId) -> Vec<u8> {
        match self {
            Self::MappedAddress(addr)
            | Self::ResponseAddress(addr)
            | Self::SourceAddress(addr)
            | Self::ChangedAddress(addr)
            | Self::ReflectedFrom(addr)
            | Self::OtherAddress(addr) => encode_address(*addr),
            Self::XorMappedAddress(addr) => {
                encode_address(xor_address(*addr, transaction_id))
            }
            Self::ChangeRequest(change) => change.to_flags().to_be_bytes().to_vec(),
            Self::ErrorCode { code, reason } => {
                let mut value = vec![0, 0, (code / 100) as u8 & 0x07, (code % 100) as u8];
                value.extend_from_slice(truncate_text(reason).as_bytes());
                value
            }
            Self::Software(s) => truncate_text(s).as_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        }
    }

    fn decode(
        attr_type: u16,
        value: &[u8],
        transaction_id: &TransactionId,
    ) -> Result<Self, ProtocolError> {
        let attr = match attr_type {
            ATTR_MAPPED_ADDRESS => Self::MappedAddress(decode_address(attr_type, value)?),
            ATTR_RESPONSE_ADDRESS => Self::ResponseAddress(decode_address(attr_type, value)?),
            ATTR_SOURCE_ADDRESS => Self::SourceAddress(decode_address(attr_type, value)?),
            ATTR_CHANGED_ADDRESS => Self::ChangedAddress(decode_address(attr_type, value)?),
            ATTR_REFLECTED_FROM => Self::ReflectedFrom(decode_address(attr_type, value)?),
            ATTR_OTHER_ADDRESS => Self::OtherAddress(decode_address(attr_type, value)?),
            ATTR_XOR_MAPPED_ADDRESS | ATTR_XOR_MAPPED_ADDRESS_LEGACY => {
                let raw = decode_address(attr_type, value)?;
                Self::XorMappedAddress(xor_address(raw, transaction_id))
            }
            ATTR_CHANGE_REQUEST => {
                let bytes: [u8; 4] = value
                    .try_into()
                    .map_err(|_| ProtocolError::InvalidAttribute(attr_type))?;
                Self::ChangeRequest(ChangeRequest::from_flags(u32::from_be_bytes(bytes)))
            }
            ATTR_ERROR_CODE => {
                if value.len() < 4 {
                    return Err(ProtocolError::InvalidAttribute(attr_type));
                }
                let code = u16::from(value[2] & 0x07) * 100 + u16::from(value[3]);
                let reason = String::from_utf8_lossy(&value[4..])
                    .trim_end_matches('\0')
                    .to_string();
                Self::ErrorCode { code, reason }
            }
            ATTR_SOFTWARE => Self::Software(String::from_utf8_lossy(value).to_string()),
            _ => Self::Unknown(attr_type, value.to_vec()),
        };
        Ok(attr)
    }
}

/// Cut `text` to at most [`MAX_TEXT_VALUE`] bytes on a char boundary
fn truncate_text(text: &str) -> &str {
    if text.len() <= MAX_TEXT_VALUE {
        return text;
    }
    let mut end = MAX_TEXT_VALUE;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn encode_address(addr: SocketAddr) -> Vec<u8> {
    let mut value = Vec::with_capacity(20);
    value.push(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(FAMILY_IPV4);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            value.push(FAMILY_IPV6);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
    }
    value
}

fn decode_address(attr_type: u16, value: &[u8]) -> Result<SocketAddr, ProtocolError> {
    if value.len() < 8 {
        return Err(ProtocolError::InvalidAttribute(attr_type));
    }

    let port = u16::from_be_bytes([value[2], value[3]]);
    match value[1] {
        FAMILY_IPV4 => {
            let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
            Ok(SocketAddr::new(ip.into(), port))
        }
        FAMILY_IPV6 => {
            let octets: [u8; 16] = value
                .get(4..20)
                .and_then(|s| s.try_into().ok())
                .ok_or(ProtocolError::InvalidAttribute(attr_type))?;
            Ok(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        family => Err(ProtocolError::UnsupportedFamily(family)),
    }
}

/// XOR an address with the magic cookie (and transaction ID for IPv6).
/// The operation is its own inverse.
fn xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> SocketAddr {
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(ip) => {
            let xored = u32::from(ip) ^ MAGIC_COOKIE;
            SocketAddr::new(Ipv4Addr::from(xored).into(), port)
        }
        IpAddr::V6(ip) => {
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            key[4..].copy_from_slice(&transaction_id.as_bytes()[4..]);
            let mut octets = ip.octets();
            for (byte, k) in octets.iter_mut().zip(key) {
                *byte ^= k;
            }
            SocketAddr::new(Ipv6Addr::from(octets).into(), port)
        }
    }
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message type
    pub message_type: StunMessageType,
    /// Message class
    pub message_class: StunMessageClass,
    /// Transaction ID
    pub transaction_id: TransactionId,
    /// Attributes in wire order
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Binding Request carrying `change` as its CHANGE-REQUEST
    #[must_use]
    pub fn binding_request(change: ChangeRequest) -> Self {
        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::Request,
            transaction_id: TransactionId::random(),
            attributes: vec![StunAttribute::ChangeRequest(change)],
        }
    }

    /// Binding Response to `transaction_id`
    #[must_use]
    pub fn binding_response(transaction_id: TransactionId, attributes: Vec<StunAttribute>) -> Self {
        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::SuccessResponse,
            transaction_id,
            attributes,
        }
    }

    /// Binding Error Response to `transaction_id`
    #[must_use]
    pub fn binding_error(transaction_id: TransactionId, code: u16, reason: &str) -> Self {
        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::ErrorResponse,
            transaction_id,
            attributes: vec![StunAttribute::ErrorCode {
                code,
                reason: reason.to_string(),
            }],
        }
    }

    /// Add an attribute to the message
    pub fn add_attribute(&mut self, attr: StunAttribute) {
        self.attributes.push(attr);
    }

    /// Encode message to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + 32);

        let msg_type = self.message_type.encode(self.message_class);
        bytes.extend_from_slice(&msg_type.to_be_bytes());

        // Length placeholder, patched once the attributes are written
        bytes.extend_from_slice(&[0u8; 2]);
        bytes.extend_from_slice(self.transaction_id.as_bytes());

        for (index, attr) in self.attributes.iter().enumerate() {
            let start = bytes.len();
            attr.encode(&self.transaction_id, &mut bytes);
            if bytes.len() - HEADER_SIZE > MAX_BODY_SIZE {
                bytes.truncate(start);
                warn!(
                    dropped = self.attributes.len() - index,
                    "STUN attributes exceed the 16-bit length field, dropping the rest"
                );
                break;
            }
        }

        let msg_length = u16::try_from(bytes.len() - HEADER_SIZE).unwrap_or(u16::MAX);
        bytes[2..4].copy_from_slice(&msg_length.to_be_bytes());

        bytes
    }

    /// Decode message from bytes
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` for truncated headers, length mismatches,
    /// non-binding message types and malformed attributes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::MessageTooShort(bytes.len()));
        }

        let raw_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let msg_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let (message_type, message_class) = StunMessageType::decode(raw_type)?;

        let body = &bytes[HEADER_SIZE..];
        if body.len() < msg_length {
            return Err(ProtocolError::LengthMismatch {
                declared: msg_length,
                actual: body.len(),
            });
        }
        let body = &body[..msg_length];

        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[4..HEADER_SIZE]);
        let transaction_id = TransactionId(id);

        let mut attributes = Vec::new();
        let mut offset = 0;
        while offset + 4 <= body.len() {
            let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
            let attr_length = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
            offset += 4;

            let value = body
                .get(offset..offset + attr_length)
                .ok_or(ProtocolError::InvalidAttribute(attr_type))?;
            attributes.push(StunAttribute::decode(attr_type, value, &transaction_id)?);

            let padding = (4 - (attr_length % 4)) % 4;
            offset = (offset + attr_length + padding).min(body.len());
        }

        Ok(Self {
            message_type,
            message_class,
            transaction_id,
            attributes,
        })
    }

    /// Server-observed source address
    ///
    /// MAPPED-ADDRESS if present, otherwise XOR-MAPPED-ADDRESS when the
    /// transaction ID carries the magic cookie.
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.find(|attr| match attr {
            StunAttribute::MappedAddress(addr) => Some(*addr),
            _ => None,
        })
        .or_else(|| {
            if !self.transaction_id.has_magic_cookie() {
                return None;
            }
            self.find(|attr| match attr {
                StunAttribute::XorMappedAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    /// Server's alternate address: CHANGED-ADDRESS, else OTHER-ADDRESS
    #[must_use]
    pub fn changed_address(&self) -> Option<SocketAddr> {
        self.find(|attr| match attr {
            StunAttribute::ChangedAddress(addr) => Some(*addr),
            _ => None,
        })
        .or_else(|| {
            self.find(|attr| match attr {
                StunAttribute::OtherAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    /// Address the server sent the response from
    #[must_use]
    pub fn source_address(&self) -> Option<SocketAddr> {
        self.find(|attr| match attr {
            StunAttribute::SourceAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// RESPONSE-ADDRESS, if the request asked for a redirected reply
    #[must_use]
    pub fn response_address(&self) -> Option<SocketAddr> {
        self.find(|attr| match attr {
            StunAttribute::ResponseAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// CHANGE-REQUEST flags, [`ChangeRequest::NONE`] when absent
    #[must_use]
    pub fn change_request(&self) -> ChangeRequest {
        self.find(|attr| match attr {
            StunAttribute::ChangeRequest(change) => Some(*change),
            _ => None,
        })
        .unwrap_or_default()
    }

    /// ERROR-CODE of an error response
    #[must_use]
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    fn find<T>(&self, f: impl Fn(&StunAttribute) -> Option<T>) -> Option<T> {
        self.attributes.iter().find_map(f)
    }
}
