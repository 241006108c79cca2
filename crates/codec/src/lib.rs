//! ## OpenFlow 1.0 wire format
//!
//! [spec]: https://opennetworking.org/wp-content/uploads/2013/04/openflow-spec-v1.0.0.pdf
//!
//! OpenFlow is the protocol a controller speaks to a datapath (switch) over
//! a reliable control connection. Every message starts with a common 8-byte
//! header carrying the protocol version, a message type, the total message
//! length and a transaction id; the body layout depends on the type.
//!
//! This crate implements the closed subset of OpenFlow 1.0 that a learning
//! switch controller needs: decoding of the messages a datapath sends up
//! (echo-request, features-reply, packet-in, flow-removed) and encoding of
//! the messages the controller sends down (echo-reply, features-request,
//! set-config, flow-mod, packet-out). It also carries the flow extractor
//! that turns a raw Ethernet frame into the header-field tuple used to match
//! flows.

pub mod flow;
pub mod message;

use std::str::Utf8Error;

use crate::message::kinds::MessageKind;

/// OpenFlow protocol version 0x01.
pub const VERSION: u8 = 0x01;

/// Size of the common message header.
pub const HEADER_SIZE: usize = 8;

/// Default `miss_send_len` for SET_CONFIG: how many bytes of an unmatched
/// packet the datapath sends to the controller.
pub const DEFAULT_MISS_SEND_LEN: u16 = 128;

/// `buffer_id` value meaning the datapath did not buffer the packet.
pub const NO_BUFFER: u32 = u32::MAX;

/// Queue id value meaning "no queue".
pub const QUEUE_NONE: u32 = u32::MAX;

/// Reserved and virtual port numbers.
///
/// Port numbers above `MAX` are virtual: they name a forwarding behaviour
/// rather than a physical port and can never carry a queue.
pub mod port {
    /// Highest physical port number.
    pub const MAX: u16 = 0xff00;
    /// Send back out the ingress port.
    pub const IN_PORT: u16 = 0xfff8;
    /// Submit to the flow table.
    pub const TABLE: u16 = 0xfff9;
    /// The datapath's built-in L2 bridge.
    pub const NORMAL: u16 = 0xfffa;
    /// All physical ports except ingress and those with flooding disabled.
    pub const FLOOD: u16 = 0xfffb;
    /// All physical ports except ingress.
    pub const ALL: u16 = 0xfffc;
    /// Send to the controller.
    pub const CONTROLLER: u16 = 0xfffd;
    /// The local networking stack of the switch.
    pub const LOCAL: u16 = 0xfffe;
    /// Not a port; drops the packet.
    pub const NONE: u16 = 0xffff;
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    InvalidInput,
    UnsupportedVersion(u8),
    UnknownKind(u8),
    /// The buffer is shorter than the minimum size of its message kind.
    Truncated {
        kind: MessageKind,
        size: usize,
        min: usize,
    },
    /// The port array of a features-reply is not a whole number of records.
    MisalignedPortArray,
    Utf8Error(Utf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

/// The common message header.
///
/// # Test
///
/// ```
/// use lswitch_codec::{Header, message::kinds::MessageKind};
///
/// let buffer = [0x01u8, 0x02, 0x00, 0x0c, 0x00, 0x00, 0x00, 0x2a];
/// let header = Header::decode(&buffer).unwrap();
///
/// assert_eq!(header.kind, MessageKind::EchoRequest);
/// assert_eq!(header.length, 12);
/// assert_eq!(header.xid, 42);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    pub length: u16,
    pub xid: u32,
}

impl Header {
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidInput);
        }

        if bytes[0] != VERSION {
            return Err(Error::UnsupportedVersion(bytes[0]));
        }

        Ok(Self {
            kind: MessageKind::try_from(bytes[1]).map_err(|_| Error::UnknownKind(bytes[1]))?,
            length: u16::from_be_bytes([bytes[2], bytes[3]]),
            xid: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}
