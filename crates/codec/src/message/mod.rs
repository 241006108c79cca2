pub mod kinds;

use crate::{
    Error, HEADER_SIZE, Header, NO_BUFFER, VERSION,
    flow::FlowKey,
    message::kinds::{MessageKind, PacketInReason},
};

use bytes::{BufMut, Bytes, BytesMut};

/// Fixed sizes of the decoded message bodies, computed from the declared
/// wire layout (never from a host record).
mod size {
    use crate::HEADER_SIZE;

    /// datapath_id 8 + n_buffers 4 + n_tables 1 + pad 3 + capabilities 4 +
    /// actions 4.
    pub const FEATURES_REPLY: usize = HEADER_SIZE + 24;

    /// Each port record: port_no 2 + hw_addr 6 + name 16 + config 4 +
    /// state 4 + curr 4 + advertised 4 + supported 4 + peer 4.
    pub const PHY_PORT: usize = 48;

    /// buffer_id 4 + total_len 2 + in_port 2 + reason 1 + pad 1, then the
    /// packet bytes.
    pub const PACKET_IN: usize = HEADER_SIZE + 10;

    /// match 40 + cookie 8 + priority 2 + reason 1 + pad 1 + duration 8 +
    /// idle_timeout 2 + pad 2 + packet_count 8 + byte_count 8.
    pub const FLOW_REMOVED: usize = HEADER_SIZE + 80;

    /// match 40 + cookie 8 + command 2 + idle_timeout 2 + hard_timeout 2 +
    /// priority 2 + buffer_id 4 + out_port 2 + flags 2.
    pub const FLOW_MOD: usize = HEADER_SIZE + 64;

    /// buffer_id 4 + in_port 2 + actions_len 2.
    pub const PACKET_OUT: usize = HEADER_SIZE + 8;

    /// flags 2 + miss_send_len 2.
    pub const SWITCH_CONFIG: usize = HEADER_SIZE + 4;
}

/// An inbound message, decoded into the variant the controller dispatches
/// on. Each variant guarantees the minimum length of its kind; `Other`
/// carries any well-formed message outside the handled subset.
#[derive(Debug)]
pub enum Message<'a> {
    EchoRequest { header: Header, payload: &'a [u8] },
    FeaturesReply(FeaturesReply<'a>),
    PacketIn(PacketIn<'a>),
    FlowRemoved { header: Header },
    Other { header: Header },
}

impl<'a> Message<'a> {
    /// Decode one complete message.
    ///
    /// # Test
    ///
    /// ```
    /// use lswitch_codec::message::{Message, kinds::MessageKind};
    ///
    /// let buffer = [0x01u8, 0x02, 0x00, 0x0b, 0x00, 0x00, 0x00, 0x07, 0xaa, 0xbb, 0xcc];
    ///
    /// match Message::decode(&buffer).unwrap() {
    ///     Message::EchoRequest { header, payload } => {
    ///         assert_eq!(header.xid, 7);
    ///         assert_eq!(payload, &[0xaa, 0xbb, 0xcc]);
    ///     }
    ///     _ => panic!("expected echo request"),
    /// }
    ///
    /// // A barrier reply is well formed but outside the handled subset.
    /// let buffer = [0x01u8, 0x13, 0x00, 0x08, 0x00, 0x00, 0x00, 0x01];
    /// assert!(matches!(
    ///     Message::decode(&buffer).unwrap(),
    ///     Message::Other { header } if header.kind == MessageKind::BarrierReply
    /// ));
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        let header = Header::decode(bytes)?;
        let size = bytes.len();

        let check = |min: usize| {
            if size < min {
                Err(Error::Truncated {
                    kind: header.kind,
                    size,
                    min,
                })
            } else {
                Ok(())
            }
        };

        Ok(match header.kind {
            MessageKind::EchoRequest => Self::EchoRequest {
                header,
                payload: &bytes[HEADER_SIZE..],
            },
            MessageKind::FeaturesReply => {
                check(size::FEATURES_REPLY)?;

                // The port list must be a whole number of records.
                if (size - size::FEATURES_REPLY) % size::PHY_PORT != 0 {
                    return Err(Error::MisalignedPortArray);
                }

                Self::FeaturesReply(FeaturesReply { header, bytes })
            }
            MessageKind::PacketIn => {
                check(size::PACKET_IN)?;
                Self::PacketIn(PacketIn { header, bytes })
            }
            MessageKind::FlowRemoved => {
                check(size::FLOW_REMOVED)?;
                Self::FlowRemoved { header }
            }
            _ => Self::Other { header },
        })
    }
}

/// The features-reply body: the datapath id and the physical port list.
#[derive(Debug)]
pub struct FeaturesReply<'a> {
    header: Header,
    bytes: &'a [u8],
}

impl<'a> FeaturesReply<'a> {
    pub fn header(&self) -> Header {
        self.header
    }

    pub fn datapath_id(&self) -> u64 {
        u64::from_be_bytes(self.bytes[8..16].try_into().unwrap_or_default())
    }

    /// The physical ports announced by the datapath.
    pub fn ports(&self) -> impl Iterator<Item = PhyPort<'a>> {
        self.bytes[size::FEATURES_REPLY..]
            .chunks_exact(size::PHY_PORT)
            .map(PhyPort)
    }
}

/// One physical port record of a features-reply.
#[derive(Debug)]
pub struct PhyPort<'a>(&'a [u8]);

impl<'a> PhyPort<'a> {
    pub fn port_no(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }

    /// The interface name, NUL-trimmed. `None` when not valid UTF-8.
    pub fn name(&self) -> Option<&'a str> {
        let name = &self.0[8..24];
        let end = name.iter().position(|b| *b == 0).unwrap_or(name.len());

        std::str::from_utf8(&name[..end]).ok()
    }
}

/// The packet-in body: an escalated packet plus where and why it arrived.
#[derive(Debug)]
pub struct PacketIn<'a> {
    header: Header,
    bytes: &'a [u8],
}

impl<'a> PacketIn<'a> {
    pub fn header(&self) -> Header {
        self.header
    }

    /// Datapath buffer holding the packet, or [`NO_BUFFER`].
    pub fn buffer_id(&self) -> u32 {
        u32::from_be_bytes(self.bytes[8..12].try_into().unwrap_or_default())
    }

    /// Full length of the escalated packet; `data` may be a truncated
    /// prefix when the packet is buffered on the datapath.
    pub fn total_len(&self) -> u16 {
        u16::from_be_bytes([self.bytes[12], self.bytes[13]])
    }

    pub fn in_port(&self) -> u16 {
        u16::from_be_bytes([self.bytes[14], self.bytes[15]])
    }

    pub fn reason(&self) -> Option<PacketInReason> {
        PacketInReason::try_from(self.bytes[16]).ok()
    }

    pub fn data(&self) -> &'a [u8] {
        &self.bytes[size::PACKET_IN..]
    }
}

/// An output action of a flow entry or packet-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Send out a port.
    Output(u16),
    /// Send out a port via a traffic queue.
    Enqueue { port: u16, queue_id: u32 },
}

impl Action {
    pub const fn size(&self) -> usize {
        match self {
            Self::Output(_) => 8,
            Self::Enqueue { .. } => 16,
        }
    }

    pub fn encode(&self, bytes: &mut BytesMut) {
        match *self {
            Self::Output(port) => {
                bytes.put_u16(0);
                bytes.put_u16(8);
                bytes.put_u16(port);
                bytes.put_u16(0);
            }
            Self::Enqueue { port, queue_id } => {
                bytes.put_u16(11);
                bytes.put_u16(16);
                bytes.put_u16(port);
                bytes.put(&[0u8; 6][..]);
                bytes.put_u32(queue_id);
            }
        }
    }
}

fn put_header(bytes: &mut BytesMut, kind: MessageKind, length: usize, xid: u32) {
    bytes.put_u8(VERSION);
    bytes.put_u8(kind as u8);
    bytes.put_u16(length as u16);
    bytes.put_u32(xid);
}

/// Echo the request's xid and payload back.
///
/// # Test
///
/// ```
/// use lswitch_codec::message::{Message, echo_reply};
///
/// let request = [0x01u8, 0x02, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x2a, 0xde, 0xad];
///
/// let reply = match Message::decode(&request).unwrap() {
///     Message::EchoRequest { header, payload } => echo_reply(header.xid, payload),
///     _ => unreachable!(),
/// };
///
/// assert_eq!(
///     &reply[..],
///     &[0x01u8, 0x03, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x2a, 0xde, 0xad]
/// );
/// ```
pub fn echo_reply(xid: u32, payload: &[u8]) -> Bytes {
    let mut bytes = BytesMut::with_capacity(HEADER_SIZE + payload.len());

    put_header(
        &mut bytes,
        MessageKind::EchoReply,
        HEADER_SIZE + payload.len(),
        xid,
    );
    bytes.put(payload);
    bytes.freeze()
}

pub fn features_request(xid: u32) -> Bytes {
    let mut bytes = BytesMut::with_capacity(HEADER_SIZE);

    put_header(&mut bytes, MessageKind::FeaturesRequest, HEADER_SIZE, xid);
    bytes.freeze()
}

/// SET_CONFIG with default flags and the given `miss_send_len`.
pub fn set_config(xid: u32, miss_send_len: u16) -> Bytes {
    let mut bytes = BytesMut::with_capacity(size::SWITCH_CONFIG);

    put_header(&mut bytes, MessageKind::SetConfig, size::SWITCH_CONFIG, xid);
    bytes.put_u16(0);
    bytes.put_u16(miss_send_len);
    bytes.freeze()
}

/// FLOW_MOD adding a flow for `flow` under `wildcards`, expiring after
/// `idle_timeout` seconds of inactivity (0 = permanent), applying `actions`.
/// When `buffer_id` names a datapath buffer the packet is released through
/// the new flow as a side effect.
pub fn flow_mod_add(
    xid: u32,
    flow: &FlowKey,
    wildcards: u32,
    idle_timeout: u16,
    buffer_id: u32,
    actions: &[Action],
) -> Bytes {
    let length = size::FLOW_MOD + actions.iter().map(Action::size).sum::<usize>();
    let mut bytes = BytesMut::with_capacity(length);

    put_header(&mut bytes, MessageKind::FlowMod, length, xid);
    flow.encode_match(wildcards, &mut bytes);
    bytes.put_u64(0);
    bytes.put_u16(0);
    bytes.put_u16(idle_timeout);
    bytes.put_u16(0);
    bytes.put_u16(0x8000);
    bytes.put_u32(buffer_id);
    bytes.put_u16(crate::port::NONE);
    bytes.put_u16(0);

    for action in actions {
        action.encode(&mut bytes);
    }

    bytes.freeze()
}

/// PACKET_OUT applying `actions` to a buffered packet, or to `data` when
/// `buffer_id` is [`NO_BUFFER`].
pub fn packet_out(
    xid: u32,
    buffer_id: u32,
    in_port: u16,
    actions: &[Action],
    data: &[u8],
) -> Bytes {
    let actions_len = actions.iter().map(Action::size).sum::<usize>();
    let data = if buffer_id == NO_BUFFER { data } else { &[] };
    let length = size::PACKET_OUT + actions_len + data.len();

    let mut bytes = BytesMut::with_capacity(length);

    put_header(&mut bytes, MessageKind::PacketOut, length, xid);
    bytes.put_u32(buffer_id);
    bytes.put_u16(in_port);
    bytes.put_u16(actions_len as u16);

    for action in actions {
        action.encode(&mut bytes);
    }

    bytes.put(data);
    bytes.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port;

    fn features_reply_bytes(datapath_id: u64, ports: &[(u16, &str)]) -> Vec<u8> {
        let mut bytes = vec![
            VERSION,
            MessageKind::FeaturesReply as u8,
            0,
            0,
            0,
            0,
            0,
            1,
        ];
        bytes.extend_from_slice(&datapath_id.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 16]);

        for (port_no, name) in ports {
            let mut record = [0u8; 48];
            record[0..2].copy_from_slice(&port_no.to_be_bytes());
            record[8..8 + name.len()].copy_from_slice(name.as_bytes());
            bytes.extend_from_slice(&record);
        }

        let length = (bytes.len() as u16).to_be_bytes();
        bytes[2..4].copy_from_slice(&length);
        bytes
    }

    #[test]
    fn decode_features_reply_with_ports() {
        let bytes = features_reply_bytes(0x0123456789abcdef, &[(5, "eth0"), (6, "eth1")]);

        let reply = match Message::decode(&bytes).unwrap() {
            Message::FeaturesReply(reply) => reply,
            other => panic!("unexpected variant: {:?}", other),
        };

        assert_eq!(reply.datapath_id(), 0x0123456789abcdef);

        let ports: Vec<_> = reply.ports().map(|p| (p.port_no(), p.name())).collect();
        assert_eq!(ports, vec![(5, Some("eth0")), (6, Some("eth1"))]);
    }

    #[test]
    fn features_reply_rejects_partial_port_record() {
        let mut bytes = features_reply_bytes(1, &[]);
        bytes.extend_from_slice(&[0u8; 20]);
        let length = (bytes.len() as u16).to_be_bytes();
        bytes[2..4].copy_from_slice(&length);

        assert_eq!(
            Message::decode(&bytes).unwrap_err(),
            Error::MisalignedPortArray
        );
    }

    #[test]
    fn decode_packet_in() {
        let mut bytes = vec![VERSION, MessageKind::PacketIn as u8, 0, 22, 0, 0, 0, 9];
        bytes.extend_from_slice(&NO_BUFFER.to_be_bytes());
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&3u16.to_be_bytes());
        bytes.push(0);
        bytes.push(0);
        bytes.extend_from_slice(&[1, 2, 3, 4]);

        let packet_in = match Message::decode(&bytes).unwrap() {
            Message::PacketIn(packet_in) => packet_in,
            other => panic!("unexpected variant: {:?}", other),
        };

        assert_eq!(packet_in.buffer_id(), NO_BUFFER);
        assert_eq!(packet_in.total_len(), 4);
        assert_eq!(packet_in.in_port(), 3);
        assert_eq!(packet_in.reason(), Some(PacketInReason::NoMatch));
        assert_eq!(packet_in.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn truncated_packet_in_names_its_kind() {
        let bytes = [VERSION, MessageKind::PacketIn as u8, 0, 12, 0, 0, 0, 1, 0, 0, 0, 0];

        assert_eq!(
            Message::decode(&bytes).unwrap_err(),
            Error::Truncated {
                kind: MessageKind::PacketIn,
                size: 12,
                min: 18,
            }
        );
    }

    #[test]
    fn unknown_kind_and_version_are_rejected() {
        assert_eq!(
            Message::decode(&[VERSION, 99, 0, 8, 0, 0, 0, 1]).unwrap_err(),
            Error::UnknownKind(99)
        );
        assert_eq!(
            Message::decode(&[0x04, 2, 0, 8, 0, 0, 0, 1]).unwrap_err(),
            Error::UnsupportedVersion(0x04)
        );
    }

    #[test]
    fn flow_mod_layout() {
        let flow = FlowKey {
            in_port: 1,
            ..Default::default()
        };

        let bytes = flow_mod_add(5, &flow, 0, 60, NO_BUFFER, &[Action::Output(port::FLOOD)]);

        assert_eq!(bytes.len(), 80);
        assert_eq!(bytes[1], MessageKind::FlowMod as u8);
        assert_eq!(&bytes[2..4], &80u16.to_be_bytes());
        // command ADD at match end.
        assert_eq!(&bytes[56..58], &0u16.to_be_bytes());
        // idle timeout.
        assert_eq!(&bytes[58..60], &60u16.to_be_bytes());
        // action: OUTPUT(FLOOD).
        assert_eq!(&bytes[72..80], &[0, 0, 0, 8, 0xff, 0xfb, 0, 0]);
    }

    #[test]
    fn packet_out_omits_data_when_buffered() {
        let inline = packet_out(1, NO_BUFFER, 1, &[Action::Output(2)], &[9, 9]);
        let buffered = packet_out(1, 77, 1, &[Action::Output(2)], &[9, 9]);

        assert_eq!(inline.len(), 16 + 8 + 2);
        assert_eq!(buffered.len(), 16 + 8);
        assert_eq!(&buffered[8..12], &77u32.to_be_bytes());
    }

    #[test]
    fn enqueue_action_layout() {
        let mut bytes = BytesMut::new();
        Action::Enqueue {
            port: 2,
            queue_id: 7,
        }
        .encode(&mut bytes);

        assert_eq!(
            &bytes[..],
            &[0, 11, 0, 16, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 7]
        );
    }
}
