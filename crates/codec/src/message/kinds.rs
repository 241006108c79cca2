use num_enum::TryFromPrimitive;

/// OpenFlow 1.0 message types.
///
/// The full type space is enumerated so that a well-formed message of any
/// type can be decoded and named; the controller only acts on a subset and
/// ignores the rest.
///
/// # Test
///
/// ```
/// use lswitch_codec::message::kinds::MessageKind;
///
/// assert_eq!(MessageKind::try_from(2).unwrap(), MessageKind::EchoRequest);
/// assert_eq!(MessageKind::try_from(6).unwrap(), MessageKind::FeaturesReply);
/// assert_eq!(MessageKind::try_from(10).unwrap(), MessageKind::PacketIn);
/// assert_eq!(MessageKind::try_from(14).unwrap(), MessageKind::FlowMod);
/// assert!(MessageKind::try_from(22).is_err());
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum MessageKind {
    Hello = 0,
    Error = 1,
    EchoRequest = 2,
    EchoReply = 3,
    Vendor = 4,
    FeaturesRequest = 5,
    FeaturesReply = 6,
    GetConfigRequest = 7,
    GetConfigReply = 8,
    SetConfig = 9,
    PacketIn = 10,
    FlowRemoved = 11,
    PortStatus = 12,
    PacketOut = 13,
    FlowMod = 14,
    PortMod = 15,
    StatsRequest = 16,
    StatsReply = 17,
    BarrierRequest = 18,
    BarrierReply = 19,
    QueueGetConfigRequest = 20,
    QueueGetConfigReply = 21,
}

/// Why the datapath escalated a packet to the controller.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum PacketInReason {
    /// No flow entry matched the packet.
    NoMatch = 0,
    /// A flow entry's action sent it here.
    Action = 1,
}
