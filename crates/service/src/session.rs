use crate::{
    Link, RateLimit, SendError, TX_BACKPRESSURE_LIMIT, Timestamp,
    mac_learning::{GratArpLock, MacLearning},
    queues::QueueBindings,
};

use bytes::Bytes;
use codec::{
    DEFAULT_MISS_SEND_LEN, Error, NO_BUFFER, QUEUE_NONE,
    flow::{FlowKey, wildcards},
    message::{self, Action, FeaturesReply, Message, PacketIn, kinds::PacketInReason},
    port,
};

/// Forwarding behaviour of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Mode {
    /// Flood every packet.
    Hub,
    /// Defer to the datapath's built-in L2 bridge.
    Normal,
    /// Run source-address learning in the controller.
    Learn,
}

/// Idle timeout of installed flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxIdle {
    /// Never install flows; every packet is escalated.
    Never,
    /// Install flows that never expire.
    Permanent,
    /// Install flows expiring after this many idle seconds.
    Seconds(u16),
}

impl MaxIdle {
    fn installs_flows(&self) -> bool {
        *self != Self::Never
    }

    /// Wire value of the flow-mod `idle_timeout` field; 0 is permanent.
    fn idle_timeout(&self) -> u16 {
        match *self {
            Self::Never | Self::Permanent => 0,
            Self::Seconds(seconds) => seconds,
        }
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for MaxIdle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = MaxIdle;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("\"never\", \"permanent\", or idle seconds")
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Self::Value, E> {
                match value {
                    "never" => Ok(MaxIdle::Never),
                    "permanent" => Ok(MaxIdle::Permanent),
                    _ => Err(E::custom(format!("unknown idle timeout: {value}"))),
                }
            }

            fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<Self::Value, E> {
                u16::try_from(value)
                    .map(MaxIdle::Seconds)
                    .map_err(|_| E::custom("idle seconds out of range"))
            }

            fn visit_i64<E: serde::de::Error>(self, value: i64) -> Result<Self::Value, E> {
                if value < 0 {
                    Ok(MaxIdle::Never)
                } else {
                    self.visit_u64(value as u64)
                }
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// Where the policy engine sends a packet: a physical port or one of the
/// virtual forwarding behaviours it resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPort {
    /// Drop.
    None,
    Flood,
    /// The datapath's built-in bridge.
    Normal,
    Port(u16),
}

impl OutputPort {
    pub fn encode(&self) -> u16 {
        match *self {
            Self::None => port::NONE,
            Self::Flood => port::FLOOD,
            Self::Normal => port::NORMAL,
            Self::Port(port_no) => port_no,
        }
    }
}

/// Configuration snapshot a session is created from.
#[derive(Clone)]
pub struct SessionOptions {
    pub mode: Mode,
    /// Match every flow field instead of L2 + ingress only.
    pub exact_flows: bool,
    pub max_idle: MaxIdle,
    /// Queue for ports without a binding; `None` emits plain output
    /// actions.
    pub default_queue: Option<u32>,
    /// Port-name to queue-id bindings, resolved against the features
    /// reply.
    pub port_queues: Vec<(String, u32)>,
    /// Pre-serialized messages emitted verbatim at startup.
    pub default_flows: Vec<Bytes>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Learn,
            exact_flows: false,
            max_idle: MaxIdle::Seconds(60),
            default_queue: None,
            port_queues: Vec::new(),
            default_flows: Vec::new(),
        }
    }
}

/// One control session with one datapath.
///
/// Created on a fresh control connection; immediately requests the switch
/// features and pushes the session configuration, then dispatches every
/// inbound message handed to [`process_message`](Self::process_message).
/// Until the features reply arrives (`datapath_id` still zero) nothing but
/// echo replies and repeated feature requests leave the session.
///
/// All operations are non-blocking and externally serialized: the session
/// is owned by a single caller, takes that caller's clock as a parameter,
/// and talks only through the [`Link`] it is handed.
pub struct Session {
    datapath_id: u64,
    mode: Mode,
    wildcards: u32,
    max_idle: MaxIdle,
    default_queue: u32,
    last_features_request: Option<Timestamp>,
    /// Present in learn mode only.
    mac_table: Option<MacLearning>,
    queues: QueueBindings,
    next_xid: u32,
    debug_limit: RateLimit,
    warn_limit: RateLimit,
}

impl Session {
    pub fn new<L: Link>(link: &mut L, now: Timestamp, options: SessionOptions) -> Self {
        let mut queues = QueueBindings::new();
        for (name, queue_id) in &options.port_queues {
            queues.bind(name, *queue_id);
        }

        let mut session = Self {
            datapath_id: 0,
            mode: options.mode,
            wildcards: if options.exact_flows {
                0
            } else {
                // Everything except what forwarding needs: the ingress
                // port detects moves, both Ethernet addresses drive
                // learning, and the VLAN scopes both.
                wildcards::DL_TYPE
                    | wildcards::NW_SRC_MASK
                    | wildcards::NW_DST_MASK
                    | wildcards::NW_PROTO
                    | wildcards::TP_SRC
                    | wildcards::TP_DST
            },
            max_idle: options.max_idle,
            default_queue: options.default_queue.unwrap_or(QUEUE_NONE),
            last_features_request: None,
            mac_table: (options.mode == Mode::Learn).then(MacLearning::new),
            queues,
            next_xid: 0,
            debug_limit: RateLimit::new(30, 300),
            warn_limit: RateLimit::new(1, 5),
        };

        session.send_features_request(link, now);

        for flow in options.default_flows {
            session.queue_tx(link, now, flow);
        }

        session
    }

    /// The id announced by the features reply; 0 until then.
    pub fn datapath_id(&self) -> u64 {
        self.datapath_id
    }

    /// Dispatch one complete inbound message.
    pub fn process_message<L: Link>(&mut self, link: &mut L, now: Timestamp, bytes: &[u8]) {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(Error::Truncated { kind, size, min }) => {
                if self.warn_limit.admit(now) {
                    log::warn!(
                        "{:016x}: {}: too short ({} bytes) for type {:?} (min {})",
                        self.datapath_id,
                        link.name(),
                        size,
                        kind,
                        min,
                    );
                }
                return;
            }
            Err(error) => {
                if self.debug_limit.admit(now) {
                    log::debug!(
                        "{:016x}: {}: undecodable message ignored: {}",
                        self.datapath_id,
                        link.name(),
                        error,
                    );
                }
                return;
            }
        };

        // Until the datapath has identified itself nothing is worth
        // dispatching; keep asking who it is instead.
        if self.datapath_id == 0
            && !matches!(
                message,
                Message::EchoRequest { .. } | Message::FeaturesReply(_)
            )
        {
            self.send_features_request(link, now);
            return;
        }

        match message {
            Message::EchoRequest { header, payload } => {
                self.queue_tx(link, now, message::echo_reply(header.xid, payload));
            }
            Message::FeaturesReply(reply) => self.process_features_reply(&reply),
            Message::PacketIn(packet_in) => self.process_packet_in(link, now, &packet_in),
            // Accepted so a datapath with expiring flows is not spammed
            // about; nothing to do with the contents.
            Message::FlowRemoved { .. } => {}
            Message::Other { header } => {
                if self.debug_limit.admit(now) {
                    log::debug!(
                        "{:016x}: {}: {:?} message ignored",
                        self.datapath_id,
                        link.name(),
                        header.kind,
                    );
                }
            }
        }
    }

    /// Table maintenance; call at or after the instant [`wait`](Self::wait)
    /// returned.
    pub fn run(&mut self, now: Timestamp) {
        if let Some(table) = &mut self.mac_table {
            table.run(now);
        }
    }

    /// The earliest time this session wants [`run`](Self::run) called.
    pub fn wait(&self, now: Timestamp) -> Option<Timestamp> {
        self.mac_table.as_ref().and_then(|table| table.wait_until(now))
    }

    fn process_features_reply(&mut self, reply: &FeaturesReply) {
        self.datapath_id = reply.datapath_id();

        for phy_port in reply.ports() {
            if let Some(name) = phy_port.name() {
                self.queues.resolve(name, phy_port.port_no());
            }
        }
    }

    /// Decide where a packet with this flow key goes.
    fn choose_destination(&mut self, now: Timestamp, flow: &FlowKey) -> OutputPort {
        if let Some(table) = &mut self.mac_table {
            if table.learn(flow.dl_src, flow.dl_vlan, flow.in_port, GratArpLock::None, now)
                && self.debug_limit.admit(now)
            {
                log::debug!(
                    "{:016x}: learned that {} is on port {}",
                    self.datapath_id,
                    flow.dl_src,
                    flow.in_port,
                );
            }
        }

        // Bridge-reserved multicast is dropped before any lookup; these
        // addresses must not be forwarded even if something learned them.
        if flow.dl_dst.is_reserved() {
            return OutputPort::None;
        }

        let mut out_port = OutputPort::Flood;
        if let Some(table) = &self.mac_table {
            if let Some(learned) = table.lookup(flow.dl_dst, flow.dl_vlan, now) {
                if learned == flow.in_port {
                    // Split horizon: never back out the ingress port.
                    return OutputPort::None;
                }

                out_port = OutputPort::Port(learned);
            }
        }

        if self.mode == Mode::Normal && out_port == OutputPort::Flood {
            return OutputPort::Normal;
        }

        out_port
    }

    fn process_packet_in<L: Link>(&mut self, link: &mut L, now: Timestamp, packet_in: &PacketIn) {
        // Anything but a table miss was escalated by some explicit action,
        // possibly another controller's experiment; do not interfere.
        if packet_in.reason() != Some(PacketInReason::NoMatch) {
            return;
        }

        let flow = FlowKey::extract(packet_in.in_port(), packet_in.data());
        let out_port = self.choose_destination(now, &flow);

        // The queue comes from the *ingress* port: the packet keeps the
        // classification of where it came from, wherever it goes.
        let queue_id = self
            .queues
            .queue_for(packet_in.in_port())
            .unwrap_or(self.default_queue);

        let mut actions = Vec::with_capacity(1);
        if out_port != OutputPort::None {
            let encoded = out_port.encode();
            if queue_id == QUEUE_NONE || encoded >= port::MAX {
                actions.push(Action::Output(encoded));
            } else {
                actions.push(Action::Enqueue {
                    port: encoded,
                    queue_id,
                });
            }
        }

        let buffer_id = packet_in.buffer_id();

        // Install a flow when flows are wanted at all and the packet is
        // going somewhere, except for floods while learning: the
        // destination can only be learned from the next escalation of
        // this key.
        if self.max_idle.installs_flows()
            && out_port != OutputPort::None
            && (self.mac_table.is_none() || out_port != OutputPort::Flood)
        {
            let flow_mod = message::flow_mod_add(
                self.alloc_xid(),
                &flow,
                self.wildcards,
                self.max_idle.idle_timeout(),
                buffer_id,
                &actions,
            );
            self.queue_tx(link, now, flow_mod);

            // An unbuffered packet is not released by the flow-mod; send a
            // copy after it.
            if buffer_id == NO_BUFFER && !actions.is_empty() {
                let packet_out = message::packet_out(
                    self.alloc_xid(),
                    NO_BUFFER,
                    flow.in_port,
                    &actions,
                    packet_in.data(),
                );
                self.queue_tx(link, now, packet_out);
            }
        } else if buffer_id != NO_BUFFER || !actions.is_empty() {
            let packet_out = message::packet_out(
                self.alloc_xid(),
                buffer_id,
                flow.in_port,
                &actions,
                packet_in.data(),
            );
            self.queue_tx(link, now, packet_out);
        }
    }

    /// Emit FEATURES_REQUEST plus SET_CONFIG, at most once per second.
    fn send_features_request<L: Link>(&mut self, link: &mut L, now: Timestamp) {
        if self.last_features_request.is_some_and(|at| now < at + 1) {
            return;
        }

        let features_request = message::features_request(self.alloc_xid());
        self.queue_tx(link, now, features_request);

        let set_config = message::set_config(self.alloc_xid(), DEFAULT_MISS_SEND_LEN);
        self.queue_tx(link, now, set_config);

        self.last_features_request = Some(now);
    }

    fn queue_tx<L: Link>(&mut self, link: &mut L, now: Timestamp, message: Bytes) {
        if link.pending() >= TX_BACKPRESSURE_LIMIT {
            self.log_overflow(link, now);
            return;
        }

        match link.send(message) {
            Ok(()) => {}
            Err(SendError::WouldBlock) => self.log_overflow(link, now),
            Err(SendError::NotConnected) => {}
            Err(error) => {
                if self.warn_limit.admit(now) {
                    log::warn!(
                        "{:016x}: {}: send: {}",
                        self.datapath_id,
                        link.name(),
                        error,
                    );
                }
            }
        }
    }

    fn log_overflow<L: Link>(&mut self, link: &L, now: Timestamp) {
        if self.warn_limit.admit(now) {
            log::info!(
                "{:016x}: {}: tx queue overflow",
                self.datapath_id,
                link.name(),
            );
        }
    }

    fn alloc_xid(&mut self) -> u32 {
        self.next_xid = self.next_xid.wrapping_add(1);
        self.next_xid
    }
}
