use bytes::{BufMut, BytesMut};

/// `dl_vlan` value for an untagged frame.
pub const VLAN_NONE: u16 = 0xffff;

pub const ETH_TYPE_IP: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ETH_TYPE_VLAN: u16 = 0x8100;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

/// Bits of the `wildcards` field of a flow match: a set bit makes the
/// corresponding field "don't care". The network source and destination
/// wildcards are 6-bit CIDR-style counts; 32 or more wildcards the whole
/// address.
pub mod wildcards {
    pub const IN_PORT: u32 = 1 << 0;
    pub const DL_VLAN: u32 = 1 << 1;
    pub const DL_SRC: u32 = 1 << 2;
    pub const DL_DST: u32 = 1 << 3;
    pub const DL_TYPE: u32 = 1 << 4;
    pub const NW_PROTO: u32 = 1 << 5;
    pub const TP_SRC: u32 = 1 << 6;
    pub const TP_DST: u32 = 1 << 7;

    pub const NW_SRC_SHIFT: u32 = 8;
    pub const NW_SRC_MASK: u32 = 0x3f << NW_SRC_SHIFT;
    pub const NW_SRC_ALL: u32 = 32 << NW_SRC_SHIFT;

    pub const NW_DST_SHIFT: u32 = 14;
    pub const NW_DST_MASK: u32 = 0x3f << NW_DST_SHIFT;
    pub const NW_DST_ALL: u32 = 32 << NW_DST_SHIFT;

    pub const DL_VLAN_PCP: u32 = 1 << 20;
    pub const NW_TOS: u32 = 1 << 21;

    pub const ALL: u32 = (1 << 22) - 1;
}

/// A 48-bit Ethernet station address.
///
/// # Test
///
/// ```
/// use lswitch_codec::flow::EthernetAddress;
///
/// let unicast = EthernetAddress([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
/// assert!(!unicast.is_multicast());
/// assert!(!unicast.is_reserved());
/// assert_eq!(unicast.to_string(), "00:11:22:33:44:55");
///
/// // The 802.1D bridge-reserved block 01:80:c2:00:00:00/0xf.
/// let stp = EthernetAddress([0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e]);
/// assert!(stp.is_multicast());
/// assert!(stp.is_reserved());
///
/// assert!(EthernetAddress([0; 6]).is_zero());
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EthernetAddress(pub [u8; 6]);

impl EthernetAddress {
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Whether the group bit is set.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 1 == 1
    }

    /// Whether the address falls in the bridge-reserved multicast block
    /// 01:80:c2:00:00:00 to 01:80:c2:00:00:0f. Frames addressed there are
    /// link-local control traffic and must never be forwarded.
    pub fn is_reserved(&self) -> bool {
        self.0[..5] == [0x01, 0x80, 0xc2, 0x00, 0x00] && self.0[5] & 0xf0 == 0
    }
}

impl std::fmt::Display for EthernetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

/// The header-field tuple extracted from a packet, used both to drive the
/// forwarding decision and to build the match of an installed flow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlowKey {
    pub in_port: u16,
    pub dl_src: EthernetAddress,
    pub dl_dst: EthernetAddress,
    pub dl_vlan: u16,
    pub dl_vlan_pcp: u8,
    pub dl_type: u16,
    pub nw_tos: u8,
    pub nw_proto: u8,
    pub nw_src: u32,
    pub nw_dst: u32,
    pub tp_src: u16,
    pub tp_dst: u16,
}

impl FlowKey {
    /// Extract a flow key from a raw Ethernet frame received on `in_port`.
    ///
    /// Parses the Ethernet header, one optional 802.1Q tag, and as much of
    /// IPv4/TCP/UDP/ICMP or ARP as the frame carries. Layers that are absent
    /// or truncated leave their fields zeroed.
    ///
    /// # Test
    ///
    /// ```
    /// use lswitch_codec::flow::{FlowKey, ETH_TYPE_IP, IP_PROTO_TCP, VLAN_NONE};
    ///
    /// let frame = [
    ///     // dst, src, ethertype 0x0800
    ///     0x66u8, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0x00, 0x11, 0x22, 0x33, 0x44,
    ///     0x55, 0x08, 0x00,
    ///     // IPv4: ihl=5, tos 0, ..., proto tcp, src 10.0.0.1, dst 10.0.0.2
    ///     0x45, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x00, 0x40, 0x06, 0x00,
    ///     0x00, 0x0a, 0x00, 0x00, 0x01, 0x0a, 0x00, 0x00, 0x02,
    ///     // TCP: src port 1234, dst port 80
    ///     0x04, 0xd2, 0x00, 0x50,
    /// ];
    ///
    /// let flow = FlowKey::extract(1, &frame);
    ///
    /// assert_eq!(flow.in_port, 1);
    /// assert_eq!(flow.dl_type, ETH_TYPE_IP);
    /// assert_eq!(flow.dl_vlan, VLAN_NONE);
    /// assert_eq!(flow.nw_proto, IP_PROTO_TCP);
    /// assert_eq!(flow.nw_src, u32::from_be_bytes([10, 0, 0, 1]));
    /// assert_eq!(flow.tp_src, 1234);
    /// assert_eq!(flow.tp_dst, 80);
    /// ```
    pub fn extract(in_port: u16, packet: &[u8]) -> Self {
        let mut flow = Self {
            in_port,
            dl_vlan: VLAN_NONE,
            ..Default::default()
        };

        if packet.len() < 14 {
            return flow;
        }

        flow.dl_dst = EthernetAddress(packet[0..6].try_into().unwrap_or_default());
        flow.dl_src = EthernetAddress(packet[6..12].try_into().unwrap_or_default());

        let mut kind = u16::from_be_bytes([packet[12], packet[13]]);
        let mut offset = 14;

        // A single 802.1Q tag: TCI then the real ethertype.
        if kind == ETH_TYPE_VLAN {
            if packet.len() < offset + 4 {
                return flow;
            }

            let tci = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
            flow.dl_vlan = tci & 0x0fff;
            flow.dl_vlan_pcp = (tci >> 13) as u8;

            kind = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]);
            offset += 4;
        }

        flow.dl_type = kind;

        match kind {
            ETH_TYPE_IP => flow.extract_ipv4(&packet[offset..]),
            ETH_TYPE_ARP => flow.extract_arp(&packet[offset..]),
            _ => {}
        }

        flow
    }

    fn extract_ipv4(&mut self, packet: &[u8]) {
        if packet.len() < 20 {
            return;
        }

        let ihl = (packet[0] & 0x0f) as usize * 4;
        if ihl < 20 || packet.len() < ihl {
            return;
        }

        self.nw_tos = packet[1] & 0xfc;
        self.nw_proto = packet[9];
        self.nw_src = u32::from_be_bytes([packet[12], packet[13], packet[14], packet[15]]);
        self.nw_dst = u32::from_be_bytes([packet[16], packet[17], packet[18], packet[19]]);

        // Fragments other than the first carry no transport header.
        let frag_off = u16::from_be_bytes([packet[6], packet[7]]) & 0x1fff;
        if frag_off != 0 {
            return;
        }

        let transport = &packet[ihl..];
        match self.nw_proto {
            IP_PROTO_TCP | IP_PROTO_UDP => {
                if transport.len() >= 4 {
                    self.tp_src = u16::from_be_bytes([transport[0], transport[1]]);
                    self.tp_dst = u16::from_be_bytes([transport[2], transport[3]]);
                }
            }
            IP_PROTO_ICMP => {
                // ICMP type and code travel in the transport port fields.
                if transport.len() >= 2 {
                    self.tp_src = transport[0] as u16;
                    self.tp_dst = transport[1] as u16;
                }
            }
            _ => {}
        }
    }

    fn extract_arp(&mut self, packet: &[u8]) {
        // Ethernet/IPv4 ARP only: htype 1, ptype 0x0800, hlen 6, plen 4.
        if packet.len() < 28 || packet[0..6] != [0, 1, 0x08, 0, 6, 4] {
            return;
        }

        let opcode = u16::from_be_bytes([packet[6], packet[7]]);
        if opcode <= u8::MAX as u16 {
            self.nw_proto = opcode as u8;
        }

        self.nw_src = u32::from_be_bytes([packet[14], packet[15], packet[16], packet[17]]);
        self.nw_dst = u32::from_be_bytes([packet[24], packet[25], packet[26], packet[27]]);
    }

    /// Write the 40-byte flow match for this key with the given wildcard
    /// mask.
    pub fn encode_match(&self, wildcards: u32, bytes: &mut BytesMut) {
        bytes.put_u32(wildcards);
        bytes.put_u16(self.in_port);
        bytes.put(self.dl_src.0.as_slice());
        bytes.put(self.dl_dst.0.as_slice());
        bytes.put_u16(self.dl_vlan);
        bytes.put_u8(self.dl_vlan_pcp);
        bytes.put_u8(0);
        bytes.put_u16(self.dl_type);
        bytes.put_u8(self.nw_tos);
        bytes.put_u8(self.nw_proto);
        bytes.put_u16(0);
        bytes.put_u32(self.nw_src);
        bytes.put_u32(self.nw_dst);
        bytes.put_u16(self.tp_src);
        bytes.put_u16(self.tp_dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_vlan_tagged_udp() {
        let mut frame = vec![
            0xffu8, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55,
        ];
        // 802.1Q: pcp 5, vlan 100, inner type IPv4.
        frame.extend_from_slice(&[0x81, 0x00, 0xa0, 0x64, 0x08, 0x00]);
        frame.extend_from_slice(&[
            0x45, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0x02,
        ]);
        frame.extend_from_slice(&[0x00, 0x35, 0x13, 0x88]);

        let flow = FlowKey::extract(7, &frame);

        assert_eq!(flow.dl_vlan, 100);
        assert_eq!(flow.dl_vlan_pcp, 5);
        assert_eq!(flow.dl_type, ETH_TYPE_IP);
        assert_eq!(flow.nw_proto, IP_PROTO_UDP);
        assert_eq!(flow.tp_src, 53);
        assert_eq!(flow.tp_dst, 5000);
    }

    #[test]
    fn extract_arp_request() {
        let mut frame = vec![
            0xffu8, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x08, 0x06,
        ];
        frame.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 0x06, 0x04, 0x00, 0x01]);
        frame.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        frame.extend_from_slice(&[10, 0, 0, 1]);
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        frame.extend_from_slice(&[10, 0, 0, 2]);

        let flow = FlowKey::extract(3, &frame);

        assert_eq!(flow.dl_type, ETH_TYPE_ARP);
        assert_eq!(flow.nw_proto, 1);
        assert_eq!(flow.nw_src, u32::from_be_bytes([10, 0, 0, 1]));
        assert_eq!(flow.nw_dst, u32::from_be_bytes([10, 0, 0, 2]));
    }

    #[test]
    fn extract_runt_frame() {
        let flow = FlowKey::extract(1, &[0u8; 10]);

        assert_eq!(flow.in_port, 1);
        assert!(flow.dl_src.is_zero());
        assert_eq!(flow.dl_vlan, VLAN_NONE);
        assert_eq!(flow.dl_type, 0);
    }

    #[test]
    fn ipv4_fragment_has_no_ports() {
        let mut frame = vec![
            0x66u8, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x08, 0x00,
        ];
        // frag_off = 0x0010.
        frame.extend_from_slice(&[
            0x45, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x10, 0x40, 0x06, 0x00, 0x00, 0x0a, 0x00,
            0x00, 0x01, 0x0a, 0x00, 0x00, 0x02,
        ]);
        frame.extend_from_slice(&[0x04, 0xd2, 0x00, 0x50]);

        let flow = FlowKey::extract(1, &frame);

        assert_eq!(flow.nw_proto, IP_PROTO_TCP);
        assert_eq!(flow.tp_src, 0);
        assert_eq!(flow.tp_dst, 0);
    }

    #[test]
    fn match_encoding_is_40_bytes() {
        let mut bytes = BytesMut::new();
        FlowKey::extract(1, &[0u8; 14]).encode_match(wildcards::ALL, &mut bytes);

        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[0..4], &wildcards::ALL.to_be_bytes());
    }
}
