//! Link/network/transport header decoding.
//!
//! Hand-rolled big-endian parsing of Ethernet (with one optional 802.1Q
//! tag), IPv4, IPv6, TCP and UDP headers into a transient [`DecodedPacket`].
//! Anything malformed or unsupported returns `None`; the caller counts the
//! drop. Packets are never persisted; the decoded form lives exactly as
//! long as one trip through the aggregator.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

// TCP flag bits, low byte of the flags field.
pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;
pub const TCP_URG: u8 = 0x20;

/// Transport protocol of a decoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl Transport {
    pub fn from_ip_proto(proto: u8) -> Self {
        match proto {
            6 => Transport::Tcp,
            17 => Transport::Udp,
            1 | 58 => Transport::Icmp,
            other => Transport::Other(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
            Transport::Icmp => "ICMP",
            Transport::Other(_) => "OTHER",
        }
    }
}

/// Decoded TCP header fields the flow layer cares about.
#[derive(Debug, Clone, Copy)]
pub struct TcpMeta {
    pub flags: u8,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
}

/// One decoded packet. Transient: decode, dispatch, drop.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    /// Zero when the transport carries no ports.
    pub src_port: u16,
    pub dst_port: u16,
    pub transport: Transport,
    /// Captured length on the wire.
    pub length: u32,
    pub timestamp: DateTime<Utc>,
    pub src_mac: Option<[u8; 6]>,
    pub dst_mac: Option<[u8; 6]>,
    pub tcp: Option<TcpMeta>,
    pub ttl: Option<u8>,
    /// Transport payload (may be empty).
    pub payload: Vec<u8>,
}

impl DecodedPacket {
    pub fn tcp_flags(&self) -> u8 {
        self.tcp.map(|t| t.flags).unwrap_or(0)
    }
}

/// Decode a full Ethernet frame captured off the wire.
pub fn decode_ethernet(frame: &[u8], timestamp: DateTime<Utc>) -> Option<DecodedPacket> {
    if frame.len() < ETHERNET_HEADER_LEN {
        return None;
    }
    let dst_mac: [u8; 6] = frame[0..6].try_into().ok()?;
    let src_mac: [u8; 6] = frame[6..12].try_into().ok()?;
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut offset = ETHERNET_HEADER_LEN;

    // One 802.1Q tag; QinQ is not worth the bytes on a home segment.
    if ethertype == ETHERTYPE_VLAN {
        if frame.len() < offset + 4 {
            return None;
        }
        ethertype = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
        offset += 4;
    }

    let mut pkt = match ethertype {
        ETHERTYPE_IPV4 => decode_ipv4(&frame[offset..], timestamp)?,
        ETHERTYPE_IPV6 => decode_ipv6(&frame[offset..], timestamp)?,
        _ => return None,
    };
    pkt.length = frame.len() as u32;
    pkt.src_mac = Some(src_mac);
    pkt.dst_mac = Some(dst_mac);
    Some(pkt)
}

/// Decode an IPv4 packet (starting at the IP header).
pub fn decode_ipv4(buf: &[u8], timestamp: DateTime<Utc>) -> Option<DecodedPacket> {
    if buf.len() < IPV4_MIN_HEADER_LEN {
        return None;
    }
    let version = buf[0] >> 4;
    if version != 4 {
        return None;
    }
    let ihl = ((buf[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_MIN_HEADER_LEN || buf.len() < ihl {
        return None;
    }
    let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let ttl = buf[8];
    let proto = buf[9];
    let src = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);

    // Clamp to what was actually captured; truncated captures are common.
    let end = total_len.clamp(ihl, buf.len());
    let l4 = &buf[ihl..end];

    build_transport(
        IpAddr::V4(src),
        IpAddr::V4(dst),
        proto,
        Some(ttl),
        l4,
        buf.len() as u32,
        timestamp,
    )
}

/// Decode an IPv6 packet (fixed header only; extension chains are skipped
/// as undecodable rather than walked).
pub fn decode_ipv6(buf: &[u8], timestamp: DateTime<Utc>) -> Option<DecodedPacket> {
    if buf.len() < IPV6_HEADER_LEN {
        return None;
    }
    let version = buf[0] >> 4;
    if version != 6 {
        return None;
    }
    let next_header = buf[6];
    let hop_limit = buf[7];
    let src_bytes: [u8; 16] = buf[8..24].try_into().ok()?;
    let dst_bytes: [u8; 16] = buf[24..40].try_into().ok()?;
    let src = Ipv6Addr::from(src_bytes);
    let dst = Ipv6Addr::from(dst_bytes);
    let l4 = &buf[IPV6_HEADER_LEN..];

    build_transport(
        IpAddr::V6(src),
        IpAddr::V6(dst),
        next_header,
        Some(hop_limit),
        l4,
        buf.len() as u32,
        timestamp,
    )
}

fn build_transport(
    src_addr: IpAddr,
    dst_addr: IpAddr,
    proto: u8,
    ttl: Option<u8>,
    l4: &[u8],
    length: u32,
    timestamp: DateTime<Utc>,
) -> Option<DecodedPacket> {
    let transport = Transport::from_ip_proto(proto);
    let mut pkt = DecodedPacket {
        src_addr,
        dst_addr,
        src_port: 0,
        dst_port: 0,
        transport,
        length,
        timestamp,
        src_mac: None,
        dst_mac: None,
        tcp: None,
        ttl,
        payload: Vec::new(),
    };

    match transport {
        Transport::Tcp => {
            if l4.len() < TCP_MIN_HEADER_LEN {
                return None;
            }
            pkt.src_port = u16::from_be_bytes([l4[0], l4[1]]);
            pkt.dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            let seq = u32::from_be_bytes([l4[4], l4[5], l4[6], l4[7]]);
            let ack = u32::from_be_bytes([l4[8], l4[9], l4[10], l4[11]]);
            let data_offset = ((l4[12] >> 4) as usize) * 4;
            if data_offset < TCP_MIN_HEADER_LEN || l4.len() < data_offset {
                return None;
            }
            let flags = l4[13];
            let window = u16::from_be_bytes([l4[14], l4[15]]);
            pkt.tcp = Some(TcpMeta {
                flags,
                seq,
                ack,
                window,
            });
            pkt.payload = l4[data_offset..].to_vec();
        }
        Transport::Udp => {
            if l4.len() < UDP_HEADER_LEN {
                return None;
            }
            pkt.src_port = u16::from_be_bytes([l4[0], l4[1]]);
            pkt.dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            pkt.payload = l4[UDP_HEADER_LEN..].to_vec();
        }
        Transport::Icmp | Transport::Other(_) => {
            // No ports; payload retained for byte accounting only.
        }
    }

    Some(pkt)
}

#[cfg(test)]
pub mod testutil {
    //! Builders for wire-format test vectors, shared with the integration
    //! tests via `#[cfg(test)]` re-export in each consumer.

    use super::*;

    /// Build an IPv4/TCP packet starting at the IP header.
    pub fn build_ipv4_tcp(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        sport: u16,
        dport: u16,
        flags: u8,
        seq: u32,
        ack: u32,
        payload: &[u8],
    ) -> Vec<u8> {
        let total_len = (IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN + payload.len()) as u16;
        let mut buf = Vec::with_capacity(total_len as usize);
        buf.push(0x45); // version 4, IHL 5
        buf.push(0); // DSCP/ECN
        buf.extend_from_slice(&total_len.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]); // id, flags, frag offset
        buf.push(64); // TTL
        buf.push(6); // TCP
        buf.extend_from_slice(&[0, 0]); // checksum
        buf.extend_from_slice(&src.octets());
        buf.extend_from_slice(&dst.octets());

        buf.extend_from_slice(&sport.to_be_bytes());
        buf.extend_from_slice(&dport.to_be_bytes());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&ack.to_be_bytes());
        buf.push(0x50); // data offset 5
        buf.push(flags);
        buf.extend_from_slice(&1024u16.to_be_bytes()); // window
        buf.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent
        buf.extend_from_slice(payload);
        buf
    }

    /// Build an IPv4/UDP packet starting at the IP header.
    pub fn build_ipv4_udp(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        sport: u16,
        dport: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let total_len = (IPV4_MIN_HEADER_LEN + UDP_HEADER_LEN + payload.len()) as u16;
        let mut buf = Vec::with_capacity(total_len as usize);
        buf.push(0x45);
        buf.push(0);
        buf.extend_from_slice(&total_len.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.push(64);
        buf.push(17); // UDP
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&src.octets());
        buf.extend_from_slice(&dst.octets());

        buf.extend_from_slice(&sport.to_be_bytes());
        buf.extend_from_slice(&dport.to_be_bytes());
        buf.extend_from_slice(&((UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes());
        buf.extend_from_slice(&[0, 0]); // checksum
        buf.extend_from_slice(payload);
        buf
    }

    /// Wrap an IP packet in an Ethernet frame.
    pub fn wrap_ethernet(src_mac: [u8; 6], dst_mac: [u8; 6], ethertype: u16, ip: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ETHERNET_HEADER_LEN + ip.len());
        buf.extend_from_slice(&dst_mac);
        buf.extend_from_slice(&src_mac);
        buf.extend_from_slice(&ethertype.to_be_bytes());
        buf.extend_from_slice(ip);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    const SRC_MAC: [u8; 6] = [0x28, 0x6F, 0xB9, 0x01, 0x02, 0x03];
    const DST_MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];

    #[test]
    fn decodes_ipv4_tcp_frame() {
        let ip = build_ipv4_tcp(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(93, 184, 216, 34),
            55312,
            443,
            TCP_SYN,
            1000,
            0,
            b"",
        );
        let frame = wrap_ethernet(SRC_MAC, DST_MAC, ETHERTYPE_IPV4, &ip);
        let pkt = decode_ethernet(&frame, Utc::now()).expect("frame should decode");

        assert_eq!(pkt.src_addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(pkt.dst_addr, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(pkt.src_port, 55312);
        assert_eq!(pkt.dst_port, 443);
        assert_eq!(pkt.transport, Transport::Tcp);
        assert_eq!(pkt.ttl, Some(64));
        assert_eq!(pkt.src_mac, Some(SRC_MAC));
        let tcp = pkt.tcp.expect("tcp meta");
        assert_eq!(tcp.flags, TCP_SYN);
        assert_eq!(tcp.seq, 1000);
    }

    #[test]
    fn decodes_vlan_tagged_frame() {
        let ip = build_ipv4_udp(
            Ipv4Addr::new(192, 168, 1, 2),
            Ipv4Addr::new(8, 8, 8, 8),
            5353,
            53,
            b"abc",
        );
        let mut frame = Vec::new();
        frame.extend_from_slice(&DST_MAC);
        frame.extend_from_slice(&SRC_MAC);
        frame.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x64]); // VLAN 100
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame.extend_from_slice(&ip);

        let pkt = decode_ethernet(&frame, Utc::now()).expect("vlan frame should decode");
        assert_eq!(pkt.transport, Transport::Udp);
        assert_eq!(pkt.dst_port, 53);
        assert_eq!(pkt.payload, b"abc");
    }

    #[test]
    fn decodes_ipv6_tcp() {
        let src = "2001:db8::1".parse::<Ipv6Addr>().unwrap();
        let dst = "2001:db8::2".parse::<Ipv6Addr>().unwrap();
        let mut buf = Vec::new();
        buf.push(0x60); // version 6
        buf.extend_from_slice(&[0, 0, 0]); // traffic class / flow label
        buf.extend_from_slice(&20u16.to_be_bytes()); // payload length
        buf.push(6); // next header TCP
        buf.push(64); // hop limit
        buf.extend_from_slice(&src.octets());
        buf.extend_from_slice(&dst.octets());
        // Minimal TCP header.
        buf.extend_from_slice(&4040u16.to_be_bytes());
        buf.extend_from_slice(&80u16.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.push(0x50);
        buf.push(TCP_SYN | TCP_ACK);
        buf.extend_from_slice(&512u16.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);

        let pkt = decode_ipv6(&buf, Utc::now()).expect("ipv6 should decode");
        assert_eq!(pkt.src_addr, IpAddr::V6(src));
        assert_eq!(pkt.src_port, 4040);
        assert_eq!(pkt.tcp.unwrap().flags, TCP_SYN | TCP_ACK);
        assert_eq!(pkt.ttl, Some(64));
    }

    #[test]
    fn rejects_truncated_frames() {
        assert!(decode_ethernet(&[0u8; 10], Utc::now()).is_none());

        let ip = build_ipv4_tcp(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            2,
            TCP_SYN,
            0,
            0,
            b"",
        );
        let frame = wrap_ethernet(SRC_MAC, DST_MAC, ETHERTYPE_IPV4, &ip);
        // Cut into the TCP header.
        assert!(decode_ethernet(&frame[..frame.len() - 15], Utc::now()).is_none());
    }

    #[test]
    fn rejects_unknown_ethertype() {
        let frame = wrap_ethernet(SRC_MAC, DST_MAC, 0x0806, &[0u8; 28]); // ARP
        assert!(decode_ethernet(&frame, Utc::now()).is_none());
    }

    #[test]
    fn rejects_bad_ip_version() {
        let mut ip = build_ipv4_udp(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            2,
            b"",
        );
        ip[0] = 0x65; // version 6 in an ipv4 parse
        assert!(decode_ipv4(&ip, Utc::now()).is_none());
    }

    #[test]
    fn tcp_payload_respects_data_offset() {
        let mut ip = build_ipv4_tcp(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1234,
            80,
            TCP_PSH | TCP_ACK,
            1,
            1,
            b"GET / HTTP/1.1\r\n",
        );
        // total_len must match what the builder wrote.
        let pkt = decode_ipv4(&ip, Utc::now()).unwrap();
        assert_eq!(pkt.payload, b"GET / HTTP/1.1\r\n");

        // Garbage data offset smaller than the minimum header.
        ip[IPV4_MIN_HEADER_LEN + 12] = 0x10;
        assert!(decode_ipv4(&ip, Utc::now()).is_none());
    }

    #[test]
    fn icmp_has_no_ports() {
        let mut buf = Vec::new();
        buf.push(0x45);
        buf.push(0);
        buf.extend_from_slice(&28u16.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.push(255);
        buf.push(1); // ICMP
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&Ipv4Addr::new(10, 0, 0, 1).octets());
        buf.extend_from_slice(&Ipv4Addr::new(10, 0, 0, 2).octets());
        buf.extend_from_slice(&[8, 0, 0, 0, 0, 0, 0, 0]); // echo request

        let pkt = decode_ipv4(&buf, Utc::now()).unwrap();
        assert_eq!(pkt.transport, Transport::Icmp);
        assert_eq!(pkt.src_port, 0);
        assert_eq!(pkt.ttl, Some(255));
    }
}
