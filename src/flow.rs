use pdu::{Ethernet, EthernetPdu, Ip, Ipv4, Ipv4Pdu, Ipv6, Ipv6Pdu, Tcp, TcpPdu};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Which side of a connection sent a segment.
///
/// `Forward` means the packet travelled from the lower endpoint of the
/// [`FlowKey`] to the higher one, `Reverse` the other way around.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn reverse(self) -> Direction {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

/// Direction independent identity of one TCP connection.
/// `lower` always sorts before `higher`, whichever side transmitted.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct FlowKey {
    pub lower: SocketAddr,
    pub higher: SocketAddr,
}

impl FlowKey {
    /// Build the canonical key for a packet sent from `src` to `dst` and
    /// report which direction the packet travelled in.
    pub fn from_endpoints(src: SocketAddr, dst: SocketAddr) -> (FlowKey, Direction) {
        if src <= dst {
            (
                FlowKey {
                    lower: src,
                    higher: dst,
                },
                Direction::Forward,
            )
        } else {
            (
                FlowKey {
                    lower: dst,
                    higher: src,
                },
                Direction::Reverse,
            )
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.lower, self.higher)
    }
}

/// One direction of a connection. Both halves share the [`FlowKey`].
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct StreamKey {
    pub flow: FlowKey,
    pub direction: Direction,
}

impl StreamKey {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> StreamKey {
        let (flow, direction) = FlowKey::from_endpoints(src, dst);
        StreamKey { flow, direction }
    }

    /// The sending endpoint of this half.
    pub fn src(&self) -> SocketAddr {
        match self.direction {
            Direction::Forward => self.flow.lower,
            Direction::Reverse => self.flow.higher,
        }
    }

    pub fn dst(&self) -> SocketAddr {
        match self.direction {
            Direction::Forward => self.flow.higher,
            Direction::Reverse => self.flow.lower,
        }
    }

    /// The other half of the same connection.
    pub fn reverse(&self) -> StreamKey {
        StreamKey {
            flow: self.flow,
            direction: self.direction.reverse(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src(), self.dst())
    }
}

/// TCP payload plus the header fields the reassembler cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentRecord {
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
}

/// Link layer framing of captured packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Linux "any" device pseudo header
    LinuxSll,
    RawIp,
    /// BSD loopback, 4 byte address family header
    Null,
}

impl LinkType {
    fn header_len(self) -> usize {
        match self {
            LinkType::Ethernet => 14,
            LinkType::LinuxSll => 16,
            LinkType::RawIp => 0,
            LinkType::Null => 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet has no network layer")]
    NoNetworkLayer,
    #[error("packet has no transport layer")]
    NoTransportLayer,
    #[error("transport layer is not tcp")]
    NotTcp,
    #[error("ipv4 fragment, reassembly of fragments is not supported")]
    Fragmented,
    #[error("{0} checksum mismatch")]
    BadChecksum(&'static str),
    #[error("malformed packet: {0:?}")]
    Malformed(pdu::Error),
}

impl From<pdu::Error> for PacketError {
    fn from(e: pdu::Error) -> Self {
        PacketError::Malformed(e)
    }
}

/// Decode a captured frame down to its TCP segment.
pub fn decode_packet(
    link: LinkType,
    data: &[u8],
    verify_checksums: bool,
) -> Result<(StreamKey, SegmentRecord), PacketError> {
    match link {
        LinkType::Ethernet => match EthernetPdu::new(data)?.inner()? {
            Ethernet::Ipv4(ipv4_pdu) => decode_ipv4(ipv4_pdu, verify_checksums),
            Ethernet::Ipv6(ipv6_pdu) => decode_ipv6(ipv6_pdu, verify_checksums),
            _ => Err(PacketError::NoNetworkLayer),
        },
        other => {
            let ip = data
                .get(other.header_len()..)
                .ok_or(PacketError::NoNetworkLayer)?;
            match ip.first().map(|b| b >> 4) {
                Some(4) => decode_ipv4(Ipv4Pdu::new(ip)?, verify_checksums),
                Some(6) => decode_ipv6(Ipv6Pdu::new(ip)?, verify_checksums),
                _ => Err(PacketError::NoNetworkLayer),
            }
        }
    }
}

fn decode_ipv4(
    ipv4_pdu: Ipv4Pdu,
    verify_checksums: bool,
) -> Result<(StreamKey, SegmentRecord), PacketError> {
    if ipv4_pdu.more_fragments() || ipv4_pdu.fragment_offset() != 0 {
        return Err(PacketError::Fragmented);
    }
    if verify_checksums && ipv4_pdu.checksum() != ipv4_pdu.computed_checksum() {
        return Err(PacketError::BadChecksum("ipv4"));
    }
    let tcp_packet = match ipv4_pdu.inner()? {
        Ipv4::Tcp(tcp_packet) => tcp_packet,
        Ipv4::Raw(_) => return Err(PacketError::NoTransportLayer),
        _ => return Err(PacketError::NotTcp),
    };
    if verify_checksums
        && tcp_packet.checksum() != tcp_packet.computed_checksum(&Ip::Ipv4(ipv4_pdu))
    {
        return Err(PacketError::BadChecksum("tcp"));
    }
    // ethernet padding may trail the ip datagram
    let payload_len = (ipv4_pdu.total_length() as usize)
        .saturating_sub(ipv4_pdu.computed_ihl())
        .saturating_sub(tcp_packet.computed_data_offset());
    let src = IpAddr::V4(Ipv4Addr::from(ipv4_pdu.source_address()));
    let dst = IpAddr::V4(Ipv4Addr::from(ipv4_pdu.destination_address()));
    Ok(segment(src, dst, tcp_packet, payload_len))
}

fn decode_ipv6(
    ipv6_pdu: Ipv6Pdu,
    verify_checksums: bool,
) -> Result<(StreamKey, SegmentRecord), PacketError> {
    let tcp_packet = match ipv6_pdu.inner()? {
        Ipv6::Tcp(tcp_packet) => tcp_packet,
        Ipv6::Raw(_) => return Err(PacketError::NoTransportLayer),
        _ => return Err(PacketError::NotTcp),
    };
    if verify_checksums
        && tcp_packet.checksum() != tcp_packet.computed_checksum(&Ip::Ipv6(ipv6_pdu))
    {
        return Err(PacketError::BadChecksum("tcp"));
    }
    // computed_ihl includes the fixed 40 byte header and any extension headers
    let payload_len = (ipv6_pdu.payload_length() as usize + 40)
        .saturating_sub(ipv6_pdu.computed_ihl())
        .saturating_sub(tcp_packet.computed_data_offset());
    let src = IpAddr::V6(Ipv6Addr::from(ipv6_pdu.source_address()));
    let dst = IpAddr::V6(Ipv6Addr::from(ipv6_pdu.destination_address()));
    Ok(segment(src, dst, tcp_packet, payload_len))
}

fn segment(
    src: IpAddr,
    dst: IpAddr,
    tcp_packet: TcpPdu,
    payload_len: usize,
) -> (StreamKey, SegmentRecord) {
    let key = StreamKey::new(
        SocketAddr::new(src, tcp_packet.source_port()),
        SocketAddr::new(dst, tcp_packet.destination_port()),
    );
    let payload = match tcp_packet.inner() {
        Ok(Tcp::Raw(data)) => data[..payload_len.min(data.len())].to_vec(),
        _ => Vec::new(),
    };
    let record = SegmentRecord {
        seq: tcp_packet.sequence_number(),
        syn: tcp_packet.syn(),
        fin: tcp_packet.fin(),
        rst: tcp_packet.rst(),
        payload,
    };
    (key, record)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::SocketAddrV4;

    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH_ACK: u8 = 0x18;

    /// Hand built Ethernet/IPv4/TCP frame, checksums left at zero.
    pub fn ethernet_frame(
        src: SocketAddrV4,
        dst: SocketAddrV4,
        seq: u32,
        flags: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut frame = vec![0x02, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, 0x02, 0x08, 0x00];
        let total_length = (20 + 20 + payload.len()) as u16;
        frame.extend_from_slice(&[0x45, 0x00]);
        frame.extend_from_slice(&total_length.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 64, 6, 0x00, 0x00]);
        frame.extend_from_slice(&src.ip().octets());
        frame.extend_from_slice(&dst.ip().octets());
        frame.extend_from_slice(&src.port().to_be_bytes());
        frame.extend_from_slice(&dst.port().to_be_bytes());
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&[0x50, flags, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00]);
        frame.extend_from_slice(payload);
        frame
    }

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn both_directions_share_flow_key() {
        let client = SocketAddr::V4(addr(2, 50000));
        let server = SocketAddr::V4(addr(1, 6379));
        let a = StreamKey::new(client, server);
        let b = StreamKey::new(server, client);
        assert_eq!(a.flow, b.flow);
        assert_ne!(a.direction, b.direction);
        assert_eq!(a.reverse(), b);
        assert_eq!(a.src(), client);
        assert_eq!(b.src(), server);
        assert_eq!(b.dst(), client);
    }

    #[test]
    fn decodes_ethernet_ipv4_tcp() {
        let frame = ethernet_frame(addr(2, 50000), addr(1, 6379), 1000, PSH_ACK, b"PING\r\n");
        let (key, seg) = decode_packet(LinkType::Ethernet, &frame, false).unwrap();
        assert_eq!(key.src(), SocketAddr::V4(addr(2, 50000)));
        assert_eq!(key.dst(), SocketAddr::V4(addr(1, 6379)));
        assert_eq!(seg.seq, 1000);
        assert!(!seg.syn && !seg.fin && !seg.rst);
        assert_eq!(seg.payload, b"PING\r\n");
    }

    #[test]
    fn strips_ethernet_padding() {
        let mut frame = ethernet_frame(addr(2, 50000), addr(1, 6379), 7, SYN, b"");
        frame.extend_from_slice(&[0u8; 6]);
        let (_, seg) = decode_packet(LinkType::Ethernet, &frame, false).unwrap();
        assert!(seg.syn);
        assert!(seg.payload.is_empty());
    }

    #[test]
    fn decodes_raw_ip() {
        let frame = ethernet_frame(addr(2, 50000), addr(1, 6379), 1, FIN, b"x");
        let (_, seg) = decode_packet(LinkType::RawIp, &frame[14..], false).unwrap();
        assert!(seg.fin);
        assert_eq!(seg.payload, b"x");
    }

    #[test]
    fn rejects_udp() {
        let mut frame = ethernet_frame(addr(2, 50000), addr(1, 53), 1, 0, b"");
        frame[14 + 9] = 17;
        assert!(decode_packet(LinkType::Ethernet, &frame, false).is_err());
    }

    #[test]
    fn rejects_fragments() {
        let mut frame = ethernet_frame(addr(2, 50000), addr(1, 6379), 1, 0, b"abc");
        // more fragments bit
        frame[14 + 6] = 0x20;
        assert!(matches!(
            decode_packet(LinkType::Ethernet, &frame, false),
            Err(PacketError::Fragmented)
        ));
    }

    #[test]
    fn checksum_verification_is_optional() {
        let frame = ethernet_frame(addr(2, 50000), addr(1, 6379), 1, RST, b"");
        assert!(decode_packet(LinkType::Ethernet, &frame, false).is_ok());
        assert!(matches!(
            decode_packet(LinkType::Ethernet, &frame, true),
            Err(PacketError::BadChecksum(_))
        ));
    }
}
