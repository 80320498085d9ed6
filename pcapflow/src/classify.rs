use etherparse::{
    EtherType, Icmpv4Slice, IpFragOffset, IpNumber, Ipv6ExtensionSlice, LaxIpPayloadSlice,
    LaxIpv6Slice, LaxNetSlice, LaxSlicedPacket, TcpSlice, TransportSlice, UdpSlice,
};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

use crate::capture::RawPacket;

// Link types we know how to peel down to the network layer.
const LINKTYPE_NULL: i32 = 0;
const LINKTYPE_ETHERNET: i32 = 1;
const LINKTYPE_RAW_BSD: i32 = 12;
const LINKTYPE_RAW: i32 = 101;
const LINKTYPE_LINUX_SLL: i32 = 113;
const LINKTYPE_IPV4: i32 = 228;
const LINKTYPE_IPV6: i32 = 229;

const SLL_HEADER_LEN: usize = 16;
const NULL_HEADER_LEN: usize = 4;

/// Transport-layer protocol tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [Protocol::Tcp, Protocol::Udp, Protocol::Icmp, Protocol::Other];

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Other => "other",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying a single packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub protocol: Protocol,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

impl Classification {
    fn unrouted() -> Self {
        Self {
            protocol: Protocol::Other,
            src_ip: None,
            dst_ip: None,
            src_port: None,
            dst_port: None,
        }
    }
}

/// Classify a packet by its network and transport headers.
///
/// IPv4 wins over IPv6, and TCP over UDP over ICMP. ICMP is only recognized
/// on IPv4; ICMPv6 and anything else on top of an IP header is `Other` with
/// the addresses kept. Packets without a recognizable IP header, including
/// ones that cannot be decoded at all, are `Other` with no addresses.
pub fn classify(packet: &RawPacket) -> Classification {
    let Some(sliced) = slice(packet.link_type, &packet.data) else {
        return Classification::unrouted();
    };

    let (src_ip, dst_ip, is_v4) = match &sliced.net {
        Some(LaxNetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                IpAddr::V4(header.source_addr()),
                IpAddr::V4(header.destination_addr()),
                true,
            )
        }
        Some(LaxNetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                IpAddr::V6(header.source_addr()),
                IpAddr::V6(header.destination_addr()),
                false,
            )
        }
        _ => return Classification::unrouted(),
    };

    let mut result = Classification {
        protocol: Protocol::Other,
        src_ip: Some(src_ip),
        dst_ip: Some(dst_ip),
        src_port: None,
        dst_port: None,
    };

    let transport = match (&sliced.transport, &sliced.net) {
        (Some(transport), _) => Some(transport.clone()),
        (None, Some(net)) => first_fragment_transport(net),
        (None, None) => None,
    };

    match &transport {
        Some(TransportSlice::Tcp(tcp)) => {
            result.protocol = Protocol::Tcp;
            result.src_port = Some(tcp.source_port());
            result.dst_port = Some(tcp.destination_port());
        }
        Some(TransportSlice::Udp(udp)) => {
            result.protocol = Protocol::Udp;
            result.src_port = Some(udp.source_port());
            result.dst_port = Some(udp.destination_port());
        }
        Some(TransportSlice::Icmpv4(_)) if is_v4 => {
            result.protocol = Protocol::Icmp;
        }
        _ => {}
    }

    result
}

/// The lax slicer leaves the payload of a fragmented datagram undecoded, but
/// the fragment at offset zero still starts with the full transport header.
/// Later fragments carry no header and stay undecoded.
fn first_fragment_transport<'a>(net: &LaxNetSlice<'a>) -> Option<TransportSlice<'a>> {
    let payload: &LaxIpPayloadSlice<'a> = match net {
        LaxNetSlice::Ipv4(ipv4) if ipv4.header().fragments_offset() == IpFragOffset::ZERO => {
            ipv4.payload()
        }
        LaxNetSlice::Ipv6(ipv6) if is_first_ipv6_fragment(ipv6) => ipv6.payload(),
        _ => return None,
    };
    if !payload.fragmented {
        return None;
    }

    match payload.ip_number {
        IpNumber::TCP => TcpSlice::from_slice(payload.payload)
            .ok()
            .map(TransportSlice::Tcp),
        // The UDP length field covers the reassembled datagram.
        IpNumber::UDP => UdpSlice::from_slice_lax(payload.payload)
            .ok()
            .map(TransportSlice::Udp),
        IpNumber::ICMP => Icmpv4Slice::from_slice(payload.payload)
            .ok()
            .map(TransportSlice::Icmpv4),
        _ => None,
    }
}

fn is_first_ipv6_fragment(ipv6: &LaxIpv6Slice<'_>) -> bool {
    ipv6.extensions().clone().into_iter().all(|ext| match ext {
        Ipv6ExtensionSlice::Fragment(fragment) => fragment.fragment_offset() == IpFragOffset::ZERO,
        _ => true,
    })
}

/// Decode as far as the headers allow. Truncated or malformed upper layers
/// leave the lower ones intact.
fn slice(link_type: i32, data: &[u8]) -> Option<LaxSlicedPacket<'_>> {
    match link_type {
        LINKTYPE_ETHERNET => LaxSlicedPacket::from_ethernet(data).ok(),
        LINKTYPE_RAW | LINKTYPE_RAW_BSD | LINKTYPE_IPV4 | LINKTYPE_IPV6 => {
            LaxSlicedPacket::from_ip(data).ok()
        }
        LINKTYPE_LINUX_SLL if data.len() >= SLL_HEADER_LEN => {
            let ether_type = u16::from_be_bytes([data[14], data[15]]);
            Some(LaxSlicedPacket::from_ether_type(
                EtherType(ether_type),
                &data[SLL_HEADER_LEN..],
            ))
        }
        // BSD loopback: a host-order address family word precedes the IP header.
        LINKTYPE_NULL if data.len() > NULL_HEADER_LEN => {
            LaxSlicedPacket::from_ip(&data[NULL_HEADER_LEN..]).ok()
        }
        _ => None,
    }
}
