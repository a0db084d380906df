pub mod arp;
pub mod checksum;
pub mod dhcp;
pub mod dns;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod netbios;
pub mod tcp;
pub mod udp;

use core::fmt;

pub use arp::{ArpPacket, ArpPacketBuilder, ARP_OP_REPLY, ARP_OP_REQUEST};
pub use dhcp::{
    DhcpClientMessageBuilder, DhcpMessage, DhcpOptions, DHCP_MSG_ACK, DHCP_MSG_DISCOVER,
    DHCP_MSG_NAK, DHCP_MSG_OFFER, DHCP_MSG_REQUEST,
};
pub use dns::{
    encode_qname, parse_single_question, qname_to_string, DnsQuestion, DnsQueryBuilder, DnsRecord,
    DnsResponse, DnsResponseBuilder, DNS_CLASS_IN, DNS_CLASS_IN_CACHE_FLUSH,
    DNS_FLAG_AUTHORITATIVE, DNS_FLAG_RESPONSE, DNS_TYPE_A,
};
pub use ethernet::{EthernetFrame, EthernetFrameBuilder, MacAddr, ETHERTYPE_ARP, ETHERTYPE_IPV4};
pub use icmp::{IcmpEcho, IcmpEchoBuilder, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST};
pub use ipv4::{Ipv4Packet, Ipv4PacketBuilder, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
pub use netbios::{NbnsQuery, NbnsResponseBuilder};
pub use tcp::{TcpFlags, TcpSegment, TcpSegmentBuilder, TCP_OPT_MSS_1460};
pub use udp::{UdpPacket, UdpPacketBuilder};

/// Error produced by every parser and builder in this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketError {
    /// The input (or output buffer) was shorter than the format requires.
    Truncated { needed: usize, actual: usize },
    /// A field held a value the format does not allow.
    Malformed(&'static str),
    /// A valid-but-unimplemented construct (e.g. compressed DNS names in
    /// places we never expect them).
    Unsupported(&'static str),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::Truncated { needed, actual } => {
                write!(f, "truncated: needed {needed} bytes, had {actual}")
            }
            PacketError::Malformed(what) => write!(f, "malformed: {what}"),
            PacketError::Unsupported(what) => write!(f, "unsupported: {what}"),
        }
    }
}

impl std::error::Error for PacketError {}

pub(crate) fn ensure_len(data: &[u8], needed: usize) -> Result<(), PacketError> {
    if data.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

pub(crate) fn ensure_out_buf_len(out: &[u8], needed: usize) -> Result<(), PacketError> {
    if out.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            actual: out.len(),
        });
    }
    Ok(())
}
