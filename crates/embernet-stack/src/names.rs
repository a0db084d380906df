//! Local-name responders: mDNS, LLMNR, and NetBIOS name service. Each one
//! is a stateless request/reply matcher against the configured device
//! name; nothing is cached and nothing persists between queries. All three
//! stay quiet until the adapter has both a name and an address.

use core::net::Ipv4Addr;

use embernet_packetlib::packet::{
    encode_qname, netbios, parse_single_question, DnsResponseBuilder, EthernetFrame, Ipv4Packet,
    MacAddr, NbnsQuery, NbnsResponseBuilder, UdpPacket, UdpPacketBuilder, DNS_CLASS_IN,
    DNS_CLASS_IN_CACHE_FLUSH, DNS_FLAG_AUTHORITATIVE, DNS_TYPE_A, IPPROTO_UDP,
};
use tracing::debug;

use crate::adapter::Adapter;

const MDNS_GROUP_IP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_GROUP_MAC: MacAddr = MacAddr([0x01, 0x00, 0x5e, 0x00, 0x00, 0xfb]);
const LLMNR_GROUP_IP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 252);

const MDNS_TTL_SECS: u32 = 120;
const LLMNR_TTL_SECS: u32 = 30;
const NETBIOS_TTL_SECS: u32 = 300;

impl Adapter {
    // --- mDNS -------------------------------------------------------------

    pub(crate) fn handle_mdns(&self, ip: Ipv4Packet<'_>, udp: UdpPacket<'_>) {
        let Ok(question) = parse_single_question(udp.payload()) else {
            return;
        };
        if !question.is_query() {
            return;
        }
        if ip.dst() != MDNS_GROUP_IP {
            return;
        }
        let Ok(name) = question.name() else {
            return;
        };
        if !name.eq_ignore_ascii_case(&format!("{}.local", self.device_name())) {
            return;
        }
        debug!(%name, "answering mDNS query");
        self.send_mdns_reply();
    }

    /// Multicast A-record answer with the cache-flush bit, carrying the
    /// current address.
    fn send_mdns_reply(&self) {
        let Some(our_ip) = self.ip() else {
            return;
        };
        let qname = encode_qname(&format!("{}.local", self.device_name()));
        let dns = DnsResponseBuilder {
            id: 0,
            flags: DNS_FLAG_AUTHORITATIVE,
            echo_question: false,
            qname: &qname,
            qtype: DNS_TYPE_A,
            qclass: DNS_CLASS_IN,
            answer_class: DNS_CLASS_IN_CACHE_FLUSH,
            ttl_secs: MDNS_TTL_SECS,
            addr: our_ip,
        }
        .build_vec();
        self.send_name_reply(MDNS_GROUP_MAC, our_ip, MDNS_GROUP_IP, 5353, 5353, &dns);
    }

    // --- LLMNR ------------------------------------------------------------

    pub(crate) fn handle_llmnr(
        &self,
        eth: EthernetFrame<'_>,
        ip: Ipv4Packet<'_>,
        udp: UdpPacket<'_>,
    ) {
        let Ok(question) = parse_single_question(udp.payload()) else {
            return;
        };
        if !question.is_query() || question.qtype != DNS_TYPE_A {
            return;
        }
        if ip.dst() != LLMNR_GROUP_IP {
            return;
        }
        let Ok(name) = question.name() else {
            return;
        };
        let device = self.device_name();
        if !name.eq_ignore_ascii_case(device)
            && !name.eq_ignore_ascii_case(&format!("{device}.local"))
        {
            return;
        }
        debug!(%name, "answering LLMNR query");

        let Some(our_ip) = self.ip() else {
            return;
        };
        // Unicast back to the querier, echoing its transaction and question.
        let dns = DnsResponseBuilder {
            id: question.id,
            flags: 0,
            echo_question: true,
            qname: question.qname,
            qtype: question.qtype,
            qclass: question.qclass,
            answer_class: DNS_CLASS_IN,
            ttl_secs: LLMNR_TTL_SECS,
            addr: our_ip,
        }
        .build_vec();
        self.send_name_reply(eth.src_mac(), our_ip, ip.src(), 5355, udp.src_port(), &dns);
    }

    // --- NetBIOS name service ---------------------------------------------

    pub(crate) fn handle_netbios(
        &self,
        eth: EthernetFrame<'_>,
        ip: Ipv4Packet<'_>,
        udp: UdpPacket<'_>,
    ) {
        let Ok(query) = NbnsQuery::parse(udp.payload()) else {
            return;
        };
        if !query.is_query() || query.opcode() != 0 {
            return;
        }
        let name = netbios::decode_name(query.encoded_name());
        let name = name.trim().to_ascii_lowercase();
        let device = self.device_name();
        if name != device && name != format!("{device}.local") {
            return;
        }
        debug!(%name, "answering NetBIOS name query");

        let Some(our_ip) = self.ip() else {
            return;
        };
        let reply = NbnsResponseBuilder {
            id: query.id(),
            encoded_name: query.encoded_name(),
            ttl_secs: NETBIOS_TTL_SECS,
            addr: our_ip,
        }
        .build_vec();
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                debug!(%err, "NBNS reply build failed");
                return;
            }
        };
        self.send_name_reply(eth.src_mac(), our_ip, ip.src(), 137, udp.src_port(), &reply);
    }

    // --- shared send path ---------------------------------------------------

    fn send_name_reply(
        &self,
        dst_mac: MacAddr,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) {
        let datagram = UdpPacketBuilder {
            src_port,
            dst_port,
            payload,
            compute_checksum: false,
        }
        .build_vec(src_ip, dst_ip);
        let datagram = match datagram {
            Ok(datagram) => datagram,
            Err(err) => {
                debug!(%err, "name reply build failed");
                return;
            }
        };
        let ttl = if dst_ip.is_multicast() { 255 } else { 64 };
        match self.build_ipv4_frame(dst_mac, src_ip, dst_ip, IPPROTO_UDP, ttl, &datagram) {
            Ok(frame) => self.transmit(&frame),
            Err(err) => debug!(%err, "name reply frame build failed"),
        }
    }
}
