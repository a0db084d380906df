#![allow(dead_code)]

//! Shared scaffolding for the integration tests: a statically configured
//! adapter over the in-memory test driver, plus hand-built inbound frames.

use core::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use embernet_link::TestDriver;
use embernet_packetlib::packet::{
    ArpPacketBuilder, EthernetFrame, EthernetFrameBuilder, Ipv4Packet, Ipv4PacketBuilder, MacAddr,
    TcpFlags, TcpSegment, TcpSegmentBuilder, UdpPacket, UdpPacketBuilder, ARP_OP_REPLY,
    ETHERTYPE_ARP, ETHERTYPE_IPV4, IPPROTO_TCP, IPPROTO_UDP,
};
use embernet_stack::{Adapter, AdapterConfig};

pub const OUR_MAC: MacAddr = MacAddr([0x02, 0x10, 0x20, 0x30, 0x40, 0x50]);
pub const GW_MAC: MacAddr = MacAddr([0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f]);
pub const PEER_MAC: MacAddr = MacAddr([0x36, 0x35, 0x34, 0x33, 0x32, 0x31]);

pub const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);
pub const GW_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

pub fn static_config() -> AdapterConfig {
    AdapterConfig {
        mac: OUR_MAC,
        name: "unit".into(),
        dhcp: false,
        ip: Some(OUR_IP),
        subnet_mask: Some(Ipv4Addr::new(255, 255, 255, 0)),
        gateway: Some(GW_IP),
        dns_server: Some(GW_IP),
        dns_server_2: None,
    }
}

/// An adapter with a static address over a fresh [`TestDriver`]. The
/// gateway MAC starts unresolved; see [`resolve_gateway`].
pub fn static_adapter() -> (Arc<Adapter>, Arc<TestDriver>) {
    adapter_with(static_config())
}

pub fn adapter_with(cfg: AdapterConfig) -> (Arc<Adapter>, Arc<TestDriver>) {
    let driver = Arc::new(TestDriver::new());
    let adapter = Adapter::new(cfg, driver.clone());
    (adapter, driver)
}

/// Feeds the adapter the gateway's ARP reply so the gateway MAC resolves.
pub fn resolve_gateway(adapter: &Arc<Adapter>) {
    let frame = arp_reply_frame(GW_MAC, GW_IP, OUR_MAC, OUR_IP);
    adapter.frame_arrived(&frame, 0);
    assert_eq!(adapter.gateway_mac(), Some(GW_MAC));
}

pub fn arp_reply_frame(
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let arp = ArpPacketBuilder {
        opcode: ARP_OP_REPLY,
        sender_mac,
        sender_ip,
        target_mac,
        target_ip,
    }
    .build_vec();
    EthernetFrameBuilder {
        dest_mac: target_mac,
        src_mac: sender_mac,
        ethertype: ETHERTYPE_ARP,
        payload: &arp,
    }
    .build_vec()
}

pub fn wrap_ipv4_eth(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    protocol: u8,
    payload: &[u8],
) -> Vec<u8> {
    let ip = Ipv4PacketBuilder {
        src: src_ip,
        dst: dst_ip,
        protocol,
        identification: 99,
        ttl: 64,
        payload,
    }
    .build_vec()
    .expect("build IPv4");
    EthernetFrameBuilder {
        dest_mac: dst_mac,
        src_mac,
        ethertype: ETHERTYPE_IPV4,
        payload: &ip,
    }
    .build_vec()
}

pub fn udp_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp = UdpPacketBuilder {
        src_port,
        dst_port,
        payload,
        compute_checksum: true,
    }
    .build_vec(src_ip, dst_ip)
    .expect("build UDP");
    wrap_ipv4_eth(src_mac, dst_mac, src_ip, dst_ip, IPPROTO_UDP, &udp)
}

#[allow(clippy::too_many_arguments)]
pub fn tcp_frame(
    src_mac: MacAddr,
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    let segment = TcpSegmentBuilder {
        payload,
        ..TcpSegmentBuilder::control(src_port, dst_port, seq, ack, flags, 65535)
    }
    .build_vec(src_ip, OUR_IP)
    .expect("build TCP");
    wrap_ipv4_eth(src_mac, OUR_MAC, src_ip, OUR_IP, IPPROTO_TCP, &segment)
}

/// Pulls the transport payload out of a transmitted frame.
pub fn ipv4_payload(frame: &[u8]) -> (Ipv4HeaderInfo, Vec<u8>) {
    let eth = EthernetFrame::parse(frame).expect("ethernet");
    assert_eq!(eth.ethertype(), ETHERTYPE_IPV4);
    let ip = Ipv4Packet::parse(eth.payload()).expect("ipv4");
    (
        Ipv4HeaderInfo {
            dest_mac: eth.dest_mac(),
            src_mac: eth.src_mac(),
            src: ip.src(),
            dst: ip.dst(),
            protocol: ip.protocol(),
        },
        ip.payload().to_vec(),
    )
}

pub struct Ipv4HeaderInfo {
    pub dest_mac: MacAddr,
    pub src_mac: MacAddr,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
}

pub struct TcpFrameInfo {
    pub header: Ipv4HeaderInfo,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
}

pub fn parse_tcp_frame(frame: &[u8]) -> TcpFrameInfo {
    let (header, transport) = ipv4_payload(frame);
    assert_eq!(header.protocol, IPPROTO_TCP);
    let segment = TcpSegment::parse(&transport).expect("tcp");
    TcpFrameInfo {
        src_port: segment.src_port(),
        dst_port: segment.dst_port(),
        seq: segment.seq_number(),
        ack: segment.ack_number(),
        flags: segment.flags(),
        options: segment.options().to_vec(),
        payload: segment.payload().to_vec(),
        header,
    }
}

pub struct UdpFrameInfo {
    pub header: Ipv4HeaderInfo,
    pub src_port: u16,
    pub dst_port: u16,
    pub checksum: u16,
    pub payload: Vec<u8>,
}

pub fn parse_udp_frame(frame: &[u8]) -> UdpFrameInfo {
    let (header, transport) = ipv4_payload(frame);
    assert_eq!(header.protocol, IPPROTO_UDP);
    let udp = UdpPacket::parse(&transport).expect("udp");
    UdpFrameInfo {
        src_port: udp.src_port(),
        dst_port: udp.dst_port(),
        checksum: udp.checksum(),
        payload: udp.payload().to_vec(),
        header,
    }
}

/// Polls the driver until a transmitted frame satisfies `pred`, giving the
/// worker thread up to two seconds. Non-matching frames are discarded.
pub fn wait_for_frame(
    driver: &TestDriver,
    mut pred: impl FnMut(&[u8]) -> bool,
) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        for frame in driver.drain_frames() {
            if pred(&frame) {
                return frame;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for a frame");
        std::thread::sleep(Duration::from_millis(5));
    }
}
