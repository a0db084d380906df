//! ARP: answer who-has requests for our address, learn the gateway MAC
//! from replies, and announce/probe on the adapter's poll cadence. There
//! is no retry state here; the periodic poll is the retry.

use core::net::Ipv4Addr;

use embernet_packetlib::packet::{
    ArpPacket, ArpPacketBuilder, EthernetFrame, EthernetFrameBuilder, MacAddr, ARP_OP_REPLY,
    ARP_OP_REQUEST, ETHERTYPE_ARP,
};
use tracing::{debug, warn};

use crate::adapter::Adapter;

impl Adapter {
    pub(crate) fn handle_arp(&self, eth: EthernetFrame<'_>) {
        let Some(our_ip) = self.ip() else {
            return;
        };
        let Ok(arp) = ArpPacket::parse(eth.payload()) else {
            return;
        };

        match arp.opcode() {
            ARP_OP_REQUEST => {
                if arp.target_ip() != our_ip {
                    return;
                }
                // Requesters put all-zeroes, all-ones, or our MAC in the
                // target slot; answer all three.
                let target = arp.target_mac();
                if target.is_zero() || target.is_broadcast() || target == self.mac() {
                    self.send_arp_reply(arp.sender_mac(), arp.sender_ip());
                }
            }
            ARP_OP_REPLY => {
                if arp.sender_ip() == our_ip && arp.sender_mac() != self.mac() {
                    warn!(
                        claimed_by = %arp.sender_mac(),
                        "another host answers for our address; stopping"
                    );
                    self.stop();
                    return;
                }

                let gateway = self.state().gateway;
                if gateway == Some(arp.sender_ip()) {
                    let release = {
                        let mut st = self.state();
                        let first_static_resolution =
                            st.gateway_mac.is_none() && !self.cfg.dhcp && st.ip.is_some();
                        st.gateway_mac = Some(arp.sender_mac());
                        first_static_resolution
                    };
                    debug!(mac = %arp.sender_mac(), "gateway MAC updated from ARP");
                    if release {
                        // Static setups can't do anything until the gateway
                        // resolves; this unblocks `start`.
                        self.release_startup();
                    }
                }
            }
            _ => {}
        }
    }

    fn send_arp(&self, dest_mac: MacAddr, builder: ArpPacketBuilder) {
        let payload = builder.build_vec();
        let frame = EthernetFrameBuilder {
            dest_mac,
            src_mac: self.mac(),
            ethertype: ETHERTYPE_ARP,
            payload: &payload,
        }
        .build_vec();
        self.transmit(&frame);
    }

    fn send_arp_reply(&self, requester_mac: MacAddr, requester_ip: Ipv4Addr) {
        let our_ip = self.ip().unwrap_or(Ipv4Addr::UNSPECIFIED);
        self.send_arp(
            requester_mac,
            ArpPacketBuilder {
                opcode: ARP_OP_REPLY,
                sender_mac: self.mac(),
                sender_ip: our_ip,
                target_mac: requester_mac,
                target_ip: requester_ip,
            },
        );
    }

    /// Broadcast announcing our own IP/MAC binding; sent after address
    /// acquisition and on every poll while an address is held.
    pub(crate) fn send_gratuitous_arp(&self) {
        let our_ip = self.ip().unwrap_or(Ipv4Addr::UNSPECIFIED);
        self.send_arp(
            MacAddr::BROADCAST,
            ArpPacketBuilder {
                opcode: ARP_OP_REQUEST,
                sender_mac: self.mac(),
                sender_ip: our_ip,
                target_mac: MacAddr::ZERO,
                target_ip: our_ip,
            },
        );
    }

    /// Broadcast who-has for `target`; used for gateway resolution and
    /// periodic re-confirmation.
    pub(crate) fn send_arp_probe(&self, target: Ipv4Addr) {
        let our_ip = self.ip().unwrap_or(Ipv4Addr::UNSPECIFIED);
        self.send_arp(
            MacAddr::BROADCAST,
            ArpPacketBuilder {
                opcode: ARP_OP_REQUEST,
                sender_mac: self.mac(),
                sender_ip: our_ip,
                target_mac: MacAddr::BROADCAST,
                target_ip: target,
            },
        );
    }
}
