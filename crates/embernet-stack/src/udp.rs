//! UDP: dispatch datagrams on registered ports to the application, and
//! send best-effort datagrams with the checksum disabled.

use core::net::Ipv4Addr;

use embernet_packetlib::packet::{Ipv4Packet, UdpPacket, UdpPacketBuilder, IPPROTO_UDP};

use crate::adapter::Adapter;
use crate::StackError;

/// One inbound datagram on a listening port.
#[derive(Clone, Debug)]
pub struct UdpEvent {
    pub content: Vec<u8>,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub local_port: u16,
}

impl Adapter {
    pub(crate) fn handle_udp_datagram(&self, ip: Ipv4Packet<'_>, udp: UdpPacket<'_>) {
        if udp.payload().is_empty() {
            return;
        }
        self.fire_udp_event(UdpEvent {
            content: udp.payload().to_vec(),
            remote_ip: ip.src(),
            remote_port: udp.src_port(),
            local_port: udp.dst_port(),
        });
    }

    /// Sends one datagram. No fragmentation, no checksum (the field is
    /// zero-filled, "checksum disabled" per protocol convention), routed
    /// via the gateway.
    pub fn udp_send(
        &self,
        payload: &[u8],
        dest_ip: Ipv4Addr,
        dest_port: u16,
        src_port: u16,
    ) -> Result<(), StackError> {
        let (our_ip, gateway_mac) = {
            let st = self.state();
            (st.ip, st.gateway_mac)
        };
        let (Some(our_ip), Some(gateway_mac)) = (our_ip, gateway_mac) else {
            return Err(StackError::NotReady(
                "UDP sends need a local address and a resolved gateway",
            ));
        };
        let datagram = UdpPacketBuilder {
            src_port,
            dst_port: dest_port,
            payload,
            compute_checksum: false,
        }
        .build_vec(our_ip, dest_ip)?;
        let frame = self.build_ipv4_frame(gateway_mac, our_ip, dest_ip, IPPROTO_UDP, 64, &datagram)?;
        self.driver().send_frame(&frame)?;
        Ok(())
    }
}
