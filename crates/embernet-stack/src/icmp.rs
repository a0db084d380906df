//! ICMP echo: answer pings, and send best-effort requests (no reply
//! correlation or timeout tracking).

use core::net::Ipv4Addr;

use embernet_packetlib::packet::{
    EthernetFrame, IcmpEcho, IcmpEchoBuilder, Ipv4Packet, MacAddr, ICMP_ECHO_REPLY,
    ICMP_ECHO_REQUEST, IPPROTO_ICMP,
};
use tracing::debug;

use crate::adapter::Adapter;
use crate::StackError;

const PING_PAYLOAD: &[u8] = b"abcdefghijklmnopqrstuvwabcdefghi";

impl Adapter {
    pub(crate) fn handle_icmp(&self, eth: EthernetFrame<'_>, ip: Ipv4Packet<'_>) {
        let Ok(echo) = IcmpEcho::parse(ip.payload()) else {
            return;
        };
        match echo.icmp_type() {
            ICMP_ECHO_REQUEST => self.send_ping_reply(eth.src_mac(), ip.src(), echo),
            ICMP_ECHO_REPLY => debug!(from = %ip.src(), "ping reply received"),
            _ => {}
        }
    }

    fn send_ping_reply(&self, dst_mac: MacAddr, dst_ip: Ipv4Addr, echo: IcmpEcho<'_>) {
        let (our_ip, gateway_mac) = {
            let st = self.state();
            (st.ip, st.gateway_mac)
        };
        let (Some(our_ip), Some(_)) = (our_ip, gateway_mac) else {
            return;
        };
        debug!(to = %dst_ip, "answering ping");
        let reply =
            IcmpEchoBuilder::echo_reply(echo.identifier(), echo.sequence(), echo.payload())
                .build_vec();
        match self.build_ipv4_frame(dst_mac, our_ip, dst_ip, IPPROTO_ICMP, 64, &reply) {
            Ok(frame) => self.transmit(&frame),
            Err(err) => debug!(%err, "ping reply build failed"),
        }
    }

    /// Fires a single echo request at `target`. Best effort: nothing
    /// correlates the reply beyond the debug log when it shows up.
    pub fn send_ping(&self, target: Ipv4Addr) -> Result<(), StackError> {
        let (our_ip, gateway_mac) = {
            let st = self.state();
            (st.ip, st.gateway_mac)
        };
        let (Some(our_ip), Some(gateway_mac)) = (our_ip, gateway_mac) else {
            return Err(StackError::NotReady(
                "ping needs a local address and a resolved gateway",
            ));
        };
        let request = IcmpEchoBuilder::echo_request(0x0001, 1, PING_PAYLOAD).build_vec();
        let frame =
            self.build_ipv4_frame(gateway_mac, our_ip, target, IPPROTO_ICMP, 64, &request)?;
        self.driver().send_frame(&frame)?;
        Ok(())
    }
}
