//! DHCP client: Discover → Offer → Request → Ack, renewals on a deadline
//! derived from the lease, and a hard reset on Nack. The pending
//! transaction ID is the sole correlation between our messages and server
//! replies; everything else is discarded silently.

use core::net::Ipv4Addr;

use embernet_packetlib::packet::{
    DhcpClientMessageBuilder, DhcpMessage, DhcpOptions, EthernetFrame, Ipv4Packet, MacAddr,
    UdpPacket, UdpPacketBuilder, DHCP_MSG_ACK, DHCP_MSG_DISCOVER, DHCP_MSG_NAK, DHCP_MSG_OFFER,
    DHCP_MSG_REQUEST, IPPROTO_UDP,
};
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, Millis};

/// Requested lease length: 90 days, in seconds.
const REQUESTED_LEASE_SECS: u32 = 7_776_000;

/// Options we ask the server to fill in: subnet, router, DNS, domain name.
const PARAMETER_REQUEST: [u8; 4] = [1, 3, 6, 15];

pub(crate) struct DhcpClient {
    /// Pending transaction; replies carrying any other ID are ignored.
    xid: Option<[u8; 4]>,
    /// Offered-but-not-committed address. Survives the Ack so renewals can
    /// re-request the same lease.
    pending_ip: Option<Ipv4Addr>,
    pub(crate) renewing: bool,
    renew_at: Option<Millis>,
}

impl DhcpClient {
    pub fn new() -> Self {
        Self {
            xid: None,
            pending_ip: None,
            renewing: false,
            renew_at: None,
        }
    }

    /// Arms the renewal deadline: the renewal-time option at ~105% (the
    /// server already halves the lease for T1), else 75% of the lease.
    fn arm_renewal(&mut self, opts: &DhcpOptions, now: Millis) {
        if let Some(secs) = opts.renewal_secs {
            self.renew_at = Some(now + Millis::from(secs) * 1050);
        }
        if let Some(secs) = opts.lease_secs {
            self.renew_at = Some(now + Millis::from(secs) * 750);
        }
    }
}

impl Adapter {
    /// Called from the poll loop while DHCP is enabled.
    pub(crate) fn dhcp_poll(&self, now: Millis) {
        let have_ip = self.ip().is_some();
        let renewing = {
            let mut dhcp = self.dhcp.lock().unwrap();
            if let Some(deadline) = dhcp.renew_at {
                if now >= deadline {
                    info!("lease renewal due");
                    dhcp.renew_at = None;
                    dhcp.renewing = true;
                    ensure_xid(&mut dhcp.xid);
                }
            }
            dhcp.renewing
        };

        if renewing && have_ip {
            self.send_dhcp_request();
        } else if !have_ip {
            self.send_dhcp_discover();
        }
    }

    pub(crate) fn handle_dhcp(
        &self,
        eth: EthernetFrame<'_>,
        _ip: Ipv4Packet<'_>,
        udp: UdpPacket<'_>,
        now: Millis,
    ) {
        let Ok(msg) = DhcpMessage::parse(udp.payload()) else {
            return;
        };

        // Transaction-ID mismatch is the one and only server filter.
        {
            let dhcp = self.dhcp.lock().unwrap();
            if dhcp.xid != Some(msg.xid()) {
                return;
            }
        }

        let opts = msg.options();
        match opts.message_type {
            Some(DHCP_MSG_OFFER) => {
                debug!(offered = %msg.yiaddr(), "DHCP offer");
                {
                    let mut dhcp = self.dhcp.lock().unwrap();
                    dhcp.pending_ip = Some(msg.yiaddr());
                    dhcp.arm_renewal(&opts, now);
                }
                self.apply_dhcp_options(&opts, eth.src_mac());
                self.send_dhcp_request();
            }
            Some(DHCP_MSG_ACK) => {
                self.apply_dhcp_options(&opts, eth.src_mac());
                {
                    let mut dhcp = self.dhcp.lock().unwrap();
                    dhcp.arm_renewal(&opts, now);
                    dhcp.xid = None;
                    dhcp.renewing = false;
                    let mut st = self.state();
                    st.ip = dhcp.pending_ip.or(st.ip);
                }
                let (ip, gateway) = {
                    let st = self.state();
                    (st.ip, st.gateway)
                };
                info!(?ip, ?gateway, "DHCP lease committed");
                self.release_startup();
                if let Some(gateway) = gateway {
                    // Confirm the provisional gateway MAC.
                    self.send_arp_probe(gateway);
                }
            }
            Some(DHCP_MSG_NAK) => {
                warn!("DHCP NAK; dropping address and re-discovering");
                {
                    let mut dhcp = self.dhcp.lock().unwrap();
                    dhcp.xid = None;
                    dhcp.renewing = false;
                    dhcp.pending_ip = None;
                }
                let mut st = self.state();
                st.ip = None;
                st.gateway = None;
                st.gateway_mac = None;
            }
            _ => {}
        }
    }

    /// Server/router/DNS/subnet options mutate the shared configuration.
    /// The frame's source MAC becomes the provisional gateway MAC until an
    /// ARP probe confirms it.
    fn apply_dhcp_options(&self, opts: &DhcpOptions, server_mac: MacAddr) {
        let mut st = self.state();
        if let Some(server) = opts.server_id {
            st.gateway = Some(server);
        }
        if let Some(dns) = opts.dns_server {
            st.dns = Some(dns);
        }
        if let Some(mask) = opts.subnet_mask {
            st.subnet_mask = Some(mask);
        }
        if let Some(router) = opts.router {
            st.gateway = Some(router);
        }
        st.gateway_mac = Some(server_mac);
    }

    pub(crate) fn send_dhcp_discover(&self) {
        let xid = {
            let mut dhcp = self.dhcp.lock().unwrap();
            dhcp.pending_ip = None;
            ensure_xid(&mut dhcp.xid)
        };
        debug!("sending DHCP discover");
        self.send_dhcp_message(DhcpClientMessageBuilder {
            message_type: DHCP_MSG_DISCOVER,
            xid,
            client_mac: self.mac(),
            client_ip: Ipv4Addr::UNSPECIFIED,
            requested_ip: None,
            server_id: None,
            requested_lease_secs: Some(REQUESTED_LEASE_SECS),
            hostname: self.hostname_option(),
            parameter_request: &PARAMETER_REQUEST,
        });
    }

    pub(crate) fn send_dhcp_request(&self) {
        let (xid, pending, st) = {
            let mut dhcp = self.dhcp.lock().unwrap();
            let xid = ensure_xid(&mut dhcp.xid);
            (xid, dhcp.pending_ip, *self.state())
        };
        let (Some(pending), Some(server)) = (pending, st.gateway) else {
            warn!("DHCP request without a pending offer; waiting for the next discover");
            return;
        };
        // Renewals carry our committed address in ciaddr.
        let client_ip = match (st.gateway_mac, st.ip) {
            (Some(_), Some(ip)) => ip,
            _ => Ipv4Addr::UNSPECIFIED,
        };
        debug!(requested = %pending, "sending DHCP request");
        self.send_dhcp_message(DhcpClientMessageBuilder {
            message_type: DHCP_MSG_REQUEST,
            xid,
            client_mac: self.mac(),
            client_ip,
            requested_ip: Some(pending),
            server_id: Some(server),
            requested_lease_secs: None,
            hostname: self.hostname_option(),
            parameter_request: &PARAMETER_REQUEST,
        });
    }

    fn hostname_option(&self) -> Option<&str> {
        let name = self.device_name();
        (!name.is_empty()).then_some(name)
    }

    fn send_dhcp_message(&self, builder: DhcpClientMessageBuilder<'_>) {
        let payload = builder.build_vec();
        let datagram = UdpPacketBuilder {
            src_port: 68,
            dst_port: 67,
            payload: &payload,
            compute_checksum: false,
        }
        .build_vec(Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST);
        let datagram = match datagram {
            Ok(datagram) => datagram,
            Err(err) => {
                debug!(%err, "DHCP datagram build failed");
                return;
            }
        };
        match self.build_ipv4_frame(
            MacAddr::BROADCAST,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::BROADCAST,
            IPPROTO_UDP,
            64,
            &datagram,
        ) {
            Ok(frame) => self.transmit(&frame),
            Err(err) => debug!(%err, "DHCP frame build failed"),
        }
    }
}

fn ensure_xid(slot: &mut Option<[u8; 4]>) -> [u8; 4] {
    *slot.get_or_insert_with(rand::random)
}
