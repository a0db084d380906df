//! DHCP (BOOTP) client-side wire format.
//!
//! The parse side covers what a client consumes (server replies: Offer,
//! Ack, Nak); the builder covers what a client emits (Discover, Request).

use core::net::Ipv4Addr;

use super::ethernet::MacAddr;
use super::{ensure_len, PacketError};
use crate::util::locate;

pub const DHCP_MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

pub const DHCP_MSG_DISCOVER: u8 = 1;
pub const DHCP_MSG_OFFER: u8 = 2;
pub const DHCP_MSG_REQUEST: u8 = 3;
pub const DHCP_MSG_ACK: u8 = 5;
pub const DHCP_MSG_NAK: u8 = 6;

pub const DHCP_OPT_PAD: u8 = 0;
pub const DHCP_OPT_SUBNET_MASK: u8 = 1;
pub const DHCP_OPT_ROUTER: u8 = 3;
pub const DHCP_OPT_DNS_SERVER: u8 = 6;
pub const DHCP_OPT_HOSTNAME: u8 = 12;
pub const DHCP_OPT_REQUESTED_IP: u8 = 50;
pub const DHCP_OPT_LEASE_TIME: u8 = 51;
pub const DHCP_OPT_MESSAGE_TYPE: u8 = 53;
pub const DHCP_OPT_SERVER_ID: u8 = 54;
pub const DHCP_OPT_PARAM_REQUEST: u8 = 55;
pub const DHCP_OPT_RENEWAL_TIME: u8 = 58;
pub const DHCP_OPT_CLIENT_ID: u8 = 61;
pub const DHCP_OPT_END: u8 = 255;

const BOOTP_FIXED_LEN: usize = 236;

/// Options a client cares about, pulled out of the TLV walk.
///
/// Anything missing, truncated, or unknown simply stays `None`; malformed
/// trailing data ends the walk with whatever was collected so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DhcpOptions {
    pub message_type: Option<u8>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    pub dns_server: Option<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
    pub lease_secs: Option<u32>,
    pub renewal_secs: Option<u32>,
}

fn opt_ipv4(data: &[u8]) -> Option<Ipv4Addr> {
    (data.len() >= 4).then(|| Ipv4Addr::new(data[0], data[1], data[2], data[3]))
}

fn opt_u32(data: &[u8]) -> Option<u32> {
    (data.len() >= 4).then(|| u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

#[derive(Clone, Copy, Debug)]
pub struct DhcpMessage<'a> {
    data: &'a [u8],
    options_start: usize,
}

impl<'a> DhcpMessage<'a> {
    /// Parses a BOOTP message from a UDP payload. The options region is
    /// found by locating the magic cookie at (or, for odd servers, after)
    /// the end of the fixed fields.
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, BOOTP_FIXED_LEN + DHCP_MAGIC_COOKIE.len())?;
        let cookie = locate(&data[BOOTP_FIXED_LEN..], &DHCP_MAGIC_COOKIE)
            .ok_or(PacketError::Malformed("DHCP magic cookie missing"))?;
        Ok(Self {
            data,
            options_start: BOOTP_FIXED_LEN + cookie + DHCP_MAGIC_COOKIE.len(),
        })
    }

    pub fn op(&self) -> u8 {
        self.data[0]
    }

    pub fn xid(&self) -> [u8; 4] {
        self.data[4..8].try_into().unwrap()
    }

    pub fn flags(&self) -> u16 {
        u16::from_be_bytes([self.data[10], self.data[11]])
    }

    /// Client address (meaningful on renewals).
    pub fn ciaddr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    /// "Your" address: the lease the server is offering or confirming.
    pub fn yiaddr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }

    pub fn chaddr(&self) -> MacAddr {
        MacAddr(self.data[28..34].try_into().unwrap())
    }

    /// Walks the TLV options. Fail-soft: a truncated option ends the walk
    /// and everything gathered up to that point is returned.
    pub fn options(&self) -> DhcpOptions {
        let mut opts = DhcpOptions::default();
        let data = self.data;
        let mut at = self.options_start;
        while at < data.len() {
            let code = data[at];
            at += 1;
            match code {
                DHCP_OPT_END => break,
                DHCP_OPT_PAD => continue,
                _ => {}
            }
            let Some(&len) = data.get(at) else { break };
            at += 1;
            let Some(value) = data.get(at..at + len as usize) else {
                break;
            };
            at += len as usize;
            match code {
                DHCP_OPT_MESSAGE_TYPE => opts.message_type = value.first().copied(),
                DHCP_OPT_SUBNET_MASK => opts.subnet_mask = opt_ipv4(value),
                DHCP_OPT_ROUTER => opts.router = opt_ipv4(value),
                DHCP_OPT_DNS_SERVER => opts.dns_server = opt_ipv4(value),
                DHCP_OPT_SERVER_ID => opts.server_id = opt_ipv4(value),
                DHCP_OPT_LEASE_TIME => opts.lease_secs = opt_u32(value),
                DHCP_OPT_RENEWAL_TIME => opts.renewal_secs = opt_u32(value),
                _ => {}
            }
        }
        opts
    }
}

/// Builds the BOOTP payload for a client-originated Discover or Request.
pub struct DhcpClientMessageBuilder<'a> {
    pub message_type: u8,
    pub xid: [u8; 4],
    pub client_mac: MacAddr,
    /// Current address, sent in `ciaddr` when renewing; 0.0.0.0 otherwise.
    pub client_ip: Ipv4Addr,
    pub requested_ip: Option<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
    pub requested_lease_secs: Option<u32>,
    pub hostname: Option<&'a str>,
    pub parameter_request: &'a [u8],
}

impl<'a> DhcpClientMessageBuilder<'a> {
    pub fn build_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; BOOTP_FIXED_LEN];
        out[0] = 1; // BOOTREQUEST
        out[1] = 1; // Ethernet
        out[2] = 6;
        out[4..8].copy_from_slice(&self.xid);
        out[12..16].copy_from_slice(&self.client_ip.octets());
        out[28..34].copy_from_slice(&self.client_mac.0);
        out.extend_from_slice(&DHCP_MAGIC_COOKIE);

        out.extend_from_slice(&[DHCP_OPT_MESSAGE_TYPE, 1, self.message_type]);
        out.extend_from_slice(&[DHCP_OPT_CLIENT_ID, 7, 1]);
        out.extend_from_slice(&self.client_mac.0);
        if !self.parameter_request.is_empty() {
            out.extend_from_slice(&[DHCP_OPT_PARAM_REQUEST, self.parameter_request.len() as u8]);
            out.extend_from_slice(self.parameter_request);
        }
        if let Some(secs) = self.requested_lease_secs {
            out.extend_from_slice(&[DHCP_OPT_LEASE_TIME, 4]);
            out.extend_from_slice(&secs.to_be_bytes());
        }
        if let Some(ip) = self.requested_ip {
            out.extend_from_slice(&[DHCP_OPT_REQUESTED_IP, 4]);
            out.extend_from_slice(&ip.octets());
        }
        if let Some(ip) = self.server_id {
            out.extend_from_slice(&[DHCP_OPT_SERVER_ID, 4]);
            out.extend_from_slice(&ip.octets());
        }
        if let Some(name) = self.hostname.filter(|name| !name.is_empty()) {
            let name = &name.as_bytes()[..name.len().min(255)];
            out.extend_from_slice(&[DHCP_OPT_HOSTNAME, name.len() as u8]);
            out.extend_from_slice(name);
        }
        out.push(DHCP_OPT_END);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_payload(xid: [u8; 4], yiaddr: Ipv4Addr, extra_opts: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; BOOTP_FIXED_LEN];
        out[0] = 2; // BOOTREPLY
        out[4..8].copy_from_slice(&xid);
        out[16..20].copy_from_slice(&yiaddr.octets());
        out.extend_from_slice(&DHCP_MAGIC_COOKIE);
        out.extend_from_slice(extra_opts);
        out.push(DHCP_OPT_END);
        out
    }

    #[test]
    fn discover_round_trips() {
        let msg = DhcpClientMessageBuilder {
            message_type: DHCP_MSG_DISCOVER,
            xid: [0xde, 0xad, 0xbe, 0xef],
            client_mac: MacAddr([2, 0, 0, 0, 0, 9]),
            client_ip: Ipv4Addr::UNSPECIFIED,
            requested_ip: None,
            server_id: None,
            requested_lease_secs: Some(7_776_000),
            hostname: Some("unit"),
            parameter_request: &[1, 3, 6, 15],
        }
        .build_vec();
        let parsed = DhcpMessage::parse(&msg).unwrap();
        assert_eq!(parsed.op(), 1);
        assert_eq!(parsed.xid(), [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parsed.chaddr(), MacAddr([2, 0, 0, 0, 0, 9]));
        assert_eq!(parsed.options().message_type, Some(DHCP_MSG_DISCOVER));
    }

    #[test]
    fn offer_options_parse() {
        let payload = offer_payload(
            [1, 2, 3, 4],
            Ipv4Addr::new(192, 168, 1, 77),
            &[
                53, 1, 2, // offer
                54, 4, 10, 0, 0, 1, // server id
                1, 4, 255, 255, 255, 0, // subnet
                3, 4, 192, 168, 1, 1, // router
                51, 4, 0x00, 0x01, 0x51, 0x80, // lease 86400
            ],
        );
        let parsed = DhcpMessage::parse(&payload).unwrap();
        assert_eq!(parsed.yiaddr(), Ipv4Addr::new(192, 168, 1, 77));
        let opts = parsed.options();
        assert_eq!(opts.message_type, Some(DHCP_MSG_OFFER));
        assert_eq!(opts.server_id, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(opts.subnet_mask, Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(opts.router, Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(opts.lease_secs, Some(86_400));
        assert_eq!(opts.renewal_secs, None);
    }

    #[test]
    fn truncated_option_fails_soft() {
        // Message type parses, then a length byte pointing past the end.
        let mut payload = offer_payload([0; 4], Ipv4Addr::UNSPECIFIED, &[53, 1, 5]);
        payload.pop(); // drop the END marker
        payload.extend_from_slice(&[54, 200]); // claims 200 bytes, has none
        let parsed = DhcpMessage::parse(&payload).unwrap();
        let opts = parsed.options();
        assert_eq!(opts.message_type, Some(DHCP_MSG_ACK));
        assert_eq!(opts.server_id, None);
    }

    #[test]
    fn missing_cookie_rejected() {
        let mut payload = vec![0u8; BOOTP_FIXED_LEN + 8];
        payload[0] = 2;
        assert_eq!(
            DhcpMessage::parse(&payload).unwrap_err(),
            PacketError::Malformed("DHCP magic cookie missing")
        );
    }
}
