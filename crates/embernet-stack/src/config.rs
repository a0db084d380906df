use core::net::Ipv4Addr;

use embernet_packetlib::packet::MacAddr;

/// Startup configuration handed to [`crate::Adapter::start`].
///
/// With `dhcp` enabled the address fields are filled in by the DHCP
/// exchange; for a static setup, set `ip`, `subnet_mask`, `gateway` and a
/// DNS server yourself and disable `dhcp`.
#[derive(Clone, Debug)]
pub struct AdapterConfig {
    /// The device's globally unique MAC address.
    pub mac: MacAddr,
    /// Local device name answered over mDNS/LLMNR/NetBIOS. Keep it short
    /// (NetBIOS truncates at 15 characters) and leave off any `.local`
    /// suffix. Empty disables the name responders.
    pub name: String,
    pub dhcp: bool,
    pub ip: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    /// Primary DNS server. Overwritten by DHCP when it supplies one.
    pub dns_server: Option<Ipv4Addr>,
    /// Secondary DNS server, tried when the primary times out. Never
    /// assigned automatically.
    pub dns_server_2: Option<Ipv4Addr>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            mac: MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            name: String::new(),
            dhcp: true,
            ip: None,
            subnet_mask: None,
            gateway: None,
            dns_server: None,
            dns_server_2: None,
        }
    }
}

/// Mutable network state shared by every handler, guarded by one mutex on
/// the adapter. DHCP and ARP write it; everything else reads.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct NetState {
    pub ip: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    /// Resolved separately from `gateway`: DHCP supplies the gateway IP
    /// immediately, the MAC only becomes trustworthy once ARP confirms it.
    pub gateway_mac: Option<MacAddr>,
    pub dns: Option<Ipv4Addr>,
    pub dns2: Option<Ipv4Addr>,
}

impl NetState {
    pub fn from_config(cfg: &AdapterConfig) -> Self {
        Self {
            ip: cfg.ip,
            subnet_mask: cfg.subnet_mask,
            gateway: cfg.gateway,
            gateway_mac: None,
            dns: cfg.dns_server,
            dns2: cfg.dns_server_2,
        }
    }
}
