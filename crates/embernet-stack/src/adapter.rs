use core::net::Ipv4Addr;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use embernet_link::EthernetDriver;
use embernet_packetlib::packet::{
    EthernetFrame, EthernetFrameBuilder, Ipv4Packet, Ipv4PacketBuilder, MacAddr, TcpSegment,
    UdpPacket, ETHERTYPE_ARP, ETHERTYPE_IPV4, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP,
};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{AdapterConfig, NetState};
use crate::dhcp::DhcpClient;
use crate::dns::DnsClient;
use crate::http::HttpRequest;
use crate::tcp::{connection_id, TcpEvent, TcpTable};
use crate::udp::UdpEvent;
use crate::StackError;

/// Monotonic milliseconds since the adapter came up. All protocol logic is
/// expressed against this clock so tests can drive it explicitly.
pub type Millis = u64;

const POLL_INTERVAL_MS: Millis = 10_000;
const MAINTENANCE_TICK: Duration = Duration::from_millis(250);
const STARTUP_TIMEOUT_MS: u64 = 10_000;

const MDNS_PORT: u16 = 5353;
const LLMNR_PORT: u16 = 5355;
const NETBIOS_PORT: u16 = 137;
const DNS_PORT: u16 = 53;
const DHCP_CLIENT_PORT: u16 = 68;

type Handler<T> = Mutex<Option<Box<dyn Fn(T) + Send>>>;

#[derive(Default)]
struct Handlers {
    tcp: Handler<TcpEvent>,
    udp: Handler<UdpEvent>,
    http: Handler<HttpRequest>,
    dns: Mutex<Option<Box<dyn Fn(&str, Ipv4Addr) + Send>>>,
}

/// The orchestrator: owns the network configuration, demultiplexes inbound
/// frames to the protocol handlers, and polls DHCP/ARP state.
pub struct Adapter {
    pub(crate) cfg: AdapterConfig,
    weak_self: Weak<Adapter>,
    driver: Arc<dyn EthernetDriver>,
    state: Mutex<NetState>,
    pub(crate) tcp: TcpTable,
    pub(crate) dhcp: Mutex<DhcpClient>,
    pub(crate) dns: DnsClient,
    handlers: Handlers,
    listening: Mutex<HashSet<u16>>,
    ready: Mutex<bool>,
    ready_cv: Condvar,
    ident: AtomicU16,
    ephemeral: AtomicU16,
    epoch: Instant,
    running: AtomicBool,
    poll_asap: AtomicBool,
}

impl Adapter {
    /// Builds an adapter without spawning the maintenance thread or
    /// blocking for an address; tests (and embedders with their own
    /// scheduler) drive it through [`Adapter::frame_arrived`] and
    /// [`Adapter::poll`] directly.
    pub fn new(mut cfg: AdapterConfig, driver: Arc<dyn EthernetDriver>) -> Arc<Self> {
        cfg.name = cfg.name.trim().to_ascii_lowercase();
        let state = NetState::from_config(&cfg);
        // Ephemeral ports live in 49152..=65535; start at a random offset
        // so restarts don't replay the same port sequence.
        let first_port = 49152 + rand::thread_rng().gen_range(0..16380u16);
        Arc::new_cyclic(|weak| Self {
            cfg,
            weak_self: weak.clone(),
            driver,
            state: Mutex::new(state),
            tcp: TcpTable::new(),
            dhcp: Mutex::new(DhcpClient::new()),
            dns: DnsClient::new(),
            handlers: Handlers::default(),
            listening: Mutex::new(HashSet::new()),
            ready: Mutex::new(false),
            ready_cv: Condvar::new(),
            ident: AtomicU16::new(1),
            ephemeral: AtomicU16::new(first_port),
            epoch: Instant::now(),
            running: AtomicBool::new(true),
            poll_asap: AtomicBool::new(false),
        })
    }

    /// A strong handle to ourselves, for connection objects and the
    /// maintenance thread. Always succeeds while a method borrow is live.
    pub(crate) fn handle(&self) -> Arc<Adapter> {
        self.weak_self.upgrade().expect("adapter is alive")
    }

    /// Starts networking: spawns the maintenance thread, kicks off address
    /// acquisition, and blocks up to ten seconds for an address (dynamic
    /// path) or the gateway MAC (static path). A timeout is logged, not
    /// fatal; the poll loop keeps retrying.
    pub fn start(cfg: AdapterConfig, driver: Arc<dyn EthernetDriver>) -> Arc<Self> {
        let adapter = Self::new(cfg, driver);
        adapter.spawn_maintenance();
        adapter.poll_asap.store(true, Ordering::SeqCst);

        let st = *adapter.state.lock().unwrap();
        if adapter.cfg.dhcp && (st.dns.is_none() || st.gateway.is_none() || st.ip.is_none()) {
            if !adapter.wait_ready(STARTUP_TIMEOUT_MS) {
                warn!("timed out waiting for DHCP; check the cable and the Ethernet controller");
            }
        } else if !adapter.cfg.dhcp && st.ip.is_some() && st.gateway.is_some() {
            if !adapter.wait_ready(STARTUP_TIMEOUT_MS) {
                warn!("timed out waiting for the gateway to answer ARP");
            }
        } else {
            warn!("networking is not configured to start: set an address or enable DHCP");
        }
        adapter
    }

    /// Stops the maintenance thread and drops the address. Used on
    /// shutdown and when an address conflict is detected.
    pub fn stop(&self) {
        info!("stopping network adapter");
        self.running.store(false, Ordering::SeqCst);
        self.state.lock().unwrap().ip = None;
    }

    fn spawn_maintenance(&self) {
        let weak = self.weak_self.clone();
        let _ = thread::Builder::new()
            .name("embernet-maintenance".into())
            .spawn(move || {
                let mut next_poll: Millis = 0;
                loop {
                    thread::sleep(MAINTENANCE_TICK);
                    let Some(adapter) = weak.upgrade() else { break };
                    if !adapter.running.load(Ordering::SeqCst) {
                        break;
                    }
                    let now = adapter.now_ms();
                    if adapter.poll_asap.swap(false, Ordering::SeqCst) || now >= next_poll {
                        adapter.poll(now);
                        next_poll = now + POLL_INTERVAL_MS;
                    }
                }
            });
    }

    /// One pass of the periodic housekeeping: DHCP discovery/renewal, ARP
    /// resolution of the gateway, and a gratuitous announce of our own
    /// binding. Timers are just another caller of the normal send paths.
    pub fn poll(&self, now: Millis) {
        if !self.driver.link_up() {
            return;
        }

        if self.cfg.dhcp {
            self.dhcp_poll(now);
        }

        let st = *self.state.lock().unwrap();
        if st.ip.is_some() && st.gateway.is_some() && st.gateway_mac.is_none() {
            if let Some(gateway) = st.gateway {
                self.send_arp_probe(gateway);
            }
        }
        if st.ip.is_some() {
            self.send_gratuitous_arp();
        }
    }

    /// Entry point for the driver's link up/down notifications.
    pub fn link_changed(&self, up: bool, _now: Millis) {
        info!(link_up = up, "link state changed");
        let have_ip = self.ip().is_some();
        if up && (!have_ip || self.cfg.dhcp) {
            self.poll_asap.store(true, Ordering::SeqCst);
        } else if up && have_ip && !self.cfg.dhcp && self.gateway().is_some() {
            self.poll_asap.store(true, Ordering::SeqCst);
        } else if !up && self.cfg.dhcp {
            // Renew the lease once the link comes back.
            self.dhcp.lock().unwrap().renewing = true;
            self.poll_asap.store(true, Ordering::SeqCst);
        }
    }

    /// Entry point for the driver's frame delivery. The driver has already
    /// validated the CRC and length; anything we can't parse is dropped
    /// without comment, like throwing back a fish.
    pub fn frame_arrived(&self, frame: &[u8], now: Millis) {
        let Ok(eth) = EthernetFrame::parse(frame) else {
            return;
        };
        match eth.ethertype() {
            ETHERTYPE_ARP => self.handle_arp(eth),
            ETHERTYPE_IPV4 => {
                let Ok(ip) = Ipv4Packet::parse(eth.payload()) else {
                    return;
                };
                match ip.protocol() {
                    IPPROTO_ICMP => self.handle_icmp(eth, ip),
                    IPPROTO_UDP => {
                        let Ok(udp) = UdpPacket::parse(ip.payload()) else {
                            return;
                        };
                        self.dispatch_udp(eth, ip, udp, now);
                    }
                    IPPROTO_TCP => self.dispatch_tcp(eth, ip, now),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn dispatch_udp(
        &self,
        eth: EthernetFrame<'_>,
        ip: Ipv4Packet<'_>,
        udp: UdpPacket<'_>,
        now: Millis,
    ) {
        let named = !self.cfg.name.is_empty();
        let have_ip = self.ip().is_some();
        if udp.dst_port() == DHCP_CLIENT_PORT && self.cfg.dhcp {
            self.handle_dhcp(eth, ip, udp, now);
        } else if udp.dst_port() == NETBIOS_PORT && named && have_ip {
            self.handle_netbios(eth, ip, udp);
        } else if udp.src_port() == DNS_PORT {
            self.handle_dns_response(udp.payload(), now);
        } else if udp.dst_port() == MDNS_PORT && udp.src_port() == MDNS_PORT && named && have_ip {
            self.handle_mdns(ip, udp);
        } else if udp.dst_port() == LLMNR_PORT && named && have_ip {
            self.handle_llmnr(eth, ip, udp);
        } else if have_ip && self.is_listening(udp.dst_port()) {
            self.handle_udp_datagram(ip, udp);
        }
    }

    fn dispatch_tcp(&self, eth: EthernetFrame<'_>, ip: Ipv4Packet<'_>, now: Millis) {
        if self.ip().is_none() {
            return;
        }
        let Ok(tcp) = TcpSegment::parse(ip.payload()) else {
            return;
        };
        let id = connection_id(ip.src(), tcp.src_port(), tcp.dst_port());
        if self.is_listening(tcp.dst_port()) || self.tcp.contains(id) {
            self.handle_tcp_segment(eth, ip, tcp, now);
        }
    }

    // --- listening-port registry -----------------------------------------

    /// Registers interest in a TCP/UDP destination port; inbound traffic
    /// for unregistered ports is ignored unless it belongs to an already
    /// open connection.
    pub fn listen(&self, port: u16) {
        self.listening.lock().unwrap().insert(port);
    }

    pub fn stop_listening(&self, port: u16) {
        self.listening.lock().unwrap().remove(&port);
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.listening.lock().unwrap().contains(&port)
    }

    // --- event-handler registration --------------------------------------

    pub fn set_tcp_handler(&self, handler: impl Fn(TcpEvent) + Send + 'static) {
        *self.handlers.tcp.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn set_udp_handler(&self, handler: impl Fn(UdpEvent) + Send + 'static) {
        *self.handlers.udp.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn set_http_handler(&self, handler: impl Fn(HttpRequest) + Send + 'static) {
        *self.handlers.http.lock().unwrap() = Some(Box::new(handler));
    }

    /// Called for DNS answers that arrive when no synchronous lookup is
    /// waiting on them.
    pub fn set_dns_handler(&self, handler: impl Fn(&str, Ipv4Addr) + Send + 'static) {
        *self.handlers.dns.lock().unwrap() = Some(Box::new(handler));
    }

    pub(crate) fn fire_tcp_event(&self, event: TcpEvent) {
        if let Some(handler) = self.handlers.tcp.lock().unwrap().as_ref() {
            handler(event);
        }
    }

    pub(crate) fn fire_udp_event(&self, event: UdpEvent) {
        if let Some(handler) = self.handlers.udp.lock().unwrap().as_ref() {
            handler(event);
        }
    }

    pub(crate) fn fire_http_event(&self, request: HttpRequest) {
        if let Some(handler) = self.handlers.http.lock().unwrap().as_ref() {
            handler(request);
        }
    }

    pub(crate) fn has_dns_handler(&self) -> bool {
        self.handlers.dns.lock().unwrap().is_some()
    }

    pub(crate) fn fire_dns_event(&self, name: &str, addr: Ipv4Addr) {
        if let Some(handler) = self.handlers.dns.lock().unwrap().as_ref() {
            handler(name, addr);
        }
    }

    // --- shared state accessors ------------------------------------------

    pub(crate) fn state(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap()
    }

    pub fn mac(&self) -> MacAddr {
        self.cfg.mac
    }

    pub fn device_name(&self) -> &str {
        &self.cfg.name
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.state.lock().unwrap().ip
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.state.lock().unwrap().subnet_mask
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.state.lock().unwrap().gateway
    }

    pub fn gateway_mac(&self) -> Option<MacAddr> {
        self.state.lock().unwrap().gateway_mac
    }

    pub fn dns_server(&self) -> Option<Ipv4Addr> {
        self.state.lock().unwrap().dns
    }

    /// Sets a static address. Meaningful before `start` with DHCP off.
    pub fn set_ip(&self, ip: Option<Ipv4Addr>) {
        self.state.lock().unwrap().ip = ip;
    }

    /// True when the PHY reports an established link.
    pub fn connected_to_ethernet(&self) -> bool {
        self.driver.link_up()
    }

    pub fn now_ms(&self) -> Millis {
        self.epoch.elapsed().as_millis().min(u64::MAX as u128) as u64
    }

    // --- startup gate -----------------------------------------------------

    /// Blocks until the address-acquisition condition is released (DHCP
    /// commit, or gateway-MAC resolution on the static path). Returns
    /// whether it was released within the timeout.
    pub fn wait_ready(&self, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut ready = self.ready.lock().unwrap();
        while !*ready {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .ready_cv
                .wait_timeout(ready, deadline - now)
                .unwrap();
            ready = guard;
        }
        true
    }

    pub(crate) fn release_startup(&self) {
        *self.ready.lock().unwrap() = true;
        self.ready_cv.notify_all();
    }

    // --- outbound plumbing ------------------------------------------------

    pub(crate) fn driver(&self) -> &dyn EthernetDriver {
        &*self.driver
    }

    pub(crate) fn next_ident(&self) -> u16 {
        self.ident.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_ephemeral_port(&self) -> u16 {
        let port = self.ephemeral.fetch_add(1, Ordering::Relaxed);
        if port >= 65535 || port < 49152 {
            self.ephemeral.store(49153, Ordering::Relaxed);
            return 49152;
        }
        port
    }

    /// Fire-and-forget transmit used by the inbound handlers; failures are
    /// logged and the frame dropped (a down link drops IO, never queues).
    pub(crate) fn transmit(&self, frame: &[u8]) {
        if let Err(err) = self.driver.send_frame(frame) {
            debug!(%err, "dropping outbound frame");
        }
    }

    /// Builds dst-MAC / IPv4 / payload into one frame.
    pub(crate) fn build_ipv4_frame(
        &self,
        dst_mac: MacAddr,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        protocol: u8,
        ttl: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, StackError> {
        let ip = Ipv4PacketBuilder {
            src: src_ip,
            dst: dst_ip,
            protocol,
            identification: self.next_ident(),
            ttl,
            payload,
        }
        .build_vec()?;
        Ok(EthernetFrameBuilder {
            dest_mac: dst_mac,
            src_mac: self.cfg.mac,
            ethertype: ETHERTYPE_IPV4,
            payload: &ip,
        }
        .build_vec())
    }
}
