//! A minimal TCP suitable for small request/response workloads: 3-way
//! handshake in both roles, in-order data delivery, FIN/RST teardown, and
//! idle reaping. Deliberately absent, and to stay absent: retransmission
//! timers, out-of-order reassembly, congestion control, and window
//! replenishment (the advertised window only ever shrinks).

use core::net::Ipv4Addr;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use embernet_packetlib::packet::{
    EthernetFrame, Ipv4Packet, MacAddr, TcpFlags, TcpSegment, TcpSegmentBuilder, IPPROTO_TCP,
    TCP_OPT_MSS_1460,
};
use tracing::{debug, warn};

use crate::adapter::{Adapter, Millis};
use crate::http::HttpRequest;
use crate::StackError;

/// Connections with no activity for this long are closed the next time an
/// inbound SYN gives us a reason to sweep the table.
const CONNECTION_IDLE_LIMIT_MS: Millis = 30_000;

const DEFAULT_WINDOW: u16 = 1024;

/// Packs (remote IP, remote port, local port) big-endian into a u64. A
/// pure function of the triple, so both inbound segments and local
/// connection objects derive the same key.
pub fn connection_id(remote_ip: Ipv4Addr, remote_port: u16, local_port: u16) -> u64 {
    (u64::from(u32::from(remote_ip)) << 32)
        | (u64::from(remote_port) << 16)
        | u64::from(local_port)
}

/// Payload delivered on an established connection.
#[derive(Clone)]
pub struct TcpEvent {
    pub content: Vec<u8>,
    /// Sequence position relative to the peer's initial sequence number.
    pub sequence: u32,
    pub connection: Connection,
}

pub(crate) struct ConnState {
    pub remote_mac: MacAddr,
    /// Next sequence number expected from the peer; goes out in our ACKs.
    pub recv_next: u32,
    /// The peer's initial sequence number, the baseline for relative
    /// sequencing in delivered events.
    pub peer_isn: u32,
    /// Our next send sequence number.
    pub send_next: u32,
    /// Advertised receive window. Shrinks with every inbound payload and
    /// is never replenished.
    pub window: u16,
    pub open: bool,
    pub closing: bool,
    /// True between "response finished" and the next HTTP request; gates
    /// HTTP-level delivery.
    pub ready_for_request: bool,
    /// TCP checksum of the last delivered request, the dedup key for
    /// retransmitted requests.
    pub last_request_checksum: Option<u16>,
    pub last_activity: Millis,
}

pub(crate) struct ConnInner {
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub local_port: u16,
    pub state: Mutex<ConnState>,
    pub opened: Condvar,
    handler: Mutex<Option<Box<dyn Fn(TcpEvent) + Send>>>,
}

impl ConnInner {
    fn new(
        remote_ip: Ipv4Addr,
        remote_port: u16,
        local_port: u16,
        isn: u32,
        now: Millis,
    ) -> Self {
        Self {
            remote_ip,
            remote_port,
            local_port,
            state: Mutex::new(ConnState {
                remote_mac: MacAddr::ZERO,
                recv_next: 0,
                peer_isn: 0,
                send_next: isn,
                window: DEFAULT_WINDOW,
                open: false,
                closing: false,
                ready_for_request: false,
                last_request_checksum: None,
                last_activity: now,
            }),
            opened: Condvar::new(),
            handler: Mutex::new(None),
        }
    }

    fn id(&self) -> u64 {
        connection_id(self.remote_ip, self.remote_port, self.local_port)
    }

    fn fire_handler(&self, event: TcpEvent) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(event);
        }
    }
}

/// The global connection table. Structural changes go through this mutex;
/// per-connection fields are guarded by each connection's own lock.
pub(crate) struct TcpTable {
    conns: Mutex<HashMap<u64, Arc<ConnInner>>>,
}

impl TcpTable {
    pub fn new() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.conns.lock().unwrap().contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<Arc<ConnInner>> {
        self.conns.lock().unwrap().get(&id).cloned()
    }

    pub fn insert(&self, id: u64, conn: Arc<ConnInner>) {
        self.conns.lock().unwrap().insert(id, conn);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<ConnInner>> {
        self.conns.lock().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    fn snapshot(&self) -> Vec<(u64, Arc<ConnInner>)> {
        self.conns
            .lock()
            .unwrap()
            .iter()
            .map(|(id, conn)| (*id, Arc::clone(conn)))
            .collect()
    }
}

/// Application handle to one TCP connection. The table exclusively owns
/// the underlying state; handles only reference it.
#[derive(Clone)]
pub struct Connection {
    adapter: Arc<Adapter>,
    inner: Arc<ConnInner>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    pub fn remote_ip(&self) -> Ipv4Addr {
        self.inner.remote_ip
    }

    pub fn remote_port(&self) -> u16 {
        self.inner.remote_port
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().unwrap().open
    }

    pub fn is_closing(&self) -> bool {
        self.inner.state.lock().unwrap().closing
    }

    /// Per-connection delivery callback (in addition to the adapter-wide
    /// TCP event); used to wait for responses on client connections.
    pub fn set_packet_handler(&self, handler: impl Fn(TcpEvent) + Send + 'static) {
        *self.inner.handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn clear_packet_handler(&self) {
        *self.inner.handler.lock().unwrap() = None;
    }

    /// Client-side open: registers in the table, sends a SYN, and blocks
    /// until the handshake completes or the timeout expires. Returns
    /// whether the connection reached Established. Application threads
    /// only; never call from an event handler.
    pub fn open(&self, timeout_secs: u64) -> bool {
        if self.is_open() {
            return true;
        }
        let Some(gateway_mac) = self.adapter.gateway_mac() else {
            warn!("cannot open a connection before the gateway MAC is resolved");
            return false;
        };
        {
            let mut st = self.inner.state.lock().unwrap();
            st.remote_mac = gateway_mac;
        }
        self.adapter.tcp.insert(self.id(), Arc::clone(&self.inner));

        let syn = {
            let st = self.inner.state.lock().unwrap();
            self.adapter.tcp_control_frame(&self.inner, &st, TcpFlags::SYN, true)
        };
        match syn {
            Some(frame) => self.adapter.transmit(&frame),
            None => return false,
        }

        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        let mut st = self.inner.state.lock().unwrap();
        while !st.open {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .inner
                .opened
                .wait_timeout(st, deadline - now)
                .unwrap();
            st = guard;
        }
        st.open
    }

    /// Sends one data segment. Opens the connection first when needed.
    /// Keep buffers small; there is no segmentation here.
    pub fn send(&self, payload: &[u8]) -> Result<(), StackError> {
        let (our_ip, gateway_mac) = {
            let st = self.adapter.state();
            (st.ip, st.gateway_mac)
        };
        let (Some(our_ip), Some(_)) = (our_ip, gateway_mac) else {
            return Err(StackError::NotReady(
                "TCP sends need a local address and a resolved gateway",
            ));
        };
        if payload.is_empty() {
            return Err(StackError::EmptyPayload);
        }
        if self.is_closing() {
            return Err(StackError::ConnectionClosing);
        }
        if !self.is_open() && !self.open(3) {
            return Err(StackError::OpenTimeout);
        }

        let frame = {
            let mut st = self.inner.state.lock().unwrap();
            let segment = TcpSegmentBuilder {
                payload,
                ..TcpSegmentBuilder::control(
                    self.inner.local_port,
                    self.inner.remote_port,
                    st.send_next,
                    st.recv_next,
                    TcpFlags::ACK,
                    DEFAULT_WINDOW,
                )
            }
            .build_vec(our_ip, self.inner.remote_ip)?;
            let frame = self.adapter.build_ipv4_frame(
                st.remote_mac,
                our_ip,
                self.inner.remote_ip,
                IPPROTO_TCP,
                64,
                &segment,
            )?;
            st.send_next = st.send_next.wrapping_add(payload.len() as u32);
            st.last_activity = self.adapter.now_ms();
            frame
        };
        self.adapter.driver().send_frame(&frame)?;
        Ok(())
    }

    /// Starts a close: marks the connection closing and sends FIN/ACK. The
    /// table entry is removed when the peer completes the handshake.
    pub fn close(&self) {
        self.clear_packet_handler();
        let frame = {
            let mut st = self.inner.state.lock().unwrap();
            if st.closing {
                return;
            }
            st.closing = true;
            self.adapter
                .tcp_control_frame(&self.inner, &st, TcpFlags::FIN | TcpFlags::ACK, false)
        };
        if let Some(frame) = frame {
            self.adapter.transmit(&frame);
        }
    }

    pub(crate) fn mark_ready_for_request(&self) {
        self.inner.state.lock().unwrap().ready_for_request = true;
    }
}

impl Adapter {
    /// Creates a client connection object with a fresh ephemeral local
    /// port. Nothing goes on the wire until `open` (or the first `send`).
    pub fn connect(&self, remote_ip: Ipv4Addr, remote_port: u16) -> Connection {
        let inner = Arc::new(ConnInner::new(
            remote_ip,
            remote_port,
            self.next_ephemeral_port(),
            rand::random(),
            self.now_ms(),
        ));
        if let Some(gateway_mac) = self.gateway_mac() {
            inner.state.lock().unwrap().remote_mac = gateway_mac;
        }
        Connection {
            adapter: self.handle(),
            inner,
        }
    }

    pub(crate) fn handle_tcp_segment(
        &self,
        eth: EthernetFrame<'_>,
        ip: Ipv4Packet<'_>,
        tcp: TcpSegment<'_>,
        now: Millis,
    ) {
        let flags = tcp.flags();
        let syn = flags.contains(TcpFlags::SYN);
        let ack = flags.contains(TcpFlags::ACK);
        let fin = flags.contains(TcpFlags::FIN);
        let psh = flags.contains(TcpFlags::PSH);
        let rst = flags.contains(TcpFlags::RST);

        let id = connection_id(ip.src(), tcp.src_port(), tcp.dst_port());
        let seg_seq = tcp.seq_number();
        let payload_len = tcp.payload().len() as u32;

        if syn && !ack {
            self.accept_syn(eth, ip, tcp, id, now);
            return;
        }

        let Some(conn) = self.tcp.get(id) else {
            // Teardown for a connection we no longer know: acknowledge it
            // so the peer stops retransmitting.
            if (fin || rst) && ack {
                self.send_orphan_ack(eth.src_mac(), ip.src(), &tcp);
            }
            return;
        };

        if !(ack || fin || psh || rst) {
            return;
        }

        let mut frames: Vec<Vec<u8>> = Vec::new();
        let mut remove = false;
        let mut notify_open = false;
        let mut deliver = false;
        let peer_isn;
        {
            let mut st = conn.state.lock().unwrap();
            st.last_activity = now;
            // The expected-sequence counter advances by the payload length
            // exactly once per segment, before any flag branching.
            st.recv_next = st.recv_next.wrapping_add(payload_len);
            st.window = st.window.wrapping_sub(payload_len as u16);

            if psh {
                if let Some(frame) = self.tcp_control_frame(&conn, &st, TcpFlags::ACK, false) {
                    frames.push(frame);
                }
                deliver = true;
            } else if syn && ack {
                // Client handshake: the peer answered our SYN.
                st.recv_next = seg_seq.wrapping_add(1);
                st.peer_isn = seg_seq;
                st.send_next = st.send_next.wrapping_add(1);
                if let Some(frame) = self.tcp_control_frame(&conn, &st, TcpFlags::ACK, false) {
                    frames.push(frame);
                }
                st.open = true;
                notify_open = true;
            } else if (fin || rst) && ack {
                st.closing = true;
                st.recv_next = st.recv_next.wrapping_add(1);
                if let Some(frame) = self.tcp_control_frame(&conn, &st, TcpFlags::ACK, false) {
                    frames.push(frame);
                }
                remove = true;
            } else if fin {
                // Symmetric close: a bare FIN still gets FIN+ACK, and the
                // entry stays until the peer ACKs our FIN.
                st.closing = true;
                st.recv_next = st.recv_next.wrapping_add(1);
                if let Some(frame) =
                    self.tcp_control_frame(&conn, &st, TcpFlags::FIN | TcpFlags::ACK, false)
                {
                    frames.push(frame);
                }
            } else if rst {
                st.closing = true;
                st.recv_next = st.recv_next.wrapping_add(1);
            } else if ack && st.closing {
                // Final ACK of the close handshake.
                remove = true;
            } else {
                deliver = true;
            }
            peer_isn = st.peer_isn;
        }

        for frame in &frames {
            self.transmit(frame);
        }
        if remove {
            self.tcp.remove(id);
        }
        if notify_open {
            conn.opened.notify_all();
        }
        if !deliver || tcp.payload().is_empty() {
            return;
        }

        // Data delivery: the TCP-level event always fires ...
        let content = tcp.payload().to_vec();
        let relative_seq = seg_seq.wrapping_sub(peer_isn);
        let connection = Connection {
            adapter: self.handle(),
            inner: Arc::clone(&conn),
        };
        self.fire_tcp_event(TcpEvent {
            content: content.clone(),
            sequence: relative_seq,
            connection: connection.clone(),
        });
        conn.fire_handler(TcpEvent {
            content: content.clone(),
            sequence: relative_seq,
            connection: connection.clone(),
        });

        // ... and the HTTP-level event only for fresh GET/POST requests.
        // Byte comparison, not string decoding: the payload may not be text.
        if content.len() < 10 || (!content.starts_with(b"GET") && !content.starts_with(b"POST")) {
            return;
        }
        let fresh_request = {
            let mut st = conn.state.lock().unwrap();
            if !st.ready_for_request {
                false
            } else if st.last_request_checksum == Some(tcp.checksum()) {
                // Same checksum as the request we already delivered: a
                // retransmission, not a new request.
                debug!("retransmitted request ignored");
                false
            } else {
                st.last_request_checksum = Some(tcp.checksum());
                st.ready_for_request = false;
                true
            }
        };
        if fresh_request {
            match HttpRequest::parse(&content, connection) {
                Ok(request) => self.fire_http_event(request),
                Err(err) => debug!(%err, "bad request ignored"),
            }
        }
    }

    /// Inbound SYN: a new (or retried) connection request in the server
    /// role. Idle reaping piggy-backs here rather than on its own timer.
    fn accept_syn(
        &self,
        eth: EthernetFrame<'_>,
        ip: Ipv4Packet<'_>,
        tcp: TcpSegment<'_>,
        id: u64,
        now: Millis,
    ) {
        // A stale entry already marked open is replaced outright.
        if let Some(existing) = self.tcp.get(id) {
            if existing.state.lock().unwrap().open {
                self.tcp.remove(id);
            }
        }

        // Sweep every other connection that has sat idle too long.
        for (key, other) in self.tcp.snapshot() {
            let frame = {
                let mut st = other.state.lock().unwrap();
                if now.saturating_sub(st.last_activity) <= CONNECTION_IDLE_LIMIT_MS {
                    continue;
                }
                st.closing = true;
                st.recv_next = st.recv_next.wrapping_add(1);
                self.tcp_control_frame(&other, &st, TcpFlags::FIN | TcpFlags::ACK, false)
            };
            debug!(id = key, "reaping idle connection");
            if let Some(frame) = frame {
                self.transmit(&frame);
            }
            self.tcp.remove(key);
        }

        // Reuse a surviving half-set-up entry (a blocked client `open` on
        // the same tuple), otherwise create fresh.
        let conn = match self.tcp.get(id) {
            Some(existing) => existing,
            None => {
                let inner = Arc::new(ConnInner::new(
                    ip.src(),
                    tcp.src_port(),
                    tcp.dst_port(),
                    rand::random(),
                    now,
                ));
                self.tcp.insert(id, Arc::clone(&inner));
                inner
            }
        };

        let syn_ack = {
            let mut st = conn.state.lock().unwrap();
            st.remote_mac = eth.src_mac();
            st.recv_next = tcp.seq_number().wrapping_add(1);
            st.peer_isn = tcp.seq_number();
            st.window = DEFAULT_WINDOW;
            st.closing = false;
            st.ready_for_request = true;
            st.last_activity = now;
            let frame =
                self.tcp_control_frame(&conn, &st, TcpFlags::SYN | TcpFlags::ACK, true);
            st.send_next = st.send_next.wrapping_add(1);
            st.open = true;
            frame
        };
        if let Some(frame) = syn_ack {
            self.transmit(&frame);
        }
        conn.opened.notify_all();
        debug!(connections = self.tcp.len(), "accepted inbound connection");
    }

    /// Builds one control segment (no payload) from a connection's current
    /// state. `None` when the adapter has no address yet.
    pub(crate) fn tcp_control_frame(
        &self,
        conn: &ConnInner,
        st: &ConnState,
        flags: TcpFlags,
        with_mss: bool,
    ) -> Option<Vec<u8>> {
        let (our_ip, gateway_mac) = {
            let net = self.state();
            (net.ip, net.gateway_mac)
        };
        let (Some(our_ip), Some(_)) = (our_ip, gateway_mac) else {
            return None;
        };
        let segment = TcpSegmentBuilder {
            options: if with_mss { &TCP_OPT_MSS_1460 } else { &[] },
            ..TcpSegmentBuilder::control(
                conn.local_port,
                conn.remote_port,
                st.send_next,
                st.recv_next,
                flags,
                st.window,
            )
        }
        .build_vec(our_ip, conn.remote_ip)
        .ok()?;
        self.build_ipv4_frame(st.remote_mac, our_ip, conn.remote_ip, IPPROTO_TCP, 64, &segment)
            .ok()
    }

    fn send_orphan_ack(&self, dst_mac: MacAddr, dst_ip: Ipv4Addr, tcp: &TcpSegment<'_>) {
        let (our_ip, gateway_mac) = {
            let net = self.state();
            (net.ip, net.gateway_mac)
        };
        let (Some(our_ip), Some(_)) = (our_ip, gateway_mac) else {
            return;
        };
        let segment = TcpSegmentBuilder::control(
            tcp.dst_port(),
            tcp.src_port(),
            tcp.ack_number(),
            tcp.seq_number(),
            TcpFlags::ACK,
            DEFAULT_WINDOW,
        )
        .build_vec(our_ip, dst_ip);
        let Ok(segment) = segment else { return };
        match self.build_ipv4_frame(dst_mac, our_ip, dst_ip, IPPROTO_TCP, 64, &segment) {
            Ok(frame) => self.transmit(&frame),
            Err(err) => debug!(%err, "orphan ACK build failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_is_deterministic() {
        let a = connection_id(Ipv4Addr::new(192, 168, 1, 7), 50000, 80);
        let b = connection_id(Ipv4Addr::new(192, 168, 1, 7), 50000, 80);
        assert_eq!(a, b);
    }

    #[test]
    fn connection_id_separates_every_field() {
        let base = connection_id(Ipv4Addr::new(192, 168, 1, 7), 50000, 80);
        assert_ne!(base, connection_id(Ipv4Addr::new(192, 168, 1, 8), 50000, 80));
        assert_ne!(base, connection_id(Ipv4Addr::new(192, 168, 1, 7), 50001, 80));
        assert_ne!(base, connection_id(Ipv4Addr::new(192, 168, 1, 7), 50000, 81));
    }

    #[test]
    fn connection_id_packs_big_endian() {
        let id = connection_id(Ipv4Addr::new(1, 2, 3, 4), 0x0506, 0x0708);
        assert_eq!(id, 0x0102_0304_0506_0708);
    }
}
