#![forbid(unsafe_code)]

//! A small from-scratch TCP/IP stack for polled Ethernet hardware.
//!
//! The [`Adapter`] owns the network configuration and demultiplexes inbound
//! frames to the protocol handlers (ARP, DHCP client, DNS client and the
//! mDNS/LLMNR/NetBIOS name responders, ICMP echo, UDP, TCP with HTTP
//! framing on top). Frames reach it through [`Adapter::frame_arrived`],
//! called from the Ethernet driver's delivery path; everything outbound
//! goes back out through the [`embernet_link::EthernetDriver`] the adapter
//! was started with.
//!
//! Handlers run synchronously on the delivery path and never block. The
//! blocking operations ([`Adapter::dns_lookup`], [`Connection::open`],
//! [`HttpRequest::send`]) take explicit timeouts and must only be called
//! from application threads, never from inside an event handler.

mod adapter;
mod arp;
mod config;
mod dhcp;
mod dns;
mod http;
mod icmp;
mod names;
mod tcp;
mod udp;

use embernet_link::SendError;
use embernet_packetlib::PacketError;
use thiserror::Error;

pub use adapter::{Adapter, Millis};
pub use config::AdapterConfig;
pub use dns::DnsError;
pub use http::{url_decode, url_encode, HttpRequest, HttpResponse};
pub use tcp::{connection_id, Connection, TcpEvent};
pub use udp::UdpEvent;

/// Errors surfaced to the embedding application.
///
/// Timeouts on blocking calls are *not* errors (they come back as `false`
/// or `None`); these are precondition violations and transmit failures.
#[derive(Debug, Error)]
pub enum StackError {
    /// A startup-sequencing bug: the operation needs state (local IP,
    /// resolved gateway MAC) that the adapter does not have yet.
    #[error("adapter is not ready: {0}")]
    NotReady(&'static str),
    #[error("payload is empty")]
    EmptyPayload,
    #[error("connection is closing")]
    ConnectionClosing,
    #[error("connection open timed out")]
    OpenTimeout,
    #[error("link: {0}")]
    Link(#[from] SendError),
    #[error("dns: {0}")]
    Dns(#[from] DnsError),
    #[error("packet: {0}")]
    Packet(#[from] PacketError),
    #[error("malformed HTTP message: {0}")]
    MalformedHttp(&'static str),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}
