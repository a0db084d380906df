//! Blocking DNS lookups: cache behavior, precondition failures, the
//! synchronous wait path, and the expired-entry fallback.

mod common;

use core::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::thread;

use common::*;
use embernet_packetlib::packet::{
    encode_qname, parse_single_question, DnsResponseBuilder, DNS_CLASS_IN, DNS_TYPE_A,
    IPPROTO_UDP,
};
use embernet_stack::{AdapterConfig, DnsError};

fn dns_response_frame(name: &str, addr: Ipv4Addr, ttl_secs: u32) -> Vec<u8> {
    let qname = encode_qname(name);
    let payload = DnsResponseBuilder {
        id: 0x4242,
        flags: 0,
        echo_question: true,
        qname: &qname,
        qtype: DNS_TYPE_A,
        qclass: DNS_CLASS_IN,
        answer_class: DNS_CLASS_IN,
        ttl_secs,
        addr,
    }
    .build_vec();
    udp_frame(GW_MAC, OUR_MAC, GW_IP, OUR_IP, 53, 50001, &payload)
}

#[test]
fn literal_addresses_bypass_the_network() {
    let (adapter, driver) = static_adapter();
    let addr = adapter.dns_lookup("10.20.30.40", 1).unwrap();
    assert_eq!(addr, Ipv4Addr::new(10, 20, 30, 40));
    assert_eq!(driver.sent_count(), 0);
}

#[test]
fn empty_name_is_rejected() {
    let (adapter, _driver) = static_adapter();
    assert!(matches!(
        adapter.dns_lookup("   ", 1),
        Err(DnsError::EmptyName)
    ));
}

#[test]
fn lookup_without_a_server_fails_fast() {
    let (adapter, _driver) = adapter_with(AdapterConfig {
        dns_server: None,
        ..static_config()
    });
    assert!(matches!(
        adapter.dns_lookup("example.com", 1),
        Err(DnsError::NotConfigured)
    ));
}

#[test]
fn lookup_before_gateway_resolution_fails_fast() {
    let (adapter, _driver) = static_adapter();
    assert!(matches!(
        adapter.dns_lookup("example.com", 1),
        Err(DnsError::GatewayUnresolved)
    ));
}

#[test]
fn blocking_lookup_is_satisfied_by_the_response() {
    let (adapter, driver) = static_adapter();
    resolve_gateway(&adapter);
    driver.drain_frames();

    let worker = {
        let adapter = adapter.clone();
        thread::spawn(move || adapter.dns_lookup("printer.example", 2))
    };

    // Wait for the outbound query and check its shape.
    let query_frame = wait_for_frame(&driver, |frame| {
        ipv4_payload_protocol(frame) == Some(IPPROTO_UDP)
    });
    let udp = parse_udp_frame(&query_frame);
    assert_eq!(udp.dst_port, 53);
    assert_eq!(udp.header.dest_mac, GW_MAC);
    assert_eq!(udp.header.dst, GW_IP);
    let question = parse_single_question(&udp.payload).unwrap();
    assert!(question.is_query());
    assert_eq!(question.name().unwrap(), "printer.example");
    assert_eq!(question.qtype, DNS_TYPE_A);

    // Answer it.
    let response = dns_response_frame("printer.example", Ipv4Addr::new(10, 1, 2, 3), 300);
    adapter.frame_arrived(&response, 10);

    let resolved = worker.join().unwrap().unwrap();
    assert_eq!(resolved, Ipv4Addr::new(10, 1, 2, 3));

    // A repeat lookup is served from cache with no traffic.
    driver.drain_frames();
    let again = adapter.dns_lookup("printer.example", 1).unwrap();
    assert_eq!(again, Ipv4Addr::new(10, 1, 2, 3));
    assert_eq!(driver.sent_count(), 0);
}

#[test]
fn unsolicited_answers_fire_the_async_handler_and_fill_the_cache() {
    let (adapter, driver) = static_adapter();
    resolve_gateway(&adapter);
    driver.drain_frames();

    let seen: Arc<Mutex<Vec<(String, Ipv4Addr)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    adapter.set_dns_handler(move |name, addr| sink.lock().unwrap().push((name.into(), addr)));

    let response = dns_response_frame("camera.example", Ipv4Addr::new(10, 9, 8, 7), 600);
    adapter.frame_arrived(&response, 5);

    {
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "camera.example");
        assert_eq!(events[0].1, Ipv4Addr::new(10, 9, 8, 7));
    }

    // The answer landed in the cache, so a lookup is free.
    let addr = adapter.dns_lookup("camera.example", 1).unwrap();
    assert_eq!(addr, Ipv4Addr::new(10, 9, 8, 7));
    assert_eq!(driver.sent_count(), 0);
}

#[test]
fn expired_entry_is_used_when_the_network_stays_silent() {
    let (adapter, driver) = static_adapter();
    resolve_gateway(&adapter);
    adapter.set_dns_handler(|_, _| {});

    // TTL 0: stale the moment it lands.
    let response = dns_response_frame("old.example", Ipv4Addr::new(9, 9, 9, 9), 0);
    adapter.frame_arrived(&response, 0);
    driver.drain_frames();

    // A zero-timeout lookup gets no answer from the wire and falls back to
    // the stale entry instead of failing.
    std::thread::sleep(std::time::Duration::from_millis(5));
    let addr = adapter.dns_lookup("old.example", 0).unwrap();
    assert_eq!(addr, Ipv4Addr::new(9, 9, 9, 9));
}

#[test]
fn unanswered_lookup_fails_with_the_name() {
    let (adapter, _driver) = static_adapter();
    resolve_gateway(&adapter);
    match adapter.dns_lookup("missing.example", 0) {
        Err(DnsError::LookupFailed(name)) => assert_eq!(name, "missing.example"),
        other => panic!("expected LookupFailed, got {other:?}"),
    }
}

fn ipv4_payload_protocol(frame: &[u8]) -> Option<u8> {
    use embernet_packetlib::packet::{EthernetFrame, Ipv4Packet, ETHERTYPE_IPV4};
    let eth = EthernetFrame::parse(frame).ok()?;
    if eth.ethertype() != ETHERTYPE_IPV4 {
        return None;
    }
    Ipv4Packet::parse(eth.payload()).ok().map(|ip| ip.protocol())
}
