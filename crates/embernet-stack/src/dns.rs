//! DNS client: a blocking `lookup` with a small cache, a secondary-server
//! retry, and a fall-back to expired cache entries when the network fails.
//!
//! The cache holds at most [`DNS_CACHE_MAX`] entries as a soft cap:
//! eviction only ever removes *expired* entries, and only while the cache
//! is at or over the cap, so live entries are never dropped and the cache
//! may sit slightly above the cap until something expires.

use core::net::Ipv4Addr;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use embernet_packetlib::packet::{
    encode_qname, DnsQueryBuilder, DnsResponse, UdpPacketBuilder, DNS_TYPE_A, IPPROTO_UDP,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::adapter::{Adapter, Millis};

const DNS_CACHE_MAX: usize = 5;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("name is empty")]
    EmptyName,
    /// Programmer error: no DNS server configured (with DHCP, wait for the
    /// adapter to report ready before resolving names).
    #[error("no DNS server is configured")]
    NotConfigured,
    /// Programmer error: queries cannot be routed until ARP has resolved
    /// the gateway MAC.
    #[error("gateway MAC is not resolved")]
    GatewayUnresolved,
    /// Programmer error: no local address yet.
    #[error("no local IP address is assigned")]
    NoLocalAddress,
    /// The network didn't answer in time and no cache entry could stand in.
    #[error("lookup for {0:?} failed")]
    LookupFailed(String),
}

struct DnsCacheEntry {
    name: String,
    rtype: u16,
    /// Uptime timestamp after which the entry is stale.
    expires_at: Millis,
    addr: Ipv4Addr,
}

#[derive(Default)]
struct PendingLookup {
    query: Option<String>,
    result: Option<Ipv4Addr>,
}

pub(crate) struct DnsClient {
    cache: Mutex<Vec<DnsCacheEntry>>,
    /// Serializes blocking lookups; one outstanding query at a time.
    serial: Mutex<()>,
    pending: Mutex<PendingLookup>,
    answered: Condvar,
}

impl DnsClient {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(Vec::new()),
            serial: Mutex::new(()),
            pending: Mutex::new(PendingLookup::default()),
            answered: Condvar::new(),
        }
    }

    fn cache_get_fresh(&self, name: &str, now: Millis) -> Option<Ipv4Addr> {
        self.cache
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.name == name && entry.expires_at > now)
            .map(|entry| entry.addr)
    }

    fn cache_get_any(&self, name: &str) -> Option<Ipv4Addr> {
        self.cache
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.addr)
    }

    /// Inserting an existing name replaces it; identity is by name only.
    fn cache_insert(&self, name: String, rtype: u16, expires_at: Millis, addr: Ipv4Addr) {
        let mut cache = self.cache.lock().unwrap();
        if let Some(existing) = cache.iter_mut().find(|entry| entry.name == name) {
            existing.rtype = rtype;
            existing.expires_at = expires_at;
            existing.addr = addr;
        } else {
            cache.push(DnsCacheEntry {
                name,
                rtype,
                expires_at,
                addr,
            });
        }
    }

    /// Removes expired entries while the cache sits at or over the cap.
    fn prune_expired(&self, now: Millis) {
        let mut cache = self.cache.lock().unwrap();
        let mut i = cache.len();
        while i > 0 && cache.len() >= DNS_CACHE_MAX {
            i -= 1;
            if cache[i].expires_at <= now {
                cache.remove(i);
            }
        }
    }

    fn wait_result(&self, timeout: Duration) -> Option<Ipv4Addr> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock().unwrap();
        loop {
            if let Some(addr) = pending.result {
                return Some(addr);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .answered
                .wait_timeout(pending, deadline - now)
                .unwrap();
            pending = guard;
        }
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

impl Adapter {
    /// Resolves `name` to an IPv4 address, blocking up to `timeout_secs`
    /// per server. Dotted-decimal literals come straight back; an
    /// unexpired cache entry wins without any network traffic; otherwise
    /// the primary server is queried, then the secondary, and finally an
    /// expired cache entry is pressed into service before giving up.
    ///
    /// Must be called from application code, never from an event handler.
    pub fn dns_lookup(&self, name: &str, timeout_secs: u64) -> Result<Ipv4Addr, DnsError> {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(DnsError::EmptyName);
        }
        if let Ok(literal) = name.parse::<Ipv4Addr>() {
            return Ok(literal);
        }
        if let Some(hit) = self.dns.cache_get_fresh(&name, self.now_ms()) {
            return Ok(hit);
        }

        let (our_ip, gateway_mac, primary, secondary) = {
            let st = self.state();
            (st.ip, st.gateway_mac, st.dns, st.dns2)
        };
        let Some(primary) = primary else {
            return Err(DnsError::NotConfigured);
        };
        let Some(gateway_mac) = gateway_mac else {
            return Err(DnsError::GatewayUnresolved);
        };
        let Some(our_ip) = our_ip else {
            return Err(DnsError::NoLocalAddress);
        };

        let _one_at_a_time = self.dns.serial.lock().unwrap();
        {
            let mut pending = self.dns.pending.lock().unwrap();
            pending.query = Some(name.clone());
            pending.result = None;
        }

        let timeout = Duration::from_secs(timeout_secs);
        self.send_dns_query(&name, our_ip, gateway_mac, primary);
        let mut result = self.dns.wait_result(timeout);

        if result.is_none() {
            if let Some(secondary) = secondary {
                debug!(server = %secondary, "primary DNS timed out; trying secondary");
                self.send_dns_query(&name, our_ip, gateway_mac, secondary);
                result = self.dns.wait_result(timeout);
            }
        }

        self.dns.pending.lock().unwrap().query = None;

        match result {
            Some(addr) => Ok(addr),
            None => {
                if let Some(stale) = self.dns.cache_get_any(&name) {
                    warn!(%name, "lookup timed out; using an expired cache entry");
                    Ok(stale)
                } else {
                    Err(DnsError::LookupFailed(name))
                }
            }
        }
    }

    /// Handles an inbound response from a DNS server (source port 53). The
    /// first A answer updates the cache and either satisfies a waiting
    /// lookup or fires the asynchronous resolution callback.
    pub(crate) fn handle_dns_response(&self, payload: &[u8], now: Millis) {
        let pending_query = self.dns.pending.lock().unwrap().query.clone();
        if pending_query.is_none() && !self.has_dns_handler() {
            return; // nobody is listening
        }

        let Ok(response) = DnsResponse::parse(payload) else {
            return;
        };
        if response.answer_count() == 0 {
            return;
        }
        let Ok(name) = response.name() else {
            return;
        };
        let name = name.to_ascii_lowercase();

        for answer in response.answers() {
            if answer.rtype != DNS_TYPE_A {
                continue;
            }
            let Some(addr) = answer.rdata_ipv4() else {
                return;
            };
            self.dns.cache_insert(
                name.clone(),
                DNS_TYPE_A,
                now + Millis::from(answer.ttl_secs) * 1000,
                addr,
            );
            if pending_query.as_deref() == Some(name.as_str()) {
                let mut pending = self.dns.pending.lock().unwrap();
                pending.result = Some(addr);
                self.dns.answered.notify_all();
            } else {
                self.fire_dns_event(&name, addr);
            }
            self.dns.prune_expired(now);
            return;
        }
    }

    fn send_dns_query(
        &self,
        name: &str,
        our_ip: Ipv4Addr,
        gateway_mac: embernet_packetlib::packet::MacAddr,
        server: Ipv4Addr,
    ) {
        let qname = encode_qname(name);
        let query = DnsQueryBuilder {
            id: rand::random(),
            qname: &qname,
            qtype: DNS_TYPE_A,
        }
        .build_vec();
        let datagram = UdpPacketBuilder {
            src_port: self.next_ephemeral_port(),
            dst_port: 53,
            payload: &query,
            compute_checksum: false,
        }
        .build_vec(our_ip, server);
        let datagram = match datagram {
            Ok(datagram) => datagram,
            Err(err) => {
                debug!(%err, "DNS query build failed");
                return;
            }
        };
        match self.build_ipv4_frame(gateway_mac, our_ip, server, IPPROTO_UDP, 64, &datagram) {
            Ok(frame) => self.transmit(&frame),
            Err(err) => debug!(%err, "DNS query frame build failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_replaces_by_name() {
        let dns = DnsClient::new();
        dns.cache_insert("a.example".into(), DNS_TYPE_A, 1000, Ipv4Addr::new(1, 1, 1, 1));
        dns.cache_insert("a.example".into(), DNS_TYPE_A, 2000, Ipv4Addr::new(2, 2, 2, 2));
        assert_eq!(dns.cache_len(), 1);
        assert_eq!(dns.cache_get_fresh("a.example", 0), Some(Ipv4Addr::new(2, 2, 2, 2)));
    }

    #[test]
    fn expired_entries_only_evicted_at_cap() {
        let dns = DnsClient::new();
        for i in 0..4u8 {
            dns.cache_insert(
                format!("host{i}.example"),
                DNS_TYPE_A,
                100, // all expired by t=200
                Ipv4Addr::new(10, 0, 0, i),
            );
        }
        // Below the cap: expired entries stay put.
        dns.prune_expired(200);
        assert_eq!(dns.cache_len(), 4);

        dns.cache_insert("host4.example".into(), DNS_TYPE_A, 10_000, Ipv4Addr::new(10, 0, 0, 4));
        // At the cap: the expired four go, the live one stays.
        dns.prune_expired(200);
        assert_eq!(dns.cache_len(), 1);
        assert_eq!(dns.cache_get_fresh("host4.example", 200), Some(Ipv4Addr::new(10, 0, 0, 4)));
    }

    #[test]
    fn live_entries_survive_past_the_cap() {
        let dns = DnsClient::new();
        for i in 0..6u8 {
            dns.cache_insert(
                format!("host{i}.example"),
                DNS_TYPE_A,
                u64::MAX, // never expires
                Ipv4Addr::new(10, 0, 0, i),
            );
        }
        dns.prune_expired(0);
        // Nothing expired, so nothing is evicted even over the soft cap.
        assert_eq!(dns.cache_len(), 6);
    }

    #[test]
    fn stale_entry_still_readable_as_fallback() {
        let dns = DnsClient::new();
        dns.cache_insert("old.example".into(), DNS_TYPE_A, 10, Ipv4Addr::new(9, 9, 9, 9));
        assert_eq!(dns.cache_get_fresh("old.example", 50), None);
        assert_eq!(dns.cache_get_any("old.example"), Some(Ipv4Addr::new(9, 9, 9, 9)));
    }
}
