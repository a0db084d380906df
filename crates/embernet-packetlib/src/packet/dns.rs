//! DNS wire format: enough for an A-record client and the local-name
//! responders (mDNS/LLMNR reuse the same message layout).

use core::net::Ipv4Addr;

use super::{ensure_len, ensure_out_buf_len, PacketError};

pub const DNS_TYPE_A: u16 = 1;
pub const DNS_CLASS_IN: u16 = 1;
/// mDNS answers set the top bit of the class to request cache flushing.
pub const DNS_CLASS_IN_CACHE_FLUSH: u16 = 0x8001;

pub const DNS_FLAG_RESPONSE: u16 = 0x8000;
pub const DNS_FLAG_AUTHORITATIVE: u16 = 0x0400;
pub const DNS_FLAG_RECURSION_DESIRED: u16 = 0x0100;

pub const DNS_HEADER_LEN: usize = 12;

/// Encodes `example.com` as length-prefixed labels with a 0 terminator.
/// Names are lowered; empty labels collapse away.
pub fn encode_qname(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.split('.').filter(|label| !label.is_empty()) {
        let label = label.to_ascii_lowercase();
        let len = label.len().min(63);
        out.push(len as u8);
        out.extend_from_slice(&label.as_bytes()[..len]);
    }
    out.push(0);
    out
}

/// Decodes a standalone (uncompressed) QNAME into dotted form.
pub fn qname_to_string(qname: &[u8]) -> Result<String, PacketError> {
    // RFC 1035 caps wire-format names at 255 bytes including length octets.
    if qname.len() > 255 {
        return Err(PacketError::Malformed("DNS name too long"));
    }
    let mut out = String::with_capacity(qname.len());
    let mut at = 0usize;
    while at < qname.len() {
        let len = qname[at] as usize;
        at += 1;
        if len == 0 {
            return Ok(out);
        }
        if len > 63 {
            return Err(PacketError::Malformed("DNS label length > 63"));
        }
        if at + len > qname.len() {
            return Err(PacketError::Truncated {
                needed: at + len,
                actual: qname.len(),
            });
        }
        let label = core::str::from_utf8(&qname[at..at + len])
            .map_err(|_| PacketError::Malformed("DNS label is not UTF-8"))?;
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(label);
        at += len;
    }
    Err(PacketError::Malformed("DNS name missing terminator"))
}

/// Walks a name starting at `offset`, returning the offset just past it.
/// Compression pointers are skipped (2 bytes), not followed.
fn skip_name(packet: &[u8], mut at: usize) -> Result<usize, PacketError> {
    loop {
        let Some(&len) = packet.get(at) else {
            return Err(PacketError::Truncated {
                needed: at + 1,
                actual: packet.len(),
            });
        };
        if (len & 0xc0) == 0xc0 {
            return Ok(at + 2);
        }
        if (len & 0xc0) != 0 {
            return Err(PacketError::Malformed("DNS label has reserved bits set"));
        }
        at += 1 + len as usize;
        if len == 0 {
            return Ok(at);
        }
    }
}

/// The single question of a query or response.
#[derive(Clone, Copy, Debug)]
pub struct DnsQuestion<'a> {
    pub id: u16,
    pub flags: u16,
    /// Raw labels including the 0 terminator, suitable for echoing.
    pub qname: &'a [u8],
    pub qtype: u16,
    pub qclass: u16,
}

impl<'a> DnsQuestion<'a> {
    pub fn is_query(&self) -> bool {
        (self.flags & DNS_FLAG_RESPONSE) == 0
    }

    pub fn recursion_desired(&self) -> bool {
        (self.flags & DNS_FLAG_RECURSION_DESIRED) != 0
    }

    pub fn name(&self) -> Result<String, PacketError> {
        qname_to_string(self.qname)
    }
}

/// Parses the question section of a packet carrying exactly one question.
/// Works for both queries and responses (the caller checks the QR bit).
pub fn parse_single_question(packet: &[u8]) -> Result<DnsQuestion<'_>, PacketError> {
    ensure_len(packet, DNS_HEADER_LEN)?;
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount != 1 {
        return Err(PacketError::Unsupported("DNS qdcount != 1"));
    }
    let mut at = DNS_HEADER_LEN;
    while at < packet.len() {
        let len = packet[at];
        if (len & 0xc0) != 0 {
            // Question names are written by the querier in full; pointers
            // here would mean we misparsed something upstream.
            return Err(PacketError::Unsupported("compressed DNS question name"));
        }
        at += 1 + len as usize;
        if len == 0 {
            break;
        }
    }
    ensure_len(packet, at + 4)?;
    let qname = &packet[DNS_HEADER_LEN..at];
    if qname.len() > 255 {
        return Err(PacketError::Malformed("DNS name too long"));
    }
    Ok(DnsQuestion {
        id,
        flags,
        qname,
        qtype: u16::from_be_bytes([packet[at], packet[at + 1]]),
        qclass: u16::from_be_bytes([packet[at + 2], packet[at + 3]]),
    })
}

/// One resource record out of the answer section.
#[derive(Clone, Copy, Debug)]
pub struct DnsRecord<'a> {
    pub rtype: u16,
    pub rclass: u16,
    pub ttl_secs: u32,
    pub rdata: &'a [u8],
}

impl<'a> DnsRecord<'a> {
    pub fn rdata_ipv4(&self) -> Option<Ipv4Addr> {
        let octets: [u8; 4] = self.rdata.try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }
}

/// A parsed response with its question and answer section located.
#[derive(Clone, Copy, Debug)]
pub struct DnsResponse<'a> {
    data: &'a [u8],
    question: DnsQuestion<'a>,
    answer_count: u16,
    answers_start: usize,
}

impl<'a> DnsResponse<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        let question = parse_single_question(data)?;
        if question.is_query() {
            return Err(PacketError::Malformed("DNS packet is not a response"));
        }
        let answer_count = u16::from_be_bytes([data[6], data[7]]);
        let answers_start = DNS_HEADER_LEN + question.qname.len() + 4;
        Ok(Self {
            data,
            question,
            answer_count,
            answers_start,
        })
    }

    pub fn id(&self) -> u16 {
        self.question.id
    }

    pub fn answer_count(&self) -> u16 {
        self.answer_count
    }

    pub fn name(&self) -> Result<String, PacketError> {
        self.question.name()
    }

    /// Answer records, fail-soft: a malformed record ends the walk and
    /// nothing from this response is used (mirrors treating a bad answer
    /// section as "no answers" rather than a hard error).
    pub fn answers(&self) -> Vec<DnsRecord<'a>> {
        let mut out = Vec::new();
        let mut at = self.answers_start;
        for _ in 0..self.answer_count {
            let Ok(name_end) = skip_name(self.data, at) else {
                return Vec::new();
            };
            let Some(fixed) = self.data.get(name_end..name_end + 10) else {
                return Vec::new();
            };
            let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
            let rclass = u16::from_be_bytes([fixed[2], fixed[3]]);
            let ttl_secs = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
            let rdlen = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
            let rdata_start = name_end + 10;
            let Some(rdata) = self.data.get(rdata_start..rdata_start + rdlen) else {
                return Vec::new();
            };
            out.push(DnsRecord {
                rtype,
                rclass,
                ttl_secs,
                rdata,
            });
            at = rdata_start + rdlen;
        }
        out
    }
}

/// A single-question A-record query.
pub struct DnsQueryBuilder<'a> {
    pub id: u16,
    pub qname: &'a [u8],
    pub qtype: u16,
}

impl<'a> DnsQueryBuilder<'a> {
    pub fn len(&self) -> usize {
        DNS_HEADER_LEN + self.qname.len() + 4
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len();
        ensure_out_buf_len(out, len)?;
        out[0..2].copy_from_slice(&self.id.to_be_bytes());
        out[2..4].copy_from_slice(&DNS_FLAG_RECURSION_DESIRED.to_be_bytes());
        out[4..6].copy_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        out[6..12].fill(0);
        let mut at = DNS_HEADER_LEN;
        out[at..at + self.qname.len()].copy_from_slice(self.qname);
        at += self.qname.len();
        out[at..at + 2].copy_from_slice(&self.qtype.to_be_bytes());
        out[at + 2..at + 4].copy_from_slice(&DNS_CLASS_IN.to_be_bytes());
        Ok(len)
    }

    pub fn build_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.len()];
        let written = self.write(&mut buf).expect("sized buffer");
        debug_assert_eq!(written, buf.len());
        buf
    }
}

/// A-record response used by the mDNS/LLMNR responders.
///
/// With `echo_question` the question section is repeated and the answer
/// name is a pointer to it; without (mDNS style) the answer carries the
/// name inline and QDCOUNT is zero.
pub struct DnsResponseBuilder<'a> {
    pub id: u16,
    pub flags: u16,
    pub echo_question: bool,
    pub qname: &'a [u8],
    pub qtype: u16,
    pub qclass: u16,
    pub answer_class: u16,
    pub ttl_secs: u32,
    pub addr: Ipv4Addr,
}

impl<'a> DnsResponseBuilder<'a> {
    pub fn len(&self) -> usize {
        let question = if self.echo_question {
            self.qname.len() + 4
        } else {
            0
        };
        let answer_name = if self.echo_question {
            2 // pointer to the question name at offset 12
        } else {
            self.qname.len()
        };
        DNS_HEADER_LEN + question + answer_name + 2 + 2 + 4 + 2 + 4
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len();
        ensure_out_buf_len(out, len)?;
        out[0..2].copy_from_slice(&self.id.to_be_bytes());
        out[2..4].copy_from_slice(&(self.flags | DNS_FLAG_RESPONSE).to_be_bytes());
        out[4..6].copy_from_slice(&(self.echo_question as u16).to_be_bytes());
        out[6..8].copy_from_slice(&1u16.to_be_bytes()); // ANCOUNT
        out[8..12].fill(0);
        let mut at = DNS_HEADER_LEN;
        if self.echo_question {
            out[at..at + self.qname.len()].copy_from_slice(self.qname);
            at += self.qname.len();
            out[at..at + 2].copy_from_slice(&self.qtype.to_be_bytes());
            out[at + 2..at + 4].copy_from_slice(&self.qclass.to_be_bytes());
            at += 4;
            out[at..at + 2].copy_from_slice(&0xc00cu16.to_be_bytes());
            at += 2;
        } else {
            out[at..at + self.qname.len()].copy_from_slice(self.qname);
            at += self.qname.len();
        }
        out[at..at + 2].copy_from_slice(&DNS_TYPE_A.to_be_bytes());
        out[at + 2..at + 4].copy_from_slice(&self.answer_class.to_be_bytes());
        at += 4;
        out[at..at + 4].copy_from_slice(&self.ttl_secs.to_be_bytes());
        at += 4;
        out[at..at + 2].copy_from_slice(&4u16.to_be_bytes());
        at += 2;
        out[at..at + 4].copy_from_slice(&self.addr.octets());
        at += 4;
        debug_assert_eq!(at, len);
        Ok(len)
    }

    pub fn build_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.len()];
        let written = self.write(&mut buf).expect("sized buffer");
        debug_assert_eq!(written, buf.len());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qname_round_trip() {
        let encoded = encode_qname("Example.COM");
        assert_eq!(encoded, b"\x07example\x03com\x00");
        assert_eq!(qname_to_string(&encoded).unwrap(), "example.com");
    }

    #[test]
    fn query_builds_and_parses() {
        let qname = encode_qname("device.local");
        let query = DnsQueryBuilder {
            id: 0xbeef,
            qname: &qname,
            qtype: DNS_TYPE_A,
        }
        .build_vec();
        let q = parse_single_question(&query).unwrap();
        assert!(q.is_query());
        assert!(q.recursion_desired());
        assert_eq!(q.id, 0xbeef);
        assert_eq!(q.name().unwrap(), "device.local");
        assert_eq!(q.qtype, DNS_TYPE_A);
        assert_eq!(q.qclass, DNS_CLASS_IN);
    }

    #[test]
    fn response_with_pointer_answer_parses() {
        let qname = encode_qname("host.example");
        let response = DnsResponseBuilder {
            id: 7,
            flags: DNS_FLAG_AUTHORITATIVE,
            echo_question: true,
            qname: &qname,
            qtype: DNS_TYPE_A,
            qclass: DNS_CLASS_IN,
            answer_class: DNS_CLASS_IN,
            ttl_secs: 60,
            addr: Ipv4Addr::new(192, 168, 1, 9),
        }
        .build_vec();
        let parsed = DnsResponse::parse(&response).unwrap();
        assert_eq!(parsed.id(), 7);
        assert_eq!(parsed.answer_count(), 1);
        assert_eq!(parsed.name().unwrap(), "host.example");
        let answers = parsed.answers();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].rtype, DNS_TYPE_A);
        assert_eq!(answers[0].ttl_secs, 60);
        assert_eq!(answers[0].rdata_ipv4(), Some(Ipv4Addr::new(192, 168, 1, 9)));
    }

    #[test]
    fn mdns_style_response_has_no_question() {
        let qname = encode_qname("device.local");
        let response = DnsResponseBuilder {
            id: 0,
            flags: DNS_FLAG_AUTHORITATIVE,
            echo_question: false,
            qname: &qname,
            qtype: DNS_TYPE_A,
            qclass: DNS_CLASS_IN,
            answer_class: DNS_CLASS_IN_CACHE_FLUSH,
            ttl_secs: 120,
            addr: Ipv4Addr::new(10, 1, 1, 1),
        }
        .build_vec();
        assert_eq!(u16::from_be_bytes([response[4], response[5]]), 0); // QDCOUNT
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 1); // ANCOUNT
        assert_eq!(&response[response.len() - 4..], &[10, 1, 1, 1]);
    }

    #[test]
    fn truncated_answer_section_yields_nothing() {
        let qname = encode_qname("a.b");
        let mut response = DnsResponseBuilder {
            id: 1,
            flags: 0,
            echo_question: true,
            qname: &qname,
            qtype: DNS_TYPE_A,
            qclass: DNS_CLASS_IN,
            answer_class: DNS_CLASS_IN,
            ttl_secs: 5,
            addr: Ipv4Addr::UNSPECIFIED,
        }
        .build_vec();
        response.truncate(response.len() - 3);
        let parsed = DnsResponse::parse(&response).unwrap();
        assert!(parsed.answers().is_empty());
    }

    #[test]
    fn query_rejected_as_response() {
        let qname = encode_qname("x.y");
        let query = DnsQueryBuilder {
            id: 2,
            qname: &qname,
            qtype: DNS_TYPE_A,
        }
        .build_vec();
        assert_eq!(
            DnsResponse::parse(&query).unwrap_err(),
            PacketError::Malformed("DNS packet is not a response")
        );
    }
}
