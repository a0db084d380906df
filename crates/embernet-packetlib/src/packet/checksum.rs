//! RFC 1071 Internet checksum.
//!
//! The transport form folds the IPv4 pseudo-header (source, destination,
//! protocol, segment length) into the running sum without ever building a
//! combined buffer, so a header and payload living in separate regions can
//! be checksummed together with no extra allocation.

use core::net::Ipv4Addr;

fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in chunks.by_ref() {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([pair[0], pair[1]])));
    }
    // Odd trailing byte is padded with a zero low byte.
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// One's-complement checksum over a single region.
///
/// Returns the value to place in the checksum field. Re-summing the same
/// region with that value in place yields 0.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data, 0))
}

/// Checksum over an IPv4 header (the header-only special case, kept as its
/// own entry point because the IPv4 builder and validators both want it).
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    internet_checksum(header)
}

/// TCP/UDP checksum with the IPv4 pseudo-header included in the sum.
///
/// `segment` is the full transport header + payload with its checksum field
/// zeroed (when computing) or in place (when validating: a valid segment
/// sums to 0).
pub fn transport_checksum_ipv4(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    protocol: u8,
    segment: &[u8],
) -> u16 {
    let mut sum = 0u32;
    sum = sum_words(&src_ip.octets(), sum);
    sum = sum_words(&dst_ip.octets(), sum);
    sum = sum.wrapping_add(u32::from(protocol));
    sum = sum.wrapping_add(segment.len() as u32);
    sum = sum_words(segment, sum);
    !fold(sum)
}
