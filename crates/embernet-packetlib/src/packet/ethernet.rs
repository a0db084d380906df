use core::fmt;

use super::{ensure_len, ensure_out_buf_len, PacketError};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: Self = Self([0xff; 6]);
    pub const ZERO: Self = Self([0x00; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EthernetFrame<'a> {
    data: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    pub const HEADER_LEN: usize = 14;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::HEADER_LEN)?;
        Ok(Self { data })
    }

    pub fn dest_mac(&self) -> MacAddr {
        MacAddr(self.data[0..6].try_into().unwrap())
    }

    pub fn src_mac(&self) -> MacAddr {
        MacAddr(self.data[6..12].try_into().unwrap())
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.data[12], self.data[13]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[Self::HEADER_LEN..]
    }
}

pub struct EthernetFrameBuilder<'a> {
    pub dest_mac: MacAddr,
    pub src_mac: MacAddr,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

impl<'a> EthernetFrameBuilder<'a> {
    pub fn len(&self) -> usize {
        EthernetFrame::HEADER_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len();
        ensure_out_buf_len(out, len)?;
        out[0..6].copy_from_slice(&self.dest_mac.0);
        out[6..12].copy_from_slice(&self.src_mac.0);
        out[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
        out[14..len].copy_from_slice(self.payload);
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
    fn build_and_parse() {
        let frame = EthernetFrameBuilder {
            dest_mac: MacAddr::BROADCAST,
            src_mac: MacAddr([0x02, 0, 0, 0, 0, 1]),
            ethertype: ETHERTYPE_ARP,
            payload: &[1, 2, 3],
        }
        .build_vec();
        let parsed = EthernetFrame::parse(&frame).unwrap();
        assert_eq!(parsed.dest_mac(), MacAddr::BROADCAST);
        assert_eq!(parsed.src_mac(), MacAddr([0x02, 0, 0, 0, 0, 1]));
        assert_eq!(parsed.ethertype(), ETHERTYPE_ARP);
        assert_eq!(parsed.payload(), &[1, 2, 3]);
    }

    #[test]
    fn short_frame_is_truncated() {
        assert_eq!(
            EthernetFrame::parse(&[0u8; 13]).unwrap_err(),
            PacketError::Truncated {
                needed: 14,
                actual: 13
            }
        );
    }
}
