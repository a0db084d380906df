use core::net::Ipv4Addr;

use super::ethernet::MacAddr;
use super::{ensure_len, ensure_out_buf_len, PacketError};

pub const HTYPE_ETHERNET: u16 = 1;
pub const PTYPE_IPV4: u16 = 0x0800;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

/// An IPv4-over-Ethernet ARP packet (the only flavor we speak).
#[derive(Clone, Copy, Debug)]
pub struct ArpPacket<'a> {
    data: &'a [u8],
}

impl<'a> ArpPacket<'a> {
    pub const LEN: usize = 28;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::LEN)?;
        let htype = u16::from_be_bytes([data[0], data[1]]);
        let ptype = u16::from_be_bytes([data[2], data[3]]);
        if htype != HTYPE_ETHERNET || data[4] != 6 {
            return Err(PacketError::Unsupported("non-Ethernet ARP"));
        }
        if ptype != PTYPE_IPV4 || data[5] != 4 {
            return Err(PacketError::Unsupported("non-IPv4 ARP"));
        }
        Ok(Self { data })
    }

    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes([self.data[6], self.data[7]])
    }

    pub fn sender_mac(&self) -> MacAddr {
        MacAddr(self.data[8..14].try_into().unwrap())
    }

    pub fn sender_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[14], self.data[15], self.data[16], self.data[17])
    }

    pub fn target_mac(&self) -> MacAddr {
        MacAddr(self.data[18..24].try_into().unwrap())
    }

    pub fn target_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[24], self.data[25], self.data[26], self.data[27])
    }
}

pub struct ArpPacketBuilder {
    pub opcode: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacketBuilder {
    pub fn len(&self) -> usize {
        ArpPacket::LEN
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        ensure_out_buf_len(out, ArpPacket::LEN)?;
        out[0..2].copy_from_slice(&HTYPE_ETHERNET.to_be_bytes());
        out[2..4].copy_from_slice(&PTYPE_IPV4.to_be_bytes());
        out[4] = 6;
        out[5] = 4;
        out[6..8].copy_from_slice(&self.opcode.to_be_bytes());
        out[8..14].copy_from_slice(&self.sender_mac.0);
        out[14..18].copy_from_slice(&self.sender_ip.octets());
        out[18..24].copy_from_slice(&self.target_mac.0);
        out[24..28].copy_from_slice(&self.target_ip.octets());
        Ok(ArpPacket::LEN)
    }

    pub fn build_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ArpPacket::LEN];
        let written = self.write(&mut buf).expect("sized buffer");
        debug_assert_eq!(written, buf.len());
        buf
    }
}
