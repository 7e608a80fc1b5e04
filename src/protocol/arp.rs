//! Address-resolution packets (request/reply)

use super::LinkAddr;
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// ARP packet size for a 6-byte link address over IPv4
pub const ARP_PACKET_SIZE: usize = 28;

/// ARP operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

impl ArpOp {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ArpOp::Request),
            2 => Some(ArpOp::Reply),
            _ => None,
        }
    }
}

/// Parsed resolution packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOp,
    pub sender_link: LinkAddr,
    pub sender_ip: Ipv4Addr,
    pub target_link: LinkAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Parse an ARP packet from a frame payload
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < ARP_PACKET_SIZE {
            return Err(Error::Parse("ARP packet too short".into()));
        }

        // Hardware type (Ethernet = 1)
        let htype = u16::from_be_bytes([buffer[0], buffer[1]]);
        if htype != 1 {
            return Err(Error::Parse("unsupported hardware type".into()));
        }

        // Protocol type (IPv4 = 0x0800)
        let ptype = u16::from_be_bytes([buffer[2], buffer[3]]);
        if ptype != 0x0800 {
            return Err(Error::Parse("unsupported protocol type".into()));
        }

        if buffer[4] != 6 {
            return Err(Error::Parse("invalid hardware address length".into()));
        }
        if buffer[5] != 4 {
            return Err(Error::Parse("invalid protocol address length".into()));
        }

        let operation = u16::from_be_bytes([buffer[6], buffer[7]]);
        let operation =
            ArpOp::from_u16(operation).ok_or_else(|| Error::Parse("invalid ARP operation".into()))?;

        let sender_link = LinkAddr(buffer[8..14].try_into().unwrap());
        let sender_ip = Ipv4Addr::new(buffer[14], buffer[15], buffer[16], buffer[17]);
        let target_link = LinkAddr(buffer[18..24].try_into().unwrap());
        let target_ip = Ipv4Addr::new(buffer[24], buffer[25], buffer[26], buffer[27]);

        Ok(Self {
            operation,
            sender_link,
            sender_ip,
            target_link,
            target_ip,
        })
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> [u8; ARP_PACKET_SIZE] {
        let mut buf = [0u8; ARP_PACKET_SIZE];

        // Hardware type (Ethernet)
        buf[0..2].copy_from_slice(&1u16.to_be_bytes());
        // Protocol type (IPv4)
        buf[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
        buf[4] = 6;
        buf[5] = 4;
        buf[6..8].copy_from_slice(&(self.operation as u16).to_be_bytes());
        buf[8..14].copy_from_slice(&self.sender_link.0);
        buf[14..18].copy_from_slice(&self.sender_ip.octets());
        buf[18..24].copy_from_slice(&self.target_link.0);
        buf[24..28].copy_from_slice(&self.target_ip.octets());

        buf
    }

    /// Create a resolution request for `target_ip`
    pub fn request(sender_link: LinkAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ArpOp::Request,
            sender_link,
            sender_ip,
            target_link: LinkAddr::ZERO,
            target_ip,
        }
    }

    /// Create a reply answering `target`'s request
    pub fn reply(
        sender_link: LinkAddr,
        sender_ip: Ipv4Addr,
        target_link: LinkAddr,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            operation: ArpOp::Reply,
            sender_link,
            sender_ip,
            target_link,
            target_ip,
        }
    }
}
