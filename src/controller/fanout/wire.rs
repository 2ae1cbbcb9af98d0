use std::net::Ipv4Addr;

use arrayref::array_ref;
use byteorder::{BigEndian, ByteOrder, NativeEndian};

use super::{error::Error, NodeId};

// Records below are laid out exactly as the forwarder's C structs. Integers
// the forwarder only compares or indexes with stay in host order; addresses
// and ports go straight into packet headers so they are stored in network
// order.
//
// node_dest / sub_dest (12 bytes):
//   u32 node_id | route_handle   host order
//   u32 daddr                    network order
//   u16 dport                    network order
//   u16 reserved                 zero
//
// cfg_rec (16 bytes):
//   u32 egress_ifindex | u32 local_route_ifindex | u32 local_node_id | u32 reserved

/// A tier one destination: one node hosting at least one subscriber of a
/// topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeDest {
    pub node_id: NodeId,
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// A tier two destination: one subscriber endpoint local to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubDest {
    /// Interface index used for local delivery; 0 defers to the forwarder's
    /// configured default.
    pub route_handle: u32,
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Per-node runtime configuration written by the loader at bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CfgRecord {
    pub egress_ifindex: u32,
    pub local_route_ifindex: u32,
    pub local_node_id: u32,
}

fn encode_dest(word: u32, addr: Ipv4Addr, port: u16) -> [u8; NodeDest::SIZE] {
    let mut buf = [0u8; NodeDest::SIZE];
    NativeEndian::write_u32(&mut buf[0..4], word);
    buf[4..8].copy_from_slice(&addr.octets());
    BigEndian::write_u16(&mut buf[8..10], port);
    buf
}

fn decode_dest(buf: &[u8]) -> Result<(u32, Ipv4Addr, u16), Error> {
    if buf.len() != NodeDest::SIZE {
        return Err(Error::BadRecordLength {
            expected: NodeDest::SIZE,
            got: buf.len(),
        });
    }
    let word = NativeEndian::read_u32(&buf[0..4]);
    let addr = Ipv4Addr::from(*array_ref![buf, 4, 4]);
    let port = BigEndian::read_u16(&buf[8..10]);
    Ok((word, addr, port))
}

impl NodeDest {
    pub const SIZE: usize = 12;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        encode_dest(self.node_id, self.addr, self.port)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let (node_id, addr, port) = decode_dest(buf)?;
        Ok(Self {
            node_id,
            addr,
            port,
        })
    }
}

impl SubDest {
    pub const SIZE: usize = 12;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        encode_dest(self.route_handle, self.addr, self.port)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let (route_handle, addr, port) = decode_dest(buf)?;
        Ok(Self {
            route_handle,
            addr,
            port,
        })
    }
}

impl CfgRecord {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        NativeEndian::write_u32(&mut buf[0..4], self.egress_ifindex);
        NativeEndian::write_u32(&mut buf[4..8], self.local_route_ifindex);
        NativeEndian::write_u32(&mut buf[8..12], self.local_node_id);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != Self::SIZE {
            return Err(Error::BadRecordLength {
                expected: Self::SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            egress_ifindex: NativeEndian::read_u32(&buf[0..4]),
            local_route_ifindex: NativeEndian::read_u32(&buf[4..8]),
            local_node_id: NativeEndian::read_u32(&buf[8..12]),
        })
    }
}

/// Encodes a map key or count the way the forwarder reads it.
pub fn encode_u32(value: u32) -> [u8; 4] {
    value.to_ne_bytes()
}

pub fn decode_u32(buf: &[u8]) -> Result<u32, Error> {
    if buf.len() != 4 {
        return Err(Error::BadRecordLength {
            expected: 4,
            got: buf.len(),
        });
    }
    Ok(NativeEndian::read_u32(buf))
}
