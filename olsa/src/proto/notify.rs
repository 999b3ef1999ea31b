//! The unsolicited notification messages pushed to clients on the asynchronous channel.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};

use crate::lsa::Lsa;
use crate::topology::{IfState, NeighborState};

/// An advertisement scope became able to carry opaque advertisements of a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyNotify {
    pub lsa_type: u8,
    pub opaque_type: u8,
    /// The scope that became ready: an interface address, an area id, or unspecified for the
    /// whole domain.
    pub addr: Ipv4Addr,
}

/// An interface was added to the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewIf {
    pub ifaddr: Ipv4Addr,
    pub area_id: Ipv4Addr,
}

/// An interface was removed from the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelIf {
    pub ifaddr: Ipv4Addr,
    pub area_id: Ipv4Addr,
}

/// An interface changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfStateChange {
    pub ifaddr: Ipv4Addr,
    pub area_id: Ipv4Addr,
    pub state: IfState,
}

/// A neighbor changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborStateChange {
    pub ifaddr: Ipv4Addr,
    pub neighbor_addr: Ipv4Addr,
    pub router_id: Ipv4Addr,
    pub state: NeighborState,
}

/// An advertisement was installed, refreshed or withdrawn in the link state database. Used by
/// both the update and the delete notification, the message type tells them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsaChange {
    /// The interface the advertisement is attached to, unspecified unless link scoped.
    pub ifaddr: Ipv4Addr,
    /// The area the advertisement belongs to, unspecified for domain scope.
    pub area_id: Ipv4Addr,
    pub self_originated: bool,
    pub lsa: Lsa,
}

/// A notification pushed on the asynchronous channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Ready(ReadyNotify),
    NewIf(NewIf),
    DelIf(DelIf),
    IfStateChange(IfStateChange),
    NeighborStateChange(NeighborStateChange),
    LsaUpdate(LsaChange),
    LsaDelete(LsaChange),
}

impl Notification {
    /// Size of this notification body on the wire.
    pub(crate) fn wire_size(&self) -> usize {
        match self {
            Notification::Ready(_) => 8,
            Notification::NewIf(_) | Notification::DelIf(_) => 8,
            Notification::IfStateChange(_) => 12,
            Notification::NeighborStateChange(_) => 16,
            Notification::LsaUpdate(change) | Notification::LsaDelete(change) => {
                12 + change.lsa.wire_size()
            }
        }
    }

    /// Append this notification body to the buffer.
    pub(crate) fn write_bytes(&self, dst: &mut BytesMut) {
        match self {
            Notification::Ready(n) => {
                dst.put_u8(n.lsa_type);
                dst.put_u8(n.opaque_type);
                dst.put_slice(&[0; 2]);
                dst.put_u32(n.addr.into());
            }
            Notification::NewIf(n) => {
                dst.put_u32(n.ifaddr.into());
                dst.put_u32(n.area_id.into());
            }
            Notification::DelIf(n) => {
                dst.put_u32(n.ifaddr.into());
                dst.put_u32(n.area_id.into());
            }
            Notification::IfStateChange(n) => {
                dst.put_u32(n.ifaddr.into());
                dst.put_u32(n.area_id.into());
                dst.put_u8(n.state as u8);
                dst.put_slice(&[0; 3]);
            }
            Notification::NeighborStateChange(n) => {
                dst.put_u32(n.ifaddr.into());
                dst.put_u32(n.neighbor_addr.into());
                dst.put_u32(n.router_id.into());
                dst.put_u8(n.state as u8);
                dst.put_slice(&[0; 3]);
            }
            Notification::LsaUpdate(change) | Notification::LsaDelete(change) => {
                dst.put_u32(change.ifaddr.into());
                dst.put_u32(change.area_id.into());
                dst.put_u8(change.self_originated as u8);
                dst.put_slice(&[0; 3]);
                change.lsa.write_bytes(dst);
            }
        }
    }
}

impl ReadyNotify {
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        if src.remaining() < 8 {
            return None;
        }
        let lsa_type = src.get_u8();
        let opaque_type = src.get_u8();
        src.advance(2);
        let addr = Ipv4Addr::from(src.get_u32());
        Some(ReadyNotify {
            lsa_type,
            opaque_type,
            addr,
        })
    }
}

impl NewIf {
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        let (ifaddr, area_id) = read_addr_pair(src)?;
        Some(NewIf { ifaddr, area_id })
    }
}

impl DelIf {
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        let (ifaddr, area_id) = read_addr_pair(src)?;
        Some(DelIf { ifaddr, area_id })
    }
}

impl IfStateChange {
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        if src.remaining() < 12 {
            return None;
        }
        let ifaddr = Ipv4Addr::from(src.get_u32());
        let area_id = Ipv4Addr::from(src.get_u32());
        let state = IfState::from_u8(src.get_u8())?;
        src.advance(3);
        Some(IfStateChange {
            ifaddr,
            area_id,
            state,
        })
    }
}

impl NeighborStateChange {
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        if src.remaining() < 16 {
            return None;
        }
        let ifaddr = Ipv4Addr::from(src.get_u32());
        let neighbor_addr = Ipv4Addr::from(src.get_u32());
        let router_id = Ipv4Addr::from(src.get_u32());
        let state = NeighborState::from_u8(src.get_u8())?;
        src.advance(3);
        Some(NeighborStateChange {
            ifaddr,
            neighbor_addr,
            router_id,
            state,
        })
    }
}

impl LsaChange {
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        if src.remaining() < 12 {
            return None;
        }
        let ifaddr = Ipv4Addr::from(src.get_u32());
        let area_id = Ipv4Addr::from(src.get_u32());
        let self_originated = src.get_u8() != 0;
        src.advance(3);
        let lsa = Lsa::from_bytes(src)?;
        Some(LsaChange {
            ifaddr,
            area_id,
            self_originated,
            lsa,
        })
    }
}

fn read_addr_pair(src: &mut BytesMut) -> Option<(Ipv4Addr, Ipv4Addr)> {
    if src.remaining() < 8 {
        return None;
    }
    let ifaddr = Ipv4Addr::from(src.get_u32());
    let area_id = Ipv4Addr::from(src.get_u32());
    Some((ifaddr, area_id))
}
