//! The six request messages a client can issue on the synchronous channel.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};

use super::LsaFilter;
use crate::lsa::Lsa;

/// Claim ownership of an opaque type, gating origination and deletion of matching
/// advertisements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOpaqueType {
    pub lsa_type: u8,
    pub opaque_type: u8,
}

/// Give up ownership of an opaque type, flushing the matching self originated advertisements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnregisterOpaqueType {
    pub lsa_type: u8,
    pub opaque_type: u8,
}

/// Replace the session's stored notification filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterEvent {
    pub filter: LsaFilter,
}

/// Request a one shot dump of the link state database through update notifications carrying this
/// request's sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLsdb {
    pub filter: LsaFilter,
}

/// Submit an advertisement prototype for origination. The interface address selects the link for
/// link scoped advertisements, the area id the area for area scoped ones; the respective other
/// field is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginateRequest {
    pub ifaddr: Ipv4Addr,
    pub area_id: Ipv4Addr,
    pub lsa: Lsa,
}

/// Request graceful withdrawal of a previously originated advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteRequest {
    pub area_id: Ipv4Addr,
    pub lsa_type: u8,
    pub opaque_type: u8,
    pub opaque_id: u32,
}

/// A request read from the synchronous channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    RegisterOpaqueType(RegisterOpaqueType),
    UnregisterOpaqueType(UnregisterOpaqueType),
    RegisterEvent(RegisterEvent),
    SyncLsdb(SyncLsdb),
    Originate(OriginateRequest),
    Delete(DeleteRequest),
}

impl Request {
    /// Size of this request body on the wire.
    pub(crate) fn wire_size(&self) -> usize {
        match self {
            Request::RegisterOpaqueType(_) | Request::UnregisterOpaqueType(_) => 4,
            Request::RegisterEvent(r) => r.filter.wire_size(),
            Request::SyncLsdb(r) => r.filter.wire_size(),
            Request::Originate(r) => 8 + r.lsa.wire_size(),
            Request::Delete(_) => 12,
        }
    }

    /// Append this request body to the buffer.
    pub(crate) fn write_bytes(&self, dst: &mut BytesMut) {
        match self {
            Request::RegisterOpaqueType(r) => {
                dst.put_u8(r.lsa_type);
                dst.put_u8(r.opaque_type);
                dst.put_slice(&[0; 2]);
            }
            Request::UnregisterOpaqueType(r) => {
                dst.put_u8(r.lsa_type);
                dst.put_u8(r.opaque_type);
                dst.put_slice(&[0; 2]);
            }
            Request::RegisterEvent(r) => r.filter.write_bytes(dst),
            Request::SyncLsdb(r) => r.filter.write_bytes(dst),
            Request::Originate(r) => {
                dst.put_u32(r.ifaddr.into());
                dst.put_u32(r.area_id.into());
                r.lsa.write_bytes(dst);
            }
            Request::Delete(r) => {
                dst.put_u32(r.area_id.into());
                dst.put_u8(r.lsa_type);
                dst.put_u8(r.opaque_type);
                dst.put_slice(&[0; 2]);
                dst.put_u32(r.opaque_id);
            }
        }
    }
}

impl RegisterOpaqueType {
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        let (lsa_type, opaque_type) = read_type_pair(src)?;
        Some(RegisterOpaqueType {
            lsa_type,
            opaque_type,
        })
    }
}

impl UnregisterOpaqueType {
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        let (lsa_type, opaque_type) = read_type_pair(src)?;
        Some(UnregisterOpaqueType {
            lsa_type,
            opaque_type,
        })
    }
}

impl RegisterEvent {
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        Some(RegisterEvent {
            filter: LsaFilter::from_bytes(src)?,
        })
    }
}

impl SyncLsdb {
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        Some(SyncLsdb {
            filter: LsaFilter::from_bytes(src)?,
        })
    }
}

impl OriginateRequest {
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        if src.remaining() < 8 {
            return None;
        }
        let ifaddr = Ipv4Addr::from(src.get_u32());
        let area_id = Ipv4Addr::from(src.get_u32());
        let lsa = Lsa::from_bytes(src)?;
        Some(OriginateRequest {
            ifaddr,
            area_id,
            lsa,
        })
    }
}

impl DeleteRequest {
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        if src.remaining() < 12 {
            return None;
        }
        let area_id = Ipv4Addr::from(src.get_u32());
        let lsa_type = src.get_u8();
        let opaque_type = src.get_u8();
        src.advance(2);
        let opaque_id = src.get_u32();
        Some(DeleteRequest {
            area_id,
            lsa_type,
            opaque_type,
            opaque_id,
        })
    }
}

/// Read the `(advertisement type, opaque type, 2 pad bytes)` layout shared by the two
/// registration requests.
fn read_type_pair(src: &mut BytesMut) -> Option<(u8, u8)> {
    if src.remaining() < 4 {
        return None;
    }
    let lsa_type = src.get_u8();
    let opaque_type = src.get_u8();
    src.advance(2);
    Some((lsa_type, opaque_type))
}
