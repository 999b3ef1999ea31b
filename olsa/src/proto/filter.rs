//! Advertisement filters: which advertisement change notifications a client wants to see.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};

/// Which originator an advertisement must have to pass a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FilterOrigin {
    /// Only advertisements originated by other routers.
    NonSelfOriginated = 0,
    /// Only advertisements originated by the local router.
    SelfOriginated = 1,
    /// Any originator.
    Any = 2,
}

impl FilterOrigin {
    /// Decode an origin from its protocol value.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => FilterOrigin::NonSelfOriginated,
            1 => FilterOrigin::SelfOriginated,
            2 => FilterOrigin::Any,
            _ => return None,
        })
    }
}

/// A filter over advertisements, matching on type, originator and area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsaFilter {
    /// Bitmap over advertisement types, bit `t - 1` selects type `t` (types 1 through 16).
    pub typemask: u16,
    pub origin: FilterOrigin,
    /// Areas to match. Empty matches every area.
    pub areas: Vec<Ipv4Addr>,
}

impl LsaFilter {
    /// A filter passing every advertisement.
    pub fn permit_all() -> Self {
        LsaFilter {
            typemask: u16::MAX,
            origin: FilterOrigin::Any,
            areas: Vec::new(),
        }
    }

    /// Build a typemask selecting exactly the given advertisement types. Types outside of
    /// [1, 16] are ignored.
    pub fn mask_for(types: &[u8]) -> u16 {
        types
            .iter()
            .filter(|&&lsa_type| (1..=16).contains(&lsa_type))
            .fold(0, |mask, &lsa_type| mask | 1 << (lsa_type - 1))
    }

    /// Whether an advertisement with the given type, originator and area passes this filter.
    /// Domain scoped advertisements carry no area and pass the area check unconditionally.
    pub fn matches(&self, lsa_type: u8, self_originated: bool, area_id: Option<Ipv4Addr>) -> bool {
        if !(1..=16).contains(&lsa_type) || self.typemask & (1 << (lsa_type - 1)) == 0 {
            return false;
        }
        let origin_ok = match self.origin {
            FilterOrigin::Any => true,
            FilterOrigin::SelfOriginated => self_originated,
            FilterOrigin::NonSelfOriginated => !self_originated,
        };
        let area_ok = match area_id {
            None => true,
            Some(area_id) => self.areas.is_empty() || self.areas.contains(&area_id),
        };
        origin_ok && area_ok
    }

    /// Read a filter from the buffer.
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        if src.remaining() < 4 {
            return None;
        }
        let typemask = src.get_u16();
        let origin = FilterOrigin::from_u8(src.get_u8())?;
        let num_areas = src.get_u8() as usize;
        if src.remaining() < num_areas * 4 {
            return None;
        }
        let mut areas = Vec::with_capacity(num_areas);
        for _ in 0..num_areas {
            areas.push(Ipv4Addr::from(src.get_u32()));
        }
        Some(LsaFilter {
            typemask,
            origin,
            areas,
        })
    }

    /// Append this filter to the buffer.
    pub(crate) fn write_bytes(&self, dst: &mut BytesMut) {
        dst.put_u16(self.typemask);
        dst.put_u8(self.origin as u8);
        dst.put_u8(self.areas.len() as u8);
        for area_id in &self.areas {
            dst.put_u32((*area_id).into());
        }
    }

    /// Size of this filter on the wire.
    pub(crate) fn wire_size(&self) -> usize {
        4 + 4 * self.areas.len()
    }
}

impl Default for LsaFilter {
    /// The default filter of a fresh session passes nothing; a client opts in to the steady
    /// state notification stream by registering a filter.
    fn default() -> Self {
        LsaFilter {
            typemask: 0,
            origin: FilterOrigin::Any,
            areas: Vec::new(),
        }
    }
}
