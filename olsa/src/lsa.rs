//! Opaque link state advertisements as carried in the client api and installed in the link state
//! database.
//!
//! An advertisement is a fixed 20 byte header followed by an application defined payload. The
//! opaque identity (subtype + 24 bit id) is packed into the 32 bit id field of the header. The
//! header checksum is the ISO fletcher checksum over everything but the age field.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Advertisement type for opaque advertisements flooded on a single link only.
pub const LSA_TYPE_OPAQUE_LINK: u8 = 9;
/// Advertisement type for opaque advertisements flooded within a single area.
pub const LSA_TYPE_OPAQUE_AREA: u8 = 10;
/// Advertisement type for opaque advertisements flooded through the entire routing domain.
pub const LSA_TYPE_OPAQUE_DOMAIN: u8 = 11;

/// Size of an advertisement header on the wire.
pub const LSA_HEADER_WIRE_SIZE: usize = 20;

/// The age at which an advertisement expires, in seconds. Flushing an advertisement sets its age
/// to this value before the final flood, the network then ages it out on its own.
pub const LSA_MAX_AGE: u16 = 3600;

/// Sequence number assigned to the first instance of an advertisement.
pub const LSA_INITIAL_SEQUENCE: u32 = 0x8000_0001;
/// Highest possible advertisement sequence number.
pub const LSA_MAX_SEQUENCE: u32 = 0x7fff_ffff;

/// Option bits set on advertisements built from a client prototype (external routing + opaque
/// capability).
pub const DEFAULT_LSA_OPTIONS: u8 = 0x42;

/// Block size for the fletcher checksum modulus reduction.
const MODX: usize = 4102;
/// Offset of the checksum field within the checksummed region (the header minus the age field).
const CHECKSUM_OFFSET: usize = 14;

/// Whether the advertisement type is one of the three opaque types.
pub fn is_opaque_type(lsa_type: u8) -> bool {
    (LSA_TYPE_OPAQUE_LINK..=LSA_TYPE_OPAQUE_DOMAIN).contains(&lsa_type)
}

/// The flooding extent of an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LsaScope {
    /// Flooded on a single link, identified by the address of the attached interface.
    Link(Ipv4Addr),
    /// Flooded within a single area.
    Area(Ipv4Addr),
    /// Flooded through the entire routing domain.
    Domain,
}

/// Identity of an opaque advertisement within its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LsaKey {
    pub lsa_type: u8,
    pub opaque_type: u8,
    /// The low 24 bits of the advertisement id.
    pub opaque_id: u32,
}

/// Full identity of an opaque advertisement: its scope plus the key within that scope. This is
/// the key of the per session staging store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LsaIdentity {
    pub scope: LsaScope,
    pub key: LsaKey,
}

/// Fixed advertisement header. All fields are stored in host representation, the big endian
/// conversion happens in [`LsaHeader::write_bytes`] and [`LsaHeader::from_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsaHeader {
    pub age: u16,
    pub options: u8,
    pub lsa_type: u8,
    /// Advertisement id, for opaque advertisements the subtype packed with the 24 bit opaque id.
    pub id: u32,
    pub adv_router: Ipv4Addr,
    pub sequence: u32,
    pub checksum: u16,
    /// Total advertisement size, header included.
    pub length: u16,
}

impl LsaHeader {
    /// Read a header from the buffer. Returns [`None`] if there are less than
    /// [`LSA_HEADER_WIRE_SIZE`] bytes available.
    pub fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        if src.remaining() < LSA_HEADER_WIRE_SIZE {
            return None;
        }
        Some(LsaHeader {
            age: src.get_u16(),
            options: src.get_u8(),
            lsa_type: src.get_u8(),
            id: src.get_u32(),
            adv_router: Ipv4Addr::from(src.get_u32()),
            sequence: src.get_u32(),
            checksum: src.get_u16(),
            length: src.get_u16(),
        })
    }

    /// Append this header to the buffer.
    pub fn write_bytes(&self, dst: &mut BytesMut) {
        dst.put_u16(self.age);
        dst.put_u8(self.options);
        dst.put_u8(self.lsa_type);
        dst.put_u32(self.id);
        dst.put_u32(self.adv_router.into());
        dst.put_u32(self.sequence);
        dst.put_u16(self.checksum);
        dst.put_u16(self.length);
    }
}

/// A full advertisement: header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lsa {
    pub header: LsaHeader,
    pub payload: Bytes,
}

impl Lsa {
    /// Assemble a new advertisement prototype for the given opaque identity and payload. Age,
    /// sequence number, checksum and advertising router are placeholders, they are assigned when
    /// the advertisement is installed in the link state database.
    pub fn prototype(lsa_type: u8, opaque_type: u8, opaque_id: u32, payload: Bytes) -> Self {
        let length = (LSA_HEADER_WIRE_SIZE + payload.len()) as u16;
        Lsa {
            header: LsaHeader {
                age: 0,
                options: DEFAULT_LSA_OPTIONS,
                lsa_type,
                id: compose_id(opaque_type, opaque_id),
                adv_router: Ipv4Addr::UNSPECIFIED,
                sequence: 0,
                checksum: 0,
                length,
            },
            payload,
        }
    }

    /// Size of this advertisement on the wire.
    pub fn wire_size(&self) -> usize {
        LSA_HEADER_WIRE_SIZE + self.payload.len()
    }

    /// The opaque identity of this advertisement, decomposed from the type and id fields.
    pub fn key(&self) -> LsaKey {
        LsaKey {
            lsa_type: self.header.lsa_type,
            opaque_type: (self.header.id >> 24) as u8,
            opaque_id: self.header.id & 0x00ff_ffff,
        }
    }

    /// Whether this advertisement has reached its maximum age.
    pub fn is_max_age(&self) -> bool {
        self.header.age >= LSA_MAX_AGE
    }

    /// Read a full advertisement from the buffer, using the length field of the header to
    /// determine the payload size. Returns [`None`] if the buffer does not hold a complete,
    /// plausible advertisement.
    pub fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        let header = LsaHeader::from_bytes(src)?;
        let length = header.length as usize;
        if length < LSA_HEADER_WIRE_SIZE {
            return None;
        }
        let payload_len = length - LSA_HEADER_WIRE_SIZE;
        if src.remaining() < payload_len {
            return None;
        }
        let payload = src.split_to(payload_len).freeze();
        Some(Lsa { header, payload })
    }

    /// Append this advertisement to the buffer.
    pub fn write_bytes(&self, dst: &mut BytesMut) {
        self.header.write_bytes(dst);
        dst.put_slice(&self.payload);
    }

    /// Compute the fletcher checksum of this advertisement, the value the checksum field should
    /// hold. The stored checksum field does not influence the result.
    pub fn compute_checksum(&self) -> u16 {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        let mut header = self.header;
        header.checksum = 0;
        header.write_bytes(&mut buf);
        buf.put_slice(&self.payload);
        // The age field is excluded, it changes while the advertisement floods.
        fletcher(&buf[2..])
    }

    /// Recompute and store the checksum.
    pub fn refresh_checksum(&mut self) {
        self.header.checksum = self.compute_checksum();
    }

    /// Whether the stored checksum matches the advertisement contents.
    pub fn checksum_valid(&self) -> bool {
        self.header.checksum == self.compute_checksum()
    }
}

/// Pack an opaque subtype and 24 bit opaque id into an advertisement id.
pub fn compose_id(opaque_type: u8, opaque_id: u32) -> u32 {
    ((opaque_type as u32) << 24) | (opaque_id & 0x00ff_ffff)
}

/// ISO fletcher checksum over `buf`, which must already have the checksum field (at
/// [`CHECKSUM_OFFSET`]) zeroed.
fn fletcher(buf: &[u8]) -> u16 {
    let len = buf.len() as i64;
    let mut c0: i64 = 0;
    let mut c1: i64 = 0;
    for chunk in buf.chunks(MODX) {
        for &b in chunk {
            c0 += b as i64;
            c1 += c0;
        }
        c0 %= 255;
        c1 %= 255;
    }

    let mut x = ((len - CHECKSUM_OFFSET as i64 - 1) * c0 - c1) % 255;
    if x <= 0 {
        x += 255;
    }
    let mut y = 510 - c0 - x;
    if y > 255 {
        y -= 255;
    }

    ((x as u16) << 8) | (y as u16 & 0xff)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use bytes::{Buf, Bytes, BytesMut};

    use super::{Lsa, LsaHeader, LSA_HEADER_WIRE_SIZE};

    fn sample_lsa() -> Lsa {
        let mut lsa = Lsa::prototype(10, 7, 1, Bytes::from_static(b"\xde\xad\xbe\xef"));
        lsa.header.adv_router = Ipv4Addr::new(10, 0, 0, 1);
        lsa.header.sequence = super::LSA_INITIAL_SEQUENCE;
        lsa.refresh_checksum();
        lsa
    }

    #[test]
    fn header_encoding() {
        let header = LsaHeader {
            age: 1,
            options: 0x42,
            lsa_type: 10,
            id: super::compose_id(7, 0x010203),
            adv_router: Ipv4Addr::new(192, 0, 2, 1),
            sequence: 0x8000_0001,
            checksum: 0x1234,
            length: 24,
        };

        let mut buf = BytesMut::new();
        header.write_bytes(&mut buf);
        assert_eq!(buf.len(), LSA_HEADER_WIRE_SIZE);
        assert_eq!(
            buf[..],
            [
                0, 1, 0x42, 10, 7, 1, 2, 3, 192, 0, 2, 1, 0x80, 0, 0, 1, 0x12, 0x34, 0, 24
            ]
        );

        let decoded = LsaHeader::from_bytes(&mut buf).expect("full header is decodable");
        assert_eq!(decoded, header);
    }

    #[test]
    fn roundtrip() {
        let lsa = sample_lsa();
        let mut buf = BytesMut::new();
        lsa.write_bytes(&mut buf);
        assert_eq!(buf.len(), lsa.wire_size());

        let decoded = Lsa::from_bytes(&mut buf).expect("full advertisement is decodable");
        assert_eq!(decoded, lsa);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn truncated_payload_is_incomplete() {
        let lsa = sample_lsa();
        let mut buf = BytesMut::new();
        lsa.write_bytes(&mut buf);
        buf.truncate(buf.len() - 1);

        assert_eq!(Lsa::from_bytes(&mut buf), None);
    }

    #[test]
    fn checksum_validates_and_detects_corruption() {
        let mut lsa = sample_lsa();
        assert!(lsa.checksum_valid());
        assert_ne!(lsa.header.checksum, 0);

        lsa.payload = Bytes::from_static(b"\xde\xad\xbe\xee");
        assert!(!lsa.checksum_valid());
        lsa.refresh_checksum();
        assert!(lsa.checksum_valid());
    }

    #[test]
    fn checksum_ignores_age() {
        let mut lsa = sample_lsa();
        let sum = lsa.header.checksum;
        lsa.header.age = super::LSA_MAX_AGE;
        assert_eq!(lsa.compute_checksum(), sum);
    }

    #[test]
    fn opaque_identity_packing() {
        let lsa = sample_lsa();
        let key = lsa.key();
        assert_eq!(key.lsa_type, 10);
        assert_eq!(key.opaque_type, 7);
        assert_eq!(key.opaque_id, 1);

        assert_eq!(super::compose_id(0xff, 0x0102_0304), 0xff02_0304);
    }
}
