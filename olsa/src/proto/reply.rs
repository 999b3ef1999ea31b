//! The reply message closing every request, carrying a signed result code.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

/// Result of a request, as carried in a [`Reply`] body. Values at and below zero follow the
/// protocol encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Ok,
    NoSuchInterface,
    NoSuchArea,
    NoSuchAdvertisement,
    IllegalAdvertisementType,
    TypeInUse,
    NotRegistered,
    NotReady,
    NoMemory,
    GeneralError,
    Undefined,
}

impl ReplyCode {
    /// Decode a code from its protocol value.
    pub fn from_i8(value: i8) -> Option<Self> {
        Some(match value {
            0 => ReplyCode::Ok,
            -1 => ReplyCode::NoSuchInterface,
            -2 => ReplyCode::NoSuchArea,
            -3 => ReplyCode::NoSuchAdvertisement,
            -4 => ReplyCode::IllegalAdvertisementType,
            -5 => ReplyCode::TypeInUse,
            -6 => ReplyCode::NotRegistered,
            -7 => ReplyCode::NotReady,
            -8 => ReplyCode::NoMemory,
            -9 => ReplyCode::GeneralError,
            -10 => ReplyCode::Undefined,
            _ => return None,
        })
    }

    /// The protocol value of this code.
    pub fn as_i8(&self) -> i8 {
        match self {
            ReplyCode::Ok => 0,
            ReplyCode::NoSuchInterface => -1,
            ReplyCode::NoSuchArea => -2,
            ReplyCode::NoSuchAdvertisement => -3,
            ReplyCode::IllegalAdvertisementType => -4,
            ReplyCode::TypeInUse => -5,
            ReplyCode::NotRegistered => -6,
            ReplyCode::NotReady => -7,
            ReplyCode::NoMemory => -8,
            ReplyCode::GeneralError => -9,
            ReplyCode::Undefined => -10,
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReplyCode::Ok => "ok",
            ReplyCode::NoSuchInterface => "no such interface",
            ReplyCode::NoSuchArea => "no such area",
            ReplyCode::NoSuchAdvertisement => "no such advertisement",
            ReplyCode::IllegalAdvertisementType => "illegal advertisement type",
            ReplyCode::TypeInUse => "opaque type already registered by another client",
            ReplyCode::NotRegistered => "opaque type not registered by this client",
            ReplyCode::NotReady => "scope has no opaque capable neighbor yet",
            ReplyCode::NoMemory => "out of memory",
            ReplyCode::GeneralError => "error",
            ReplyCode::Undefined => "undefined",
        })
    }
}

/// Body of a reply message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub code: ReplyCode,
}

impl Reply {
    pub(crate) fn from_bytes(src: &mut BytesMut) -> Option<Self> {
        if src.remaining() < 4 {
            return None;
        }
        let code = ReplyCode::from_i8(src.get_i8())?;
        src.advance(3);
        Some(Reply { code })
    }

    pub(crate) fn write_bytes(&self, dst: &mut BytesMut) {
        dst.put_i8(self.code.as_i8());
        dst.put_slice(&[0; 3]);
    }

    pub(crate) fn wire_size(&self) -> usize {
        4
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, BytesMut};

    use super::{Reply, ReplyCode};

    #[test]
    fn codes_roundtrip_through_protocol_values() {
        for value in -10..=0 {
            let code = ReplyCode::from_i8(value).expect("value in defined range");
            assert_eq!(code.as_i8(), value);
        }
        assert_eq!(ReplyCode::from_i8(1), None);
        assert_eq!(ReplyCode::from_i8(-11), None);
    }

    #[test]
    fn encoding() {
        let reply = Reply {
            code: ReplyCode::NotReady,
        };
        let mut buf = BytesMut::new();
        reply.write_bytes(&mut buf);
        assert_eq!(buf[..], [0xf9, 0, 0, 0]);

        let decoded = Reply::from_bytes(&mut buf).expect("full reply is decodable");
        assert_eq!(decoded, reply);
        assert_eq!(buf.remaining(), 0);
    }
}
