//! The wire protocol spoken between the daemon and its api clients.
//!
//! Every message is a fixed 8 byte header followed by a type specific body. The header carries
//! the protocol version, the message type, the body length and a sequence number. Requests carry
//! a sequence number assigned by the client, the matching reply echoes it; notifications carry
//! sequence number 0, except for the update burst triggered by a database synchronization, which
//! echoes the triggering request's sequence number.
//!
//! All integers are big endian. The body length excludes the header.

use std::io;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

pub use self::{
    filter::{FilterOrigin, LsaFilter},
    notify::{
        DelIf, IfStateChange, LsaChange, NeighborStateChange, NewIf, Notification, ReadyNotify,
    },
    reply::{Reply, ReplyCode},
    request::{
        DeleteRequest, OriginateRequest, RegisterEvent, RegisterOpaqueType, Request, SyncLsdb,
        UnregisterOpaqueType,
    },
};
use crate::seqno::NOTIFY_SEQNO;

mod filter;
mod notify;
mod reply;
mod request;

/// The version of the protocol we are currently using.
pub const API_VERSION: u8 = 1;

/// Size of a message header on the wire.
const HEADER_WIRE_SIZE: usize = 8;

/// Fallback port for the synchronous channel if the service database does not name one. The
/// asynchronous channel always uses the connecting side's synchronous port + 1.
pub const DEFAULT_SYNC_PORT: u16 = 2607;

/// Service name looked up in the system service database to find the synchronous channel port.
const SERVICE_NAME: &str = "olsa";

const MSG_REGISTER_OPAQUE_TYPE: u8 = 1;
const MSG_UNREGISTER_OPAQUE_TYPE: u8 = 2;
const MSG_REGISTER_EVENT: u8 = 3;
const MSG_SYNC_LSDB: u8 = 4;
const MSG_ORIGINATE_REQUEST: u8 = 5;
const MSG_DELETE_REQUEST: u8 = 6;
const MSG_REPLY: u8 = 10;
const MSG_READY_NOTIFY: u8 = 11;
const MSG_LSA_UPDATE_NOTIFY: u8 = 12;
const MSG_LSA_DELETE_NOTIFY: u8 = 13;
const MSG_NEW_IF: u8 = 14;
const MSG_DEL_IF: u8 = 15;
const MSG_IF_STATE_CHANGE: u8 = 16;
const MSG_NEIGHBOR_STATE_CHANGE: u8 = 17;

/// The well known port of the synchronous channel: the `olsa` tcp entry of the system service
/// database, or [`DEFAULT_SYNC_PORT`] if there is none.
pub fn well_known_port() -> u16 {
    lookup_service_port(Path::new("/etc/services")).unwrap_or(DEFAULT_SYNC_PORT)
}

/// Look up the tcp port registered for [`SERVICE_NAME`] in a services(5) style database.
fn lookup_service_port(path: &Path) -> Option<u16> {
    let db = std::fs::read_to_string(path).ok()?;
    for line in db.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let Some(name) = fields.next() else { continue };
        let Some(port_proto) = fields.next() else { continue };
        let Some((port, proto)) = port_proto.split_once('/') else {
            continue;
        };
        if proto != "tcp" {
            continue;
        }
        if name == SERVICE_NAME || fields.any(|alias| alias == SERVICE_NAME) {
            return port.parse().ok();
        }
    }
    None
}

/// A full protocol message: the sequence number from the header plus the typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub seq: u32,
    pub payload: Payload,
}

/// The typed body of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Request(Request),
    Reply(Reply),
    Notification(Notification),
}

impl Message {
    /// A request message with the given sequence number.
    pub fn request(seq: u32, request: Request) -> Self {
        Message {
            seq,
            payload: Payload::Request(request),
        }
    }

    /// A reply closing the request with sequence number `seq`.
    pub fn reply(seq: u32, code: ReplyCode) -> Self {
        Message {
            seq,
            payload: Payload::Reply(Reply { code }),
        }
    }

    /// An unsolicited notification, carrying sequence number 0.
    pub fn notification(notification: Notification) -> Self {
        Message {
            seq: NOTIFY_SEQNO,
            payload: Payload::Notification(notification),
        }
    }

    /// A notification carrying an explicit sequence number. Used for the update burst of a
    /// database synchronization, which echoes the triggering request's sequence number.
    pub fn notification_with_seq(seq: u32, notification: Notification) -> Self {
        Message {
            seq,
            payload: Payload::Notification(notification),
        }
    }
}

impl Payload {
    /// The message type byte identifying this body on the wire.
    fn msg_type(&self) -> u8 {
        match self {
            Payload::Request(Request::RegisterOpaqueType(_)) => MSG_REGISTER_OPAQUE_TYPE,
            Payload::Request(Request::UnregisterOpaqueType(_)) => MSG_UNREGISTER_OPAQUE_TYPE,
            Payload::Request(Request::RegisterEvent(_)) => MSG_REGISTER_EVENT,
            Payload::Request(Request::SyncLsdb(_)) => MSG_SYNC_LSDB,
            Payload::Request(Request::Originate(_)) => MSG_ORIGINATE_REQUEST,
            Payload::Request(Request::Delete(_)) => MSG_DELETE_REQUEST,
            Payload::Reply(_) => MSG_REPLY,
            Payload::Notification(Notification::Ready(_)) => MSG_READY_NOTIFY,
            Payload::Notification(Notification::LsaUpdate(_)) => MSG_LSA_UPDATE_NOTIFY,
            Payload::Notification(Notification::LsaDelete(_)) => MSG_LSA_DELETE_NOTIFY,
            Payload::Notification(Notification::NewIf(_)) => MSG_NEW_IF,
            Payload::Notification(Notification::DelIf(_)) => MSG_DEL_IF,
            Payload::Notification(Notification::IfStateChange(_)) => MSG_IF_STATE_CHANGE,
            Payload::Notification(Notification::NeighborStateChange(_)) => {
                MSG_NEIGHBOR_STATE_CHANGE
            }
        }
    }

    fn wire_size(&self) -> usize {
        match self {
            Payload::Request(request) => request.wire_size(),
            Payload::Reply(reply) => reply.wire_size(),
            Payload::Notification(notification) => notification.wire_size(),
        }
    }

    fn write_bytes(&self, dst: &mut BytesMut) {
        match self {
            Payload::Request(request) => request.write_bytes(dst),
            Payload::Reply(reply) => reply.write_bytes(dst),
            Payload::Notification(notification) => notification.write_bytes(dst),
        }
    }
}

/// A codec which can send and receive whole api messages on the wire.
#[derive(Debug, Default)]
pub struct Codec {
    header: Option<Header>,
}

/// A message header pulled off the wire, kept around while the rest of the body arrives.
#[derive(Debug, Clone, Copy)]
struct Header {
    version: u8,
    msg_type: u8,
    body_len: u16,
    seq: u32,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for Codec {
    type Item = Message;

    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Dropped messages (unknown type, malformed body) must not stall messages already
        // buffered behind them, hence the loop.
        loop {
            let header = match self.header.take() {
                Some(header) => header,
                None => {
                    if src.remaining() < HEADER_WIRE_SIZE {
                        return Ok(None);
                    }
                    Header {
                        version: src.get_u8(),
                        msg_type: src.get_u8(),
                        body_len: src.get_u16(),
                        seq: src.get_u32(),
                    }
                }
            };

            if src.remaining() < header.body_len as usize {
                self.header = Some(header);
                return Ok(None);
            }

            let mut body = src.split_to(header.body_len as usize);

            if header.version != API_VERSION {
                debug!(
                    version = header.version,
                    "Dropping message with unknown protocol version"
                );
                continue;
            }

            let payload = match header.msg_type {
                MSG_REGISTER_OPAQUE_TYPE => RegisterOpaqueType::from_bytes(&mut body)
                    .map(|r| Payload::Request(Request::RegisterOpaqueType(r))),
                MSG_UNREGISTER_OPAQUE_TYPE => UnregisterOpaqueType::from_bytes(&mut body)
                    .map(|r| Payload::Request(Request::UnregisterOpaqueType(r))),
                MSG_REGISTER_EVENT => RegisterEvent::from_bytes(&mut body)
                    .map(|r| Payload::Request(Request::RegisterEvent(r))),
                MSG_SYNC_LSDB => SyncLsdb::from_bytes(&mut body)
                    .map(|r| Payload::Request(Request::SyncLsdb(r))),
                MSG_ORIGINATE_REQUEST => OriginateRequest::from_bytes(&mut body)
                    .map(|r| Payload::Request(Request::Originate(r))),
                MSG_DELETE_REQUEST => DeleteRequest::from_bytes(&mut body)
                    .map(|r| Payload::Request(Request::Delete(r))),
                MSG_REPLY => Reply::from_bytes(&mut body).map(Payload::Reply),
                MSG_READY_NOTIFY => ReadyNotify::from_bytes(&mut body)
                    .map(|n| Payload::Notification(Notification::Ready(n))),
                MSG_LSA_UPDATE_NOTIFY => LsaChange::from_bytes(&mut body)
                    .map(|n| Payload::Notification(Notification::LsaUpdate(n))),
                MSG_LSA_DELETE_NOTIFY => LsaChange::from_bytes(&mut body)
                    .map(|n| Payload::Notification(Notification::LsaDelete(n))),
                MSG_NEW_IF => NewIf::from_bytes(&mut body)
                    .map(|n| Payload::Notification(Notification::NewIf(n))),
                MSG_DEL_IF => DelIf::from_bytes(&mut body)
                    .map(|n| Payload::Notification(Notification::DelIf(n))),
                MSG_IF_STATE_CHANGE => IfStateChange::from_bytes(&mut body)
                    .map(|n| Payload::Notification(Notification::IfStateChange(n))),
                MSG_NEIGHBOR_STATE_CHANGE => NeighborStateChange::from_bytes(&mut body)
                    .map(|n| Payload::Notification(Notification::NeighborStateChange(n))),
                unknown => {
                    debug!(msg_type = unknown, "Dropping message of unknown type");
                    continue;
                }
            };

            match payload {
                Some(payload) if !body.has_remaining() => {
                    return Ok(Some(Message {
                        seq: header.seq,
                        payload,
                    }));
                }
                _ => {
                    debug!(
                        msg_type = header.msg_type,
                        "Dropping message with malformed body"
                    );
                    continue;
                }
            }
        }
    }
}

impl Encoder<Message> for Codec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body_len = u16::try_from(item.payload.wire_size())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message body too large"))?;

        dst.reserve(HEADER_WIRE_SIZE + body_len as usize);
        dst.put_u8(API_VERSION);
        dst.put_u8(item.payload.msg_type());
        dst.put_u16(body_len);
        dst.put_u32(item.seq);
        item.payload.write_bytes(dst);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use bytes::{BufMut, Bytes, BytesMut};
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{Decoder, Encoder, Framed};

    use super::{
        Codec, DeleteRequest, DelIf, FilterOrigin, IfStateChange, LsaChange, LsaFilter, Message,
        NeighborStateChange, NewIf, Notification, OriginateRequest, ReadyNotify, RegisterEvent,
        RegisterOpaqueType, ReplyCode, Request, SyncLsdb, UnregisterOpaqueType,
    };
    use crate::lsa::Lsa;
    use crate::topology::{IfState, NeighborState};

    const IF_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);
    const AREA: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

    fn sample_lsa() -> Lsa {
        let mut lsa = Lsa::prototype(10, 7, 1, Bytes::from_static(b"payload"));
        lsa.header.adv_router = Ipv4Addr::new(10, 0, 0, 1);
        lsa.header.sequence = crate::lsa::LSA_INITIAL_SEQUENCE;
        lsa.refresh_checksum();
        lsa
    }

    fn sample_filter() -> LsaFilter {
        LsaFilter {
            typemask: LsaFilter::mask_for(&[9, 10, 11]),
            origin: FilterOrigin::SelfOriginated,
            areas: vec![AREA],
        }
    }

    fn all_message_types() -> Vec<Message> {
        vec![
            Message::request(
                1,
                Request::RegisterOpaqueType(RegisterOpaqueType {
                    lsa_type: 10,
                    opaque_type: 7,
                }),
            ),
            Message::request(
                2,
                Request::UnregisterOpaqueType(UnregisterOpaqueType {
                    lsa_type: 10,
                    opaque_type: 7,
                }),
            ),
            Message::request(
                3,
                Request::RegisterEvent(RegisterEvent {
                    filter: sample_filter(),
                }),
            ),
            Message::request(
                4,
                Request::SyncLsdb(SyncLsdb {
                    filter: sample_filter(),
                }),
            ),
            Message::request(
                5,
                Request::Originate(OriginateRequest {
                    ifaddr: IF_ADDR,
                    area_id: AREA,
                    lsa: sample_lsa(),
                }),
            ),
            Message::request(
                6,
                Request::Delete(DeleteRequest {
                    area_id: AREA,
                    lsa_type: 10,
                    opaque_type: 7,
                    opaque_id: 1,
                }),
            ),
            Message::reply(6, ReplyCode::NoSuchAdvertisement),
            Message::notification(Notification::Ready(ReadyNotify {
                lsa_type: 10,
                opaque_type: 7,
                addr: AREA,
            })),
            Message::notification(Notification::NewIf(NewIf {
                ifaddr: IF_ADDR,
                area_id: AREA,
            })),
            Message::notification(Notification::DelIf(DelIf {
                ifaddr: IF_ADDR,
                area_id: AREA,
            })),
            Message::notification(Notification::IfStateChange(IfStateChange {
                ifaddr: IF_ADDR,
                area_id: AREA,
                state: IfState::PointToPoint,
            })),
            Message::notification(Notification::NeighborStateChange(NeighborStateChange {
                ifaddr: IF_ADDR,
                neighbor_addr: Ipv4Addr::new(10, 0, 1, 2),
                router_id: Ipv4Addr::new(2, 2, 2, 2),
                state: NeighborState::Full,
            })),
            Message::notification_with_seq(
                4,
                Notification::LsaUpdate(LsaChange {
                    ifaddr: Ipv4Addr::UNSPECIFIED,
                    area_id: AREA,
                    self_originated: true,
                    lsa: sample_lsa(),
                }),
            ),
            Message::notification(Notification::LsaDelete(LsaChange {
                ifaddr: IF_ADDR,
                area_id: AREA,
                self_originated: false,
                lsa: sample_lsa(),
            })),
        ]
    }

    #[test]
    fn roundtrip_every_message_type() {
        let mut codec = Codec::new();
        for message in all_message_types() {
            let mut buf = BytesMut::new();
            codec
                .encode(message.clone(), &mut buf)
                .expect("body sizes fit in a u16");
            let decoded = codec
                .decode(&mut buf)
                .expect("decoding an encoded message never errors")
                .expect("a full message is buffered");
            assert_eq!(decoded, message);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn header_encoding() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Message::request(
                    7,
                    Request::RegisterOpaqueType(RegisterOpaqueType {
                        lsa_type: 10,
                        opaque_type: 7,
                    }),
                ),
                &mut buf,
            )
            .expect("fixed size body fits in a u16");
        assert_eq!(buf[..], [1, 1, 0, 4, 0, 0, 0, 7, 10, 7, 0, 0]);
    }

    #[test]
    fn truncated_stream_is_incomplete_then_decodes() {
        let mut codec = Codec::new();
        let mut full = BytesMut::new();
        let message = Message::notification(Notification::LsaUpdate(LsaChange {
            ifaddr: IF_ADDR,
            area_id: AREA,
            self_originated: true,
            lsa: sample_lsa(),
        }));
        codec
            .encode(message.clone(), &mut full)
            .expect("body size fits in a u16");

        // Feed the stream one byte at a time; the decoder must report "incomplete" until the
        // whole message arrived, and never misparse.
        let mut partial = BytesMut::new();
        let total = full.len();
        for (i, byte) in full.iter().enumerate() {
            partial.put_u8(*byte);
            let decoded = codec.decode(&mut partial).expect("no error on short input");
            if i + 1 < total {
                assert_eq!(decoded, None);
            } else {
                assert_eq!(decoded, Some(message.clone()));
            }
        }
    }

    #[test]
    fn unknown_message_type_is_skipped() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::new();
        // A type 99 message with a 2 byte body...
        buf.put_slice(&[1, 99, 0, 2, 0, 0, 0, 0, 0xab, 0xcd]);
        // ...followed by a valid reply.
        codec
            .encode(Message::reply(3, ReplyCode::Ok), &mut buf)
            .expect("fixed size body fits in a u16");

        let decoded = codec
            .decode(&mut buf)
            .expect("unknown types are skipped, not errors")
            .expect("the message behind the skipped one decodes");
        assert_eq!(decoded, Message::reply(3, ReplyCode::Ok));
    }

    #[test]
    fn wrong_version_is_skipped() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&[2, 10, 0, 4, 0, 0, 0, 1, 0, 0, 0, 0]);
        codec
            .encode(Message::reply(9, ReplyCode::Ok), &mut buf)
            .expect("fixed size body fits in a u16");

        let decoded = codec
            .decode(&mut buf)
            .expect("version mismatches are skipped, not errors")
            .expect("the message behind the skipped one decodes");
        assert_eq!(decoded, Message::reply(9, ReplyCode::Ok));
    }

    #[test]
    fn body_length_mismatch_is_skipped() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::new();
        // A reply with a declared body of 6 bytes; the reply parser consumes 4 and the leftover
        // marks the message as malformed.
        buf.put_slice(&[1, 10, 0, 6, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        codec
            .encode(Message::reply(2, ReplyCode::Ok), &mut buf)
            .expect("fixed size body fits in a u16");

        let decoded = codec
            .decode(&mut buf)
            .expect("length mismatches are skipped, not errors")
            .expect("the message behind the skipped one decodes");
        assert_eq!(decoded, Message::reply(2, ReplyCode::Ok));
    }

    #[tokio::test]
    async fn codec_over_stream() {
        let (tx, rx) = tokio::io::duplex(1024);
        let mut sender = Framed::new(tx, Codec::new());
        let mut receiver = Framed::new(rx, Codec::new());

        for message in all_message_types() {
            sender
                .send(message.clone())
                .await
                .expect("Send on a non-networked buffer can never fail; qed");
            let received = receiver
                .next()
                .await
                .expect("Buffer isn't closed so this is always `Some`; qed")
                .expect("Can decode the previously encoded value");
            assert_eq!(received, message);
        }
    }

    #[test]
    fn service_database_lookup() {
        let dir = std::env::temp_dir().join(format!("olsa-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("can create a directory under the temp dir");
        let path = dir.join("services");
        std::fs::write(
            &path,
            "# comment\nftp 21/tcp\nolsa 12607/udp\nolsa 12607/tcp # api\n",
        )
        .expect("can write under the temp dir");

        assert_eq!(super::lookup_service_port(&path), Some(12607));
        assert_eq!(super::lookup_service_port(&dir.join("missing")), None);

        std::fs::remove_dir_all(&dir).expect("can remove the created directory");
    }
}
