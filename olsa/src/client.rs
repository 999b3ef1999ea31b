//! The client side of the api: connection bootstrap, synchronous request/reply, and passive
//! reception of notifications.
//!
//! Bootstrap mirrors the server side with the roles swapped: the client opens a listener on its
//! chosen local port + 1 *before* connecting, binds the synchronous socket to that local port,
//! connects to the daemon's well known port, and then accepts exactly one reverse connection on
//! the listener, which becomes the notification channel. The listener is closed right after:
//! one reverse connection is expected, ever, later connection attempts are refused. This dance
//! means a single well known port suffices for discovery while the daemon can still push
//! unsolicited notifications.

use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    time::timeout,
};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::{
    lsa::Lsa,
    proto::{
        Codec, DeleteRequest, DelIf, IfStateChange, LsaChange, LsaFilter, Message,
        NeighborStateChange, NewIf, Notification, OriginateRequest, Payload, ReadyNotify,
        RegisterEvent, RegisterOpaqueType, ReplyCode, Request, SyncLsdb, UnregisterOpaqueType,
    },
    seqno::SeqNo,
};

/// Time allowed for the daemon to open the reverse notification connection during bootstrap.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Error establishing a connection to the daemon.
#[derive(Debug)]
pub enum ConnectError {
    /// An error on one of the sockets involved in the bootstrap.
    Io(io::Error),
    /// The daemon never opened the reverse notification connection.
    AcceptTimeout,
    /// The chosen local port leaves no room for the notification port.
    PortExhausted,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Io(e) => f.write_fmt(format_args!("connection bootstrap failed: {e}")),
            ConnectError::AcceptTimeout => {
                f.write_str("daemon did not open the notification connection in time")
            }
            ConnectError::PortExhausted => {
                f.write_str("local port + 1 does not fit in the port range")
            }
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectError {
    fn from(value: io::Error) -> Self {
        ConnectError::Io(value)
    }
}

/// Error on an established connection.
#[derive(Debug)]
pub enum ClientError {
    /// An error on one of the channels.
    Io(io::Error),
    /// The daemon closed the connection.
    ConnectionClosed,
    /// Something other than the awaited reply arrived on the synchronous channel.
    ProtocolViolation,
    /// The daemon answered the request with a non-ok code.
    Refused(ReplyCode),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(e) => f.write_fmt(format_args!("channel failure: {e}")),
            ClientError::ConnectionClosed => f.write_str("daemon closed the connection"),
            ClientError::ProtocolViolation => {
                f.write_str("unexpected message on the synchronous channel")
            }
            ClientError::Refused(code) => f.write_fmt(format_args!("request refused: {code}")),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(value: io::Error) -> Self {
        ClientError::Io(value)
    }
}

/// Receiver of the notifications pushed on the asynchronous channel. Every method has a default
/// empty implementation, the embedding application picks the events it cares about.
pub trait NotificationHandler {
    /// A scope became ready for an opaque type registered by this client.
    fn ready(&mut self, _notify: ReadyNotify) {}

    /// An interface was added to the daemon's topology.
    fn interface_added(&mut self, _notify: NewIf) {}

    /// An interface was removed from the daemon's topology.
    fn interface_removed(&mut self, _notify: DelIf) {}

    /// An interface changed state.
    fn interface_state_change(&mut self, _notify: IfStateChange) {}

    /// A neighbor changed state.
    fn neighbor_state_change(&mut self, _notify: NeighborStateChange) {}

    /// An advertisement was installed or refreshed. `seq` is 0 for the steady state stream, or
    /// the sequence number of the synchronization request that triggered this update.
    fn advertisement_update(&mut self, _seq: u32, _change: LsaChange) {}

    /// An advertisement was withdrawn.
    fn advertisement_delete(&mut self, _seq: u32, _change: LsaChange) {}
}

/// A connection to the api server of a routing daemon.
pub struct ApiClient {
    sync: Framed<TcpStream, Codec>,
    notify: Framed<TcpStream, Codec>,
    seq: SeqNo,
}

impl ApiClient {
    /// Connect to the daemon at `server`. `local_port` is bound as the local port of the
    /// synchronous channel; the daemon connects back to `local_port + 1` to open the
    /// notification channel, so both ports must be free.
    pub async fn connect(server: SocketAddr, local_port: u16) -> Result<ApiClient, ConnectError> {
        let notify_port = local_port.checked_add(1).ok_or(ConnectError::PortExhausted)?;
        let local_ip: IpAddr = match server {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };

        // The listener must exist before the daemon learns our address, or the reverse connect
        // races against us.
        let listener = TcpListener::bind(SocketAddr::new(local_ip, notify_port)).await?;

        let socket = match server {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::new(local_ip, local_port))?;
        let sync_stream = socket.connect(server).await?;

        let (notify_stream, remote) = timeout(BOOTSTRAP_TIMEOUT, listener.accept())
            .await
            .map_err(|_| ConnectError::AcceptTimeout)??;
        debug!("Accepted reverse notification connection from {remote}");
        // One reverse connection is expected, ever: accept the first, close the listener.
        drop(listener);

        Ok(ApiClient {
            sync: Framed::new(sync_stream, Codec::new()),
            notify: Framed::new(notify_stream, Codec::new()),
            seq: SeqNo::new(),
        })
    }

    /// Connect to the daemon on `server_ip` using the well known port, both as the daemon's port
    /// and as the local port of the synchronous channel.
    pub async fn connect_well_known(server_ip: IpAddr) -> Result<ApiClient, ConnectError> {
        let port = crate::proto::well_known_port();
        Self::connect(SocketAddr::new(server_ip, port), port).await
    }

    /// Issue a raw request and block until the matching reply arrives, returning its code. Any
    /// other message on the synchronous channel while waiting is a protocol violation.
    pub async fn request(&mut self, request: Request) -> Result<ReplyCode, ClientError> {
        let seq = self.seq.advance();
        self.sync.send(Message::request(seq, request)).await?;

        match self.sync.next().await {
            None => Err(ClientError::ConnectionClosed),
            Some(Err(e)) => Err(ClientError::Io(e)),
            Some(Ok(msg)) => match msg.payload {
                Payload::Reply(reply) if msg.seq == seq => Ok(reply.code),
                _ => Err(ClientError::ProtocolViolation),
            },
        }
    }

    /// Claim ownership of an opaque type.
    pub async fn register_opaque_type(
        &mut self,
        lsa_type: u8,
        opaque_type: u8,
    ) -> Result<(), ClientError> {
        self.expect_ok(Request::RegisterOpaqueType(RegisterOpaqueType {
            lsa_type,
            opaque_type,
        }))
        .await
    }

    /// Give up ownership of an opaque type, withdrawing its advertisements.
    pub async fn unregister_opaque_type(
        &mut self,
        lsa_type: u8,
        opaque_type: u8,
    ) -> Result<(), ClientError> {
        self.expect_ok(Request::UnregisterOpaqueType(UnregisterOpaqueType {
            lsa_type,
            opaque_type,
        }))
        .await
    }

    /// Replace the notification filter stored for this connection.
    pub async fn register_event(&mut self, filter: LsaFilter) -> Result<(), ClientError> {
        self.expect_ok(Request::RegisterEvent(RegisterEvent { filter }))
            .await
    }

    /// Request a one shot dump of the link state database. The matching updates arrive on the
    /// notification channel carrying this request's sequence number.
    pub async fn sync_lsdb(&mut self, filter: LsaFilter) -> Result<(), ClientError> {
        self.expect_ok(Request::SyncLsdb(SyncLsdb { filter })).await
    }

    /// Submit an advertisement prototype for origination. For link scoped advertisements
    /// `ifaddr` selects the link, for area scoped ones `area_id` selects the area; the
    /// respective other argument is ignored.
    pub async fn originate(
        &mut self,
        ifaddr: Ipv4Addr,
        area_id: Ipv4Addr,
        lsa: Lsa,
    ) -> Result<(), ClientError> {
        self.expect_ok(Request::Originate(OriginateRequest {
            ifaddr,
            area_id,
            lsa,
        }))
        .await
    }

    /// Request graceful withdrawal of a previously originated advertisement.
    pub async fn delete(
        &mut self,
        area_id: Ipv4Addr,
        lsa_type: u8,
        opaque_type: u8,
        opaque_id: u32,
    ) -> Result<(), ClientError> {
        self.expect_ok(Request::Delete(DeleteRequest {
            area_id,
            lsa_type,
            opaque_type,
            opaque_id,
        }))
        .await
    }

    /// Read one message from the notification channel and dispatch it to `handler`. Blocks until
    /// a message arrives; embed this in a loop (or a `select!`) to consume the stream.
    pub async fn pump<H: NotificationHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), ClientError> {
        match self.notify.next().await {
            None => Err(ClientError::ConnectionClosed),
            Some(Err(e)) => Err(ClientError::Io(e)),
            Some(Ok(msg)) => {
                match msg.payload {
                    Payload::Notification(notification) => {
                        dispatch_notification(handler, msg.seq, notification)
                    }
                    // Requests and replies never arrive here; drop the message, keep the
                    // channel.
                    _ => debug!("Dropping non-notification message on the notification channel"),
                }
                Ok(())
            }
        }
    }

    async fn expect_ok(&mut self, request: Request) -> Result<(), ClientError> {
        match self.request(request).await? {
            ReplyCode::Ok => Ok(()),
            code => Err(ClientError::Refused(code)),
        }
    }
}

fn dispatch_notification<H: NotificationHandler>(
    handler: &mut H,
    seq: u32,
    notification: Notification,
) {
    match notification {
        Notification::Ready(notify) => handler.ready(notify),
        Notification::NewIf(notify) => handler.interface_added(notify),
        Notification::DelIf(notify) => handler.interface_removed(notify),
        Notification::IfStateChange(notify) => handler.interface_state_change(notify),
        Notification::NeighborStateChange(notify) => handler.neighbor_state_change(notify),
        Notification::LsaUpdate(change) => handler.advertisement_update(seq, change),
        Notification::LsaDelete(change) => handler.advertisement_delete(seq, change),
    }
}
