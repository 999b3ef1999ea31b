//! The server side representation of one connected api client.
//!
//! A session owns the two sockets of its peer: the synchronous channel carrying requests and
//! replies, and the asynchronous channel carrying notifications. Each channel has its own
//! unbounded outbound queue, drained by a dedicated task which writes one message at a time, so
//! enqueueing never blocks, messages leave in FIFO order per channel, and at most one write is in
//! flight per channel. A slow peer only ever stalls its own session.

use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Instant,
};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{
    net::TcpStream,
    select,
    sync::{mpsc, watch},
};
use tracing::{debug, error, info};

use crate::{
    lsa::{Lsa, LsaIdentity},
    proto::{Codec, LsaFilter, Message, Payload, Request},
    registry::OpaqueTypeKey,
};

/// Identifier of a connected client session, unique within one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(value: u64) -> Self {
        SessionId(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("session {}", self.0))
    }
}

/// A request read from a session's synchronous channel, tagged with the session it came from.
pub(crate) struct RequestEnvelope {
    pub session: Session,
    pub seq: u32,
    pub request: Request,
}

/// Marker error to indicate a message could not be queued because the session is gone.
#[derive(Debug)]
pub struct SessionClosed;

/// Identification and information about one connected client session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub id: u64,
    /// Peer address of the synchronous channel.
    pub peer: SocketAddr,
    /// Peer address of the asynchronous channel.
    pub notify_peer: SocketAddr,
    /// Number of opaque types registered by this session.
    pub registrations: usize,
    /// Seconds since the session completed its bootstrap.
    pub connected_secs: u64,
}

/// One connected api client.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    id: SessionId,
    peer: SocketAddr,
    notify_peer: SocketAddr,
    /// Outbound queue of the synchronous channel (replies).
    sync_tx: mpsc::UnboundedSender<Message>,
    /// Outbound queue of the asynchronous channel (notifications).
    notify_tx: mpsc::UnboundedSender<Message>,
    state: RwLock<SessionState>,
    alive: AtomicBool,
    /// Signal to the channel tasks that the session was torn down.
    death: watch::Sender<bool>,
    connected_at: Instant,
}

#[derive(Debug, Default)]
struct SessionState {
    /// Opaque types registered by this session.
    registrations: Vec<OpaqueTypeKey>,
    /// The notification filter, replaced wholesale by a register event request.
    filter: LsaFilter,
    /// Staging store: the latest pending prototype per advertisement identity, waiting for the
    /// refresh of an older installed instance.
    staged: HashMap<LsaIdentity, Lsa>,
}

impl Session {
    /// Set up a session over a freshly bootstrapped socket pair. Requests read from the
    /// synchronous channel are forwarded to `request_tx`; when either channel fails the session
    /// announces itself on `dead_session_tx` exactly once.
    pub(crate) fn new(
        id: SessionId,
        sync_stream: TcpStream,
        notify_stream: TcpStream,
        request_tx: mpsc::UnboundedSender<RequestEnvelope>,
        dead_session_tx: mpsc::Sender<Session>,
    ) -> Result<Session, io::Error> {
        let peer = sync_stream.peer_addr()?;
        let notify_peer = notify_stream.peer_addr()?;

        let (sync_tx, mut sync_rx) = mpsc::unbounded_channel();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let (death, _) = watch::channel(false);

        let session = Session {
            inner: Arc::new(SessionInner {
                id,
                peer,
                notify_peer,
                sync_tx,
                notify_tx,
                state: RwLock::new(SessionState::default()),
                alive: AtomicBool::new(true),
                death,
                connected_at: Instant::now(),
            }),
        };

        let (mut sync_sink, mut sync_read) =
            tokio_util::codec::Framed::new(sync_stream, Codec::new()).split();
        // Notifications flow one way, the read half of the asynchronous channel is never used.
        let (mut notify_sink, _) =
            tokio_util::codec::Framed::new(notify_stream, Codec::new()).split();

        // Writer of the asynchronous channel: one message per iteration, in queue order.
        {
            let session = session.clone();
            let mut death_watcher = session.inner.death.subscribe();
            tokio::spawn(async move {
                loop {
                    select! {
                        msg = notify_rx.recv() => match msg {
                            None => break,
                            Some(msg) => {
                                if let Err(e) = notify_sink.send(msg).await {
                                    error!("Failed to write notification to {}: {e}", session.id());
                                    session.died();
                                    break;
                                }
                            }
                        },
                        _ = death_watcher.changed() => break,
                    }
                }
            });
        }

        // Reader and writer of the synchronous channel. This task is the sole reporter of the
        // session's death to the server.
        {
            let session = session.clone();
            let mut death_watcher = session.inner.death.subscribe();
            tokio::spawn(async move {
                loop {
                    select! {
                        frame = sync_read.next() => match frame {
                            Some(Ok(msg)) => match msg.payload {
                                Payload::Request(request) => {
                                    let envelope = RequestEnvelope {
                                        session: session.clone(),
                                        seq: msg.seq,
                                        request,
                                    };
                                    if request_tx.send(envelope).is_err() {
                                        // Server dispatch is gone, we are shutting down.
                                        break;
                                    }
                                }
                                // Replies and notifications never originate at the client; the
                                // message is dropped, the session stays up.
                                _ => debug!(
                                    "Dropping non-request message on the synchronous channel of {}",
                                    session.id()
                                ),
                            },
                            Some(Err(e)) => {
                                error!("Frame error from {}: {e}", session.id());
                                break;
                            }
                            None => {
                                info!("{} closed by peer", session.id());
                                break;
                            }
                        },
                        reply = sync_rx.recv() => match reply {
                            None => break,
                            Some(msg) => {
                                if let Err(e) = sync_sink.send(msg).await {
                                    error!("Failed to write reply to {}: {e}", session.id());
                                    break;
                                }
                            }
                        },
                        _ = death_watcher.changed() => break,
                    }
                }

                session.died();
                if dead_session_tx.send(session.clone()).await.is_err() {
                    debug!("Server gone before {} could report its death", session.id());
                }
            });
        }

        Ok(session)
    }

    pub(crate) fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Queue a reply on the synchronous channel. Enqueueing never blocks.
    pub(crate) fn send_sync(&self, msg: Message) -> Result<(), SessionClosed> {
        self.inner.sync_tx.send(msg).map_err(|_| SessionClosed)
    }

    /// Queue a notification on the asynchronous channel. Enqueueing never blocks.
    pub(crate) fn send_notification(&self, msg: Message) -> Result<(), SessionClosed> {
        self.inner.notify_tx.send(msg).map_err(|_| SessionClosed)
    }

    /// The session's stored notification filter.
    pub(crate) fn filter(&self) -> LsaFilter {
        self.inner.state.read().unwrap().filter.clone()
    }

    /// Replace the stored notification filter wholesale.
    pub(crate) fn set_filter(&self, filter: LsaFilter) {
        self.inner.state.write().unwrap().filter = filter;
    }

    /// Record a registration. Returns false if the key was already recorded.
    pub(crate) fn add_registration(&self, key: OpaqueTypeKey) -> bool {
        let mut state = self.inner.state.write().unwrap();
        if state.registrations.contains(&key) {
            return false;
        }
        state.registrations.push(key);
        true
    }

    /// Drop a registration.
    pub(crate) fn remove_registration(&self, key: OpaqueTypeKey) {
        self.inner
            .state
            .write()
            .unwrap()
            .registrations
            .retain(|registered| *registered != key);
    }

    /// The opaque types registered by this session.
    pub(crate) fn registrations(&self) -> Vec<OpaqueTypeKey> {
        self.inner.state.read().unwrap().registrations.clone()
    }

    /// Park a prototype in the staging store, superseding any earlier staged prototype for the
    /// same identity. Latest write wins.
    pub(crate) fn stage(&self, identity: LsaIdentity, lsa: Lsa) {
        self.inner.state.write().unwrap().staged.insert(identity, lsa);
    }

    /// Take the pending prototype for an identity out of the staging store.
    pub(crate) fn take_staged(&self, identity: &LsaIdentity) -> Option<Lsa> {
        self.inner.state.write().unwrap().staged.remove(identity)
    }

    /// Mark the session dead and wake its channel tasks. Queued messages are discarded with the
    /// tasks.
    pub(crate) fn died(&self) {
        self.inner.alive.store(false, Ordering::Relaxed);
        let _ = self.inner.death.send(true);
    }

    /// Whether the session's channels are still believed to be working.
    pub(crate) fn alive(&self) -> bool {
        self.inner.alive.load(Ordering::Relaxed)
    }

    pub(crate) fn stats(&self) -> SessionStats {
        SessionStats {
            id: self.inner.id.0,
            peer: self.inner.peer,
            notify_peer: self.inner.notify_peer,
            registrations: self.inner.state.read().unwrap().registrations.len(),
            connected_secs: self.inner.connected_at.elapsed().as_secs(),
        }
    }
}
