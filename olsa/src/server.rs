//! The api server: accepts client connections, performs the reverse connect bootstrap, owns the
//! session registry, and forwards topology and database changes to interested clients.
//!
//! Bootstrap of a session: the client connects to the well known synchronous port. The server
//! accepts, reads the peer address of the new connection, and immediately connects back to the
//! peer on `source port + 1`; that reverse connection becomes the asynchronous notification
//! channel, the original one remains the request/reply channel. A failure anywhere in this
//! sequence tears down everything opened so far, no partial session is ever retained.
//!
//! All requests, database events and session deaths funnel into a single dispatch task, which
//! serializes the command dispatcher and the advertisement lifecycle. Topology hooks are called
//! by the embedding daemon from its own tasks and only touch lock protected state.

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    task::AbortHandle,
};
use tracing::{debug, error, info};

use crate::{
    lsa::{Lsa, LsaScope},
    lsdb::{LinkStateDb, LsdbEvent},
    metrics::Metrics,
    proto::{
        DelIf, IfStateChange, LsaChange, Message, NeighborStateChange, NewIf, Notification,
        ReadyNotify,
    },
    readiness::ReadinessTracker,
    registry::{OpaqueTypeKey, OpaqueTypeRegistry},
    session::{RequestEnvelope, Session, SessionId, SessionStats},
    topology::{IfState, Interface, Neighbor, NeighborState, Topology},
};

/// The api server of one routing daemon instance.
pub struct ApiServer<M> {
    pub(crate) inner: Arc<ServerInner<M>>,
}

impl<M> Clone for ApiServer<M> {
    fn clone(&self) -> Self {
        ApiServer {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct ServerInner<M> {
    pub(crate) lsdb: Arc<dyn LinkStateDb>,
    pub(crate) topology: RwLock<Topology>,
    readiness: Mutex<ReadinessTracker>,
    pub(crate) sessions: Mutex<HashMap<SessionId, Session>>,
    pub(crate) registry: Mutex<OpaqueTypeRegistry>,
    /// Advertising router put in every advertisement installed on behalf of a client.
    pub(crate) router_id: Ipv4Addr,
    local_addr: SocketAddr,
    next_session_id: AtomicU64,
    request_tx: mpsc::UnboundedSender<RequestEnvelope>,
    dead_session_tx: mpsc::Sender<Session>,
    abort_handles: Mutex<Vec<AbortHandle>>,
    pub(crate) metrics: M,
}

impl<M> ApiServer<M>
where
    M: Metrics + Clone + Send + Sync + 'static,
{
    /// Start an api server listening on `listen_addr`, serving the given link state database.
    /// `lsdb_events` is the event stream handed out by the database at construction.
    pub async fn new(
        listen_addr: SocketAddr,
        router_id: Ipv4Addr,
        lsdb: Arc<dyn LinkStateDb>,
        lsdb_events: mpsc::UnboundedReceiver<LsdbEvent>,
        metrics: M,
    ) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (dead_session_tx, dead_session_rx) = mpsc::channel(16);

        let server = ApiServer {
            inner: Arc::new(ServerInner {
                lsdb,
                topology: RwLock::new(Topology::new()),
                readiness: Mutex::new(ReadinessTracker::new()),
                sessions: Mutex::new(HashMap::new()),
                registry: Mutex::new(OpaqueTypeRegistry::new()),
                router_id,
                local_addr,
                next_session_id: AtomicU64::new(1),
                request_tx,
                dead_session_tx,
                abort_handles: Mutex::new(Vec::new()),
                metrics,
            }),
        };

        let accept = tokio::spawn(server.clone().accept_loop(listener));
        let dispatch =
            tokio::spawn(
                server
                    .clone()
                    .dispatch_loop(request_rx, dead_session_rx, lsdb_events),
            );
        server
            .inner
            .abort_handles
            .lock()
            .unwrap()
            .extend([accept.abort_handle(), dispatch.abort_handle()]);

        info!("Api server listening on {local_addr}");

        Ok(server)
    }

    /// The address the server accepts synchronous connections on.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Information about the currently connected sessions.
    pub fn sessions(&self) -> Vec<SessionStats> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(Session::stats)
            .collect()
    }

    /// Tear down every session and stop the background tasks.
    pub fn shutdown(&self) {
        let sessions: Vec<Session> = self
            .inner
            .sessions
            .lock()
            .unwrap()
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in &sessions {
            session.died();
        }
        info!("Api server shut down, dropped {} sessions", sessions.len());
        for handle in self.inner.abort_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((sync_stream, peer)) => {
                    if let Err(e) = self.bootstrap_session(sync_stream, peer).await {
                        // The synchronous stream is dropped with the error, nothing is retained.
                        error!("Bootstrap of api client {peer} failed: {e}");
                    }
                }
                Err(e) => error!("Failed to accept api client connection: {e}"),
            }
        }
    }

    /// Complete the reverse connect bootstrap for a freshly accepted synchronous connection.
    async fn bootstrap_session(
        &self,
        sync_stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), io::Error> {
        let notify_port = peer.port().checked_add(1).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "peer source port leaves no room for the notification port",
            )
        })?;
        let notify_stream = TcpStream::connect(SocketAddr::new(peer.ip(), notify_port)).await?;

        let id = SessionId::new(self.inner.next_session_id.fetch_add(1, Ordering::Relaxed));
        let session = Session::new(
            id,
            sync_stream,
            notify_stream,
            self.inner.request_tx.clone(),
            self.inner.dead_session_tx.clone(),
        )?;

        self.inner.sessions.lock().unwrap().insert(id, session);
        self.inner.metrics.session_connected();
        info!("Accepted api client {peer} as {id}");

        Ok(())
    }

    async fn dispatch_loop(
        self,
        mut request_rx: mpsc::UnboundedReceiver<RequestEnvelope>,
        mut dead_session_rx: mpsc::Receiver<Session>,
        mut lsdb_events: mpsc::UnboundedReceiver<LsdbEvent>,
    ) {
        loop {
            select! {
                envelope = request_rx.recv() => match envelope {
                    None => break,
                    Some(envelope) => self.handle_request(envelope),
                },
                session = dead_session_rx.recv() => match session {
                    None => break,
                    Some(session) => self.teardown_session(session),
                },
                event = lsdb_events.recv() => match event {
                    None => break,
                    Some(event) => self.handle_lsdb_event(event),
                },
            }
        }
    }

    fn handle_lsdb_event(&self, event: LsdbEvent) {
        match event {
            LsdbEvent::RefreshDue { scope, key } => self.handle_refresh(scope, key),
            LsdbEvent::Updated {
                scope,
                self_originated,
                lsa,
            } => self.broadcast_lsa_change(scope, self_originated, lsa, false),
            LsdbEvent::Removed {
                scope,
                self_originated,
                lsa,
            } => self.broadcast_lsa_change(scope, self_originated, lsa, true),
        }
    }

    /// Release everything a departed session held: its spot in the registry, its opaque type
    /// ownerships, and (through a flush) its self originated advertisements.
    fn teardown_session(&self, session: Session) {
        if self
            .inner
            .sessions
            .lock()
            .unwrap()
            .remove(&session.id())
            .is_none()
        {
            // Already torn down through shutdown.
            return;
        }
        session.died();
        self.inner.metrics.session_disconnected();

        let released = self.inner.registry.lock().unwrap().release_session(session.id());
        for key in &released {
            self.flush_matching(key);
            self.inner.metrics.opaque_type_released();
        }
        info!(
            "{} torn down, released {} opaque type registrations",
            session.id(),
            released.len()
        );
    }

    /// Schedule withdrawal of every self originated advertisement matching the opaque type.
    pub(crate) fn flush_matching(&self, key: &OpaqueTypeKey) {
        for entry in self.inner.lsdb.snapshot() {
            let lsa_key = entry.lsa.key();
            if entry.self_originated
                && lsa_key.lsa_type == key.lsa_type
                && lsa_key.opaque_type == key.opaque_type
            {
                self.inner.lsdb.schedule_flush(&entry.scope, &lsa_key);
                self.inner.metrics.lsa_flush_scheduled();
            }
        }
    }

    /// An interface appeared in the daemon's topology.
    pub fn add_interface(&self, addr: Ipv4Addr, area_id: Ipv4Addr) {
        self.inner.topology.write().unwrap().add_interface(Interface {
            addr,
            area_id,
            state: IfState::Down,
        });
        self.broadcast_notification(Notification::NewIf(NewIf {
            ifaddr: addr,
            area_id,
        }));
        self.reevaluate_readiness();
    }

    /// An interface disappeared from the daemon's topology.
    pub fn remove_interface(&self, addr: Ipv4Addr) {
        let removed = self.inner.topology.write().unwrap().remove_interface(addr);
        let Some(interface) = removed else {
            debug!("Removal of unknown interface {addr} ignored");
            return;
        };
        self.broadcast_notification(Notification::DelIf(DelIf {
            ifaddr: addr,
            area_id: interface.area_id,
        }));
        self.reevaluate_readiness();
    }

    /// An interface changed state.
    pub fn interface_state_change(&self, addr: Ipv4Addr, state: IfState) {
        let area_id = {
            let mut topology = self.inner.topology.write().unwrap();
            if !topology.set_interface_state(addr, state) {
                debug!("State change of unknown interface {addr} ignored");
                return;
            }
            topology.area_of(addr)
        };
        if let Some(area_id) = area_id {
            self.broadcast_notification(Notification::IfStateChange(IfStateChange {
                ifaddr: addr,
                area_id,
                state,
            }));
        }
        self.reevaluate_readiness();
    }

    /// A neighbor appeared or changed state on an interface.
    pub fn neighbor_state_change(&self, ifaddr: Ipv4Addr, neighbor: Neighbor) {
        if !self
            .inner
            .topology
            .write()
            .unwrap()
            .upsert_neighbor(ifaddr, neighbor)
        {
            debug!("Neighbor change on unknown interface {ifaddr} ignored");
            return;
        }
        self.broadcast_notification(Notification::NeighborStateChange(NeighborStateChange {
            ifaddr,
            neighbor_addr: neighbor.addr,
            router_id: neighbor.router_id,
            state: neighbor.state,
        }));
        self.reevaluate_readiness();
    }

    /// A neighbor went away.
    pub fn remove_neighbor(&self, ifaddr: Ipv4Addr, neighbor_addr: Ipv4Addr) {
        let removed = self
            .inner
            .topology
            .write()
            .unwrap()
            .remove_neighbor(ifaddr, neighbor_addr);
        let Some(neighbor) = removed else {
            debug!("Removal of unknown neighbor {neighbor_addr} on {ifaddr} ignored");
            return;
        };
        self.broadcast_notification(Notification::NeighborStateChange(NeighborStateChange {
            ifaddr,
            neighbor_addr,
            router_id: neighbor.router_id,
            state: NeighborState::Deleted,
        }));
        self.reevaluate_readiness();
    }

    /// Recompute scope readiness and notify registered sessions about scopes that just became
    /// ready. Each false to true transition is reported exactly once.
    fn reevaluate_readiness(&self) {
        let transitions = {
            let topology = self.inner.topology.read().unwrap();
            self.inner.readiness.lock().unwrap().reevaluate(&topology)
        };
        if transitions.is_empty() {
            return;
        }

        let sessions = self.sessions_snapshot();
        for transition in transitions {
            for session in &sessions {
                for key in session.registrations() {
                    if key.lsa_type != transition.lsa_type() {
                        continue;
                    }
                    let notification = Notification::Ready(ReadyNotify {
                        lsa_type: key.lsa_type,
                        opaque_type: key.opaque_type,
                        addr: transition.notify_addr(),
                    });
                    if session
                        .send_notification(Message::notification(notification))
                        .is_ok()
                    {
                        self.inner.metrics.notification_sent();
                    }
                }
            }
        }
    }

    /// Deliver a notification to every live session, regardless of its filter. Used for the
    /// topology notifications.
    fn broadcast_notification(&self, notification: Notification) {
        for session in self.sessions_snapshot() {
            if !session.alive() {
                continue;
            }
            if session
                .send_notification(Message::notification(notification.clone()))
                .is_ok()
            {
                self.inner.metrics.notification_sent();
            }
        }
    }

    /// Deliver an advertisement change to every session whose filter accepts it.
    pub(crate) fn broadcast_lsa_change(
        &self,
        scope: LsaScope,
        self_originated: bool,
        lsa: Lsa,
        removed: bool,
    ) {
        let area_id = match scope {
            LsaScope::Area(area_id) => Some(area_id),
            LsaScope::Link(ifaddr) => self.inner.topology.read().unwrap().area_of(ifaddr),
            LsaScope::Domain => None,
        };
        let (ifaddr, notify_area) = notify_addrs(&scope, area_id);

        for session in self.sessions_snapshot() {
            if !session.alive() {
                continue;
            }
            if !session
                .filter()
                .matches(lsa.header.lsa_type, self_originated, area_id)
            {
                continue;
            }
            let change = LsaChange {
                ifaddr,
                area_id: notify_area,
                self_originated,
                lsa: lsa.clone(),
            };
            let notification = if removed {
                Notification::LsaDelete(change)
            } else {
                Notification::LsaUpdate(change)
            };
            if session
                .send_notification(Message::notification(notification))
                .is_ok()
            {
                self.inner.metrics.notification_sent();
            }
        }
    }

    pub(crate) fn sessions_snapshot(&self) -> Vec<Session> {
        self.inner.sessions.lock().unwrap().values().cloned().collect()
    }
}

/// The interface and area addresses put in a notification about an advertisement with the given
/// scope: the interface address is only meaningful for link scope, the area id only for link and
/// area scope.
pub(crate) fn notify_addrs(
    scope: &LsaScope,
    area_id: Option<Ipv4Addr>,
) -> (Ipv4Addr, Ipv4Addr) {
    match scope {
        LsaScope::Link(ifaddr) => (*ifaddr, area_id.unwrap_or(Ipv4Addr::UNSPECIFIED)),
        LsaScope::Area(area_id) => (Ipv4Addr::UNSPECIFIED, *area_id),
        LsaScope::Domain => (Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED),
    }
}
