//! The command dispatcher and the advertisement lifecycle.
//!
//! Every request read from a session's synchronous channel lands here, is mapped to one of the
//! six handlers, and produces exactly one reply carrying the request's sequence number. The
//! lifecycle half drives an advertisement from prototype to installed instance, through staged
//! updates and refreshes, to its eventual graceful withdrawal.

use tracing::{debug, error, info, trace};

use crate::{
    lsa::{
        LsaIdentity, LsaKey, LsaScope, LSA_TYPE_OPAQUE_AREA, LSA_TYPE_OPAQUE_DOMAIN,
        LSA_TYPE_OPAQUE_LINK,
    },
    lsdb::InstallError,
    metrics::Metrics,
    proto::{
        DeleteRequest, LsaChange, Message, Notification, OriginateRequest, RegisterEvent,
        RegisterOpaqueType, ReplyCode, Request, SyncLsdb, UnregisterOpaqueType,
    },
    readiness,
    registry::OpaqueTypeKey,
    server::{notify_addrs, ApiServer},
    session::{RequestEnvelope, Session},
};

impl<M> ApiServer<M>
where
    M: Metrics + Clone + Send + Sync + 'static,
{
    /// Dispatch one request and queue the reply on the session's synchronous channel.
    pub(crate) fn handle_request(&self, envelope: RequestEnvelope) {
        let RequestEnvelope {
            session,
            seq,
            request,
        } = envelope;
        self.inner.metrics.request_handled();

        let code = match request {
            Request::RegisterOpaqueType(request) => self.register_opaque_type(&session, request),
            Request::UnregisterOpaqueType(request) => {
                self.unregister_opaque_type(&session, request)
            }
            Request::RegisterEvent(request) => self.register_event(&session, request),
            Request::SyncLsdb(request) => self.sync_lsdb(&session, seq, request),
            Request::Originate(request) => self.originate(&session, request),
            Request::Delete(request) => self.delete(&session, request),
        };

        trace!("Replying {code} to request {seq} of {}", session.id());
        if session.send_sync(Message::reply(seq, code)).is_err() {
            debug!("{} went away before its reply could be queued", session.id());
        }
    }

    /// REGISTER: claim ownership of an opaque type, then greet the session with the scopes that
    /// are already ready for it.
    fn register_opaque_type(&self, session: &Session, request: RegisterOpaqueType) -> ReplyCode {
        if !crate::lsa::is_opaque_type(request.lsa_type) {
            return ReplyCode::IllegalAdvertisementType;
        }
        let key = OpaqueTypeKey {
            lsa_type: request.lsa_type,
            opaque_type: request.opaque_type,
        };
        if self
            .inner
            .registry
            .lock()
            .unwrap()
            .register(key, session.id())
            .is_err()
        {
            return ReplyCode::TypeInUse;
        }
        session.add_registration(key);
        self.inner.metrics.opaque_type_registered();
        info!(
            "{} registered opaque type ({}, {})",
            session.id(),
            key.lsa_type,
            key.opaque_type
        );

        // Readiness transitions that happened before this registration were never reported to
        // anyone; catch the session up on scopes that are ready right now.
        let ready = {
            let topology = self.inner.topology.read().unwrap();
            readiness::ready_scopes_for_type(&topology, key.lsa_type)
        };
        for scope in ready {
            let notification = Notification::Ready(crate::proto::ReadyNotify {
                lsa_type: key.lsa_type,
                opaque_type: key.opaque_type,
                addr: scope.notify_addr(),
            });
            if session
                .send_notification(Message::notification(notification))
                .is_ok()
            {
                self.inner.metrics.notification_sent();
            }
        }

        ReplyCode::Ok
    }

    /// UNREGISTER: flush everything the pair originated, then release ownership.
    fn unregister_opaque_type(
        &self,
        session: &Session,
        request: UnregisterOpaqueType,
    ) -> ReplyCode {
        let key = OpaqueTypeKey {
            lsa_type: request.lsa_type,
            opaque_type: request.opaque_type,
        };
        if self
            .inner
            .registry
            .lock()
            .unwrap()
            .unregister(key, session.id())
            .is_err()
        {
            return ReplyCode::NotRegistered;
        }
        self.flush_matching(&key);
        session.remove_registration(key);
        self.inner.metrics.opaque_type_released();
        info!(
            "{} unregistered opaque type ({}, {})",
            session.id(),
            key.lsa_type,
            key.opaque_type
        );
        ReplyCode::Ok
    }

    /// REGISTER_EVENT: replace the session's notification filter wholesale.
    fn register_event(&self, session: &Session, request: RegisterEvent) -> ReplyCode {
        session.set_filter(request.filter);
        ReplyCode::Ok
    }

    /// SYNC_LSDB: iterate the database once and send an update for every advertisement passing
    /// the filter carried by the request itself (not the session's stored filter). The whole
    /// burst carries the request's sequence number so the client can tell it apart from the
    /// steady state stream.
    fn sync_lsdb(&self, session: &Session, seq: u32, request: SyncLsdb) -> ReplyCode {
        let entries = self.inner.lsdb.snapshot();
        let topology = self.inner.topology.read().unwrap();
        for entry in entries {
            let area_id = match entry.scope {
                LsaScope::Area(area_id) => Some(area_id),
                LsaScope::Link(ifaddr) => topology.area_of(ifaddr),
                LsaScope::Domain => None,
            };
            if !request.filter.matches(
                entry.lsa.header.lsa_type,
                entry.self_originated,
                area_id,
            ) {
                continue;
            }
            let (ifaddr, notify_area) = notify_addrs(&entry.scope, area_id);
            let notification = Notification::LsaUpdate(LsaChange {
                ifaddr,
                area_id: notify_area,
                self_originated: entry.self_originated,
                lsa: entry.lsa,
            });
            if session
                .send_notification(Message::notification_with_seq(seq, notification))
                .is_ok()
            {
                self.inner.metrics.notification_sent();
            }
        }
        ReplyCode::Ok
    }

    /// ORIGINATE: install a first instance directly, or stage the prototype behind an already
    /// installed one and leave the actual refresh to the database's refresh trigger. Staging is
    /// latest-wins, so rapid repeated originations collapse into a single refresh installing the
    /// newest prototype.
    fn originate(&self, session: &Session, request: OriginateRequest) -> ReplyCode {
        let scope = match request.lsa.header.lsa_type {
            LSA_TYPE_OPAQUE_LINK => {
                let topology = self.inner.topology.read().unwrap();
                if topology.interface(request.ifaddr).is_none() {
                    return ReplyCode::NoSuchInterface;
                }
                LsaScope::Link(request.ifaddr)
            }
            LSA_TYPE_OPAQUE_AREA => {
                if !self.inner.topology.read().unwrap().has_area(request.area_id) {
                    return ReplyCode::NoSuchArea;
                }
                LsaScope::Area(request.area_id)
            }
            LSA_TYPE_OPAQUE_DOMAIN => LsaScope::Domain,
            _ => return ReplyCode::IllegalAdvertisementType,
        };

        let key = request.lsa.key();
        if !self.inner.registry.lock().unwrap().is_owned_by(
            OpaqueTypeKey {
                lsa_type: key.lsa_type,
                opaque_type: key.opaque_type,
            },
            session.id(),
        ) {
            return ReplyCode::NotRegistered;
        }

        {
            let topology = self.inner.topology.read().unwrap();
            if !readiness::scope_ready(&topology, &scope) {
                return ReplyCode::NotReady;
            }
        }

        let mut lsa = request.lsa;
        lsa.header.adv_router = self.inner.router_id;
        let identity = LsaIdentity { scope, key };

        if self.inner.lsdb.lookup(&scope, &key).is_some() {
            // An older instance is installed; park the prototype and let the refresh trigger
            // pick it up. A newer prototype overwrites an already staged one.
            session.stage(identity, lsa);
            self.inner.lsdb.schedule_refresh(&scope, &key);
            trace!(
                "Staged updated advertisement ({}, {}, {}) from {}",
                key.lsa_type,
                key.opaque_type,
                key.opaque_id,
                session.id()
            );
            return ReplyCode::Ok;
        }

        match self.inner.lsdb.install(&scope, lsa) {
            Ok(installed) => {
                self.inner.lsdb.flood(&scope, &installed);
                self.inner.metrics.lsa_originated();
                info!(
                    "Originated advertisement ({}, {}, {}) for {}",
                    key.lsa_type,
                    key.opaque_type,
                    key.opaque_id,
                    session.id()
                );
                ReplyCode::Ok
            }
            Err(InstallError::TooLarge) => ReplyCode::NoMemory,
        }
    }

    /// DELETE: never removes anything immediately. The instance is aged out gracefully through a
    /// scheduled flush.
    fn delete(&self, session: &Session, request: DeleteRequest) -> ReplyCode {
        if !crate::lsa::is_opaque_type(request.lsa_type) {
            return ReplyCode::IllegalAdvertisementType;
        }
        if !self.inner.registry.lock().unwrap().is_owned_by(
            OpaqueTypeKey {
                lsa_type: request.lsa_type,
                opaque_type: request.opaque_type,
            },
            session.id(),
        ) {
            return ReplyCode::NotRegistered;
        }

        let key = LsaKey {
            lsa_type: request.lsa_type,
            opaque_type: request.opaque_type,
            opaque_id: request.opaque_id,
        };
        let scope = match request.lsa_type {
            LSA_TYPE_OPAQUE_DOMAIN => LsaScope::Domain,
            LSA_TYPE_OPAQUE_AREA => {
                if !self.inner.topology.read().unwrap().has_area(request.area_id) {
                    return ReplyCode::NoSuchArea;
                }
                LsaScope::Area(request.area_id)
            }
            // The deletion request addresses link scoped advertisements through their area; find
            // the interface in that area holding the instance.
            _ => {
                let topology = self.inner.topology.read().unwrap();
                if !topology.has_area(request.area_id) {
                    return ReplyCode::NoSuchArea;
                }
                let holder = topology
                    .interfaces()
                    .filter(|interface| interface.area_id == request.area_id)
                    .map(|interface| LsaScope::Link(interface.addr))
                    .find(|scope| self.inner.lsdb.lookup(scope, &key).is_some());
                match holder {
                    Some(scope) => scope,
                    None => return ReplyCode::NoSuchAdvertisement,
                }
            }
        };

        if self.inner.lsdb.lookup(&scope, &key).is_none() {
            return ReplyCode::NoSuchAdvertisement;
        }

        // A staged update for a withdrawn advertisement would resurrect it on the next refresh.
        session.take_staged(&LsaIdentity { scope, key });

        self.inner.lsdb.schedule_flush(&scope, &key);
        self.inner.metrics.lsa_flush_scheduled();
        info!(
            "Scheduled withdrawal of advertisement ({}, {}, {}) for {}",
            key.lsa_type,
            key.opaque_type,
            key.opaque_id,
            session.id()
        );
        ReplyCode::Ok
    }

    /// A refresh fell due for an identity: install the staged prototype if the owning session
    /// parked one, otherwise re-install the current instance with a bumped sequence number.
    pub(crate) fn handle_refresh(&self, scope: LsaScope, key: LsaKey) {
        let identity = LsaIdentity { scope, key };
        let staged = self.owner_of(&key).and_then(|owner| owner.take_staged(&identity));

        let lsa = match staged {
            Some(lsa) => lsa,
            None => match self.inner.lsdb.lookup(&scope, &key) {
                Some(lsa) => lsa,
                None => {
                    debug!(
                        "Refresh due for unknown advertisement ({}, {}, {})",
                        key.lsa_type, key.opaque_type, key.opaque_id
                    );
                    return;
                }
            },
        };

        match self.inner.lsdb.install(&scope, lsa) {
            Ok(installed) => {
                self.inner.lsdb.flood(&scope, &installed);
                self.inner.metrics.lsa_refreshed();
                trace!(
                    "Refreshed advertisement ({}, {}, {}) to sequence {:#x}",
                    key.lsa_type,
                    key.opaque_type,
                    key.opaque_id,
                    installed.header.sequence
                );
            }
            Err(e) => error!(
                "Failed to refresh advertisement ({}, {}, {}): {e}",
                key.lsa_type, key.opaque_type, key.opaque_id
            ),
        }
    }

    /// The session currently owning the opaque type of `key`.
    fn owner_of(&self, key: &LsaKey) -> Option<Session> {
        let owner = self.inner.registry.lock().unwrap().owner(OpaqueTypeKey {
            lsa_type: key.lsa_type,
            opaque_type: key.opaque_type,
        })?;
        self.inner.sessions.lock().unwrap().get(&owner).cloned()
    }
}
