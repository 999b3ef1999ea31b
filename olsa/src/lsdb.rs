//! The seam between the api server and the link state database it feeds.
//!
//! The real flooding machinery lives in the routing daemon; the api server only needs the narrow
//! [`LinkStateDb`] interface: look up an instance, install one (deriving age, sequence number and
//! checksum), flood it, schedule a refresh or a flush, and iterate once for a database
//! synchronization. Anything the database decides on its own time (a refresh falling due, an
//! instance disappearing) flows back to the server as an [`LsdbEvent`] on a channel handed out at
//! construction.
//!
//! [`MemoryLsdb`] is a complete in-memory implementation, used by the daemon binary and the
//! tests.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

use crate::lsa::{Lsa, LsaIdentity, LsaKey, LsaScope, LSA_INITIAL_SEQUENCE, LSA_MAX_AGE,
    LSA_MAX_SEQUENCE};

/// Default delay before a scheduled refresh fires. Rapid repeated originations within this window
/// collapse into a single refresh.
const DEFAULT_REFRESH_DELAY: Duration = Duration::from_secs(5);
/// Default delay before a scheduled flush takes effect.
const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(500);

/// Something the link state database decided on its own time.
#[derive(Debug, Clone)]
pub enum LsdbEvent {
    /// A previously scheduled refresh fell due; the lifecycle controller picks up a staged update
    /// for the identity, or re-installs the current instance.
    RefreshDue { scope: LsaScope, key: LsaKey },
    /// An instance was installed or changed (including the final max age flood of a flush).
    Updated {
        scope: LsaScope,
        self_originated: bool,
        lsa: Lsa,
    },
    /// An instance was removed from the database.
    Removed {
        scope: LsaScope,
        self_originated: bool,
        lsa: Lsa,
    },
}

/// Error installing an advertisement.
#[derive(Debug)]
pub enum InstallError {
    /// The encoded advertisement does not fit the length field.
    TooLarge,
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallError::TooLarge => f.write_str("advertisement exceeds the maximum wire size"),
        }
    }
}

impl std::error::Error for InstallError {}

/// One entry of a database iteration.
#[derive(Debug, Clone)]
pub struct LsdbEntry {
    pub scope: LsaScope,
    pub self_originated: bool,
    pub lsa: Lsa,
}

/// The narrow link state database interface the api server is written against.
pub trait LinkStateDb: Send + Sync {
    /// The currently installed instance for the identity, if any.
    fn lookup(&self, scope: &LsaScope, key: &LsaKey) -> Option<Lsa>;

    /// Install an instance: assign age 0, the next sequence number for the identity, and a fresh
    /// checksum, then store it. Returns the advertisement as installed.
    fn install(&self, scope: &LsaScope, lsa: Lsa) -> Result<Lsa, InstallError>;

    /// Flood the given instance within its scope.
    fn flood(&self, scope: &LsaScope, lsa: &Lsa);

    /// Ask for a [`LsdbEvent::RefreshDue`] for the identity. At most one refresh is outstanding
    /// per identity at any time; asking again before it fired changes nothing.
    fn schedule_refresh(&self, scope: &LsaScope, key: &LsaKey);

    /// Schedule graceful withdrawal: the instance is aged to its maximum age, flooded one final
    /// time and then removed. Never removes anything immediately.
    fn schedule_flush(&self, scope: &LsaScope, key: &LsaKey);

    /// A one shot iteration over the whole database, area scoped content before domain scoped
    /// content.
    fn snapshot(&self) -> Vec<LsdbEntry>;
}

#[derive(Debug)]
struct StoredLsa {
    lsa: Lsa,
    self_originated: bool,
}

/// An in-memory [`LinkStateDb`].
#[derive(Debug, Clone)]
pub struct MemoryLsdb {
    inner: Arc<MemoryLsdbInner>,
}

#[derive(Debug)]
struct MemoryLsdbInner {
    entries: Mutex<HashMap<LsaIdentity, StoredLsa>>,
    /// Identities with a refresh scheduled but not yet fired.
    pending_refresh: Mutex<HashSet<LsaIdentity>>,
    events: mpsc::UnboundedSender<LsdbEvent>,
    refresh_delay: Duration,
    flush_delay: Duration,
}

impl MemoryLsdb {
    /// Create a new empty database with default refresh/flush timing. The returned receiver is
    /// handed to the api server so database events reach the lifecycle controller.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LsdbEvent>) {
        Self::with_timing(DEFAULT_REFRESH_DELAY, DEFAULT_FLUSH_DELAY)
    }

    /// Like [`MemoryLsdb::new`], with explicit refresh and flush delays.
    pub fn with_timing(
        refresh_delay: Duration,
        flush_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<LsdbEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        (
            MemoryLsdb {
                inner: Arc::new(MemoryLsdbInner {
                    entries: Mutex::new(HashMap::new()),
                    pending_refresh: Mutex::new(HashSet::new()),
                    events,
                    refresh_delay,
                    flush_delay,
                }),
            },
            event_rx,
        )
    }

    /// Store an advertisement learned from the network, i.e. not originated by the local router.
    pub fn learn(&self, scope: LsaScope, lsa: Lsa) {
        let identity = LsaIdentity {
            scope,
            key: lsa.key(),
        };
        self.inner.entries.lock().unwrap().insert(
            identity,
            StoredLsa {
                lsa: lsa.clone(),
                self_originated: false,
            },
        );
        let _ = self.inner.events.send(LsdbEvent::Updated {
            scope,
            self_originated: false,
            lsa,
        });
    }
}

impl LinkStateDb for MemoryLsdb {
    fn lookup(&self, scope: &LsaScope, key: &LsaKey) -> Option<Lsa> {
        let identity = LsaIdentity {
            scope: *scope,
            key: *key,
        };
        self.inner
            .entries
            .lock()
            .unwrap()
            .get(&identity)
            .map(|stored| stored.lsa.clone())
    }

    fn install(&self, scope: &LsaScope, lsa: Lsa) -> Result<Lsa, InstallError> {
        let wire_size = lsa.wire_size();
        if u16::try_from(wire_size).is_err() {
            return Err(InstallError::TooLarge);
        }

        let identity = LsaIdentity {
            scope: *scope,
            key: lsa.key(),
        };
        let mut lsa = lsa;
        let mut entries = self.inner.entries.lock().unwrap();
        lsa.header.age = 0;
        lsa.header.sequence = match entries.get(&identity) {
            Some(stored) => next_sequence(stored.lsa.header.sequence),
            None => LSA_INITIAL_SEQUENCE,
        };
        lsa.header.length = wire_size as u16;
        lsa.refresh_checksum();

        entries.insert(
            identity,
            StoredLsa {
                lsa: lsa.clone(),
                self_originated: true,
            },
        );
        drop(entries);

        let _ = self.inner.events.send(LsdbEvent::Updated {
            scope: *scope,
            self_originated: true,
            lsa: lsa.clone(),
        });

        Ok(lsa)
    }

    fn flood(&self, scope: &LsaScope, lsa: &Lsa) {
        // There is no real network behind the in-memory database, flooding is complete the moment
        // the instance is installed.
        trace!(?scope, sequence = lsa.header.sequence, "Flooding advertisement");
    }

    fn schedule_refresh(&self, scope: &LsaScope, key: &LsaKey) {
        let identity = LsaIdentity {
            scope: *scope,
            key: *key,
        };
        {
            let mut pending = self.inner.pending_refresh.lock().unwrap();
            if !pending.insert(identity) {
                // A refresh is already on its way for this identity.
                return;
            }
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.refresh_delay).await;
            inner.pending_refresh.lock().unwrap().remove(&identity);
            let _ = inner.events.send(LsdbEvent::RefreshDue {
                scope: identity.scope,
                key: identity.key,
            });
        });
    }

    fn schedule_flush(&self, scope: &LsaScope, key: &LsaKey) {
        let identity = LsaIdentity {
            scope: *scope,
            key: *key,
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.flush_delay).await;
            let Some(mut stored) = inner.entries.lock().unwrap().remove(&identity) else {
                return;
            };
            stored.lsa.header.age = LSA_MAX_AGE;
            stored.lsa.refresh_checksum();
            // The max age instance floods one final time, the network ages it out from there.
            let _ = inner.events.send(LsdbEvent::Updated {
                scope: identity.scope,
                self_originated: stored.self_originated,
                lsa: stored.lsa.clone(),
            });
            let _ = inner.events.send(LsdbEvent::Removed {
                scope: identity.scope,
                self_originated: stored.self_originated,
                lsa: stored.lsa,
            });
        });
    }

    fn snapshot(&self) -> Vec<LsdbEntry> {
        let entries = self.inner.entries.lock().unwrap();
        let mut snapshot: Vec<_> = entries
            .iter()
            .map(|(identity, stored)| {
                (
                    *identity,
                    LsdbEntry {
                        scope: identity.scope,
                        self_originated: stored.self_originated,
                        lsa: stored.lsa.clone(),
                    },
                )
            })
            .collect();
        snapshot.sort_by_key(|(identity, _)| scope_sort_key(&identity.scope, &identity.key));
        snapshot.into_iter().map(|(_, entry)| entry).collect()
    }
}

/// The next sequence number after `sequence`. Sequence numbers are signed on the wire: they start
/// at the most negative value + 1 and count up towards the most positive, at which point the
/// space wraps around.
fn next_sequence(sequence: u32) -> u32 {
    if sequence as i32 >= LSA_MAX_SEQUENCE as i32 {
        LSA_INITIAL_SEQUENCE
    } else {
        sequence.wrapping_add(1)
    }
}

/// Sort key putting link and area scoped entries (grouped per address) before domain scoped
/// ones.
fn scope_sort_key(scope: &LsaScope, key: &LsaKey) -> (u8, u32, u8, u32) {
    let (rank, addr) = match scope {
        LsaScope::Link(ifaddr) => (0, u32::from(*ifaddr)),
        LsaScope::Area(area_id) => (1, u32::from(*area_id)),
        LsaScope::Domain => (2, 0),
    };
    (rank, addr, key.opaque_type, key.opaque_id)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::timeout;

    use super::{LinkStateDb, LsdbEvent, MemoryLsdb};
    use crate::lsa::{Lsa, LsaScope, LSA_INITIAL_SEQUENCE, LSA_MAX_AGE, LSA_MAX_SEQUENCE};

    const AREA: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

    fn sample_lsa() -> Lsa {
        let mut lsa = Lsa::prototype(10, 7, 1, Bytes::from_static(b"payload"));
        lsa.header.adv_router = Ipv4Addr::new(10, 0, 0, 1);
        lsa
    }

    #[test]
    fn install_assigns_header_fields() {
        let (lsdb, mut events) = MemoryLsdb::new();
        let scope = LsaScope::Area(AREA);

        let installed = lsdb
            .install(&scope, sample_lsa())
            .expect("small advertisement always fits");
        assert_eq!(installed.header.age, 0);
        assert_eq!(installed.header.sequence, LSA_INITIAL_SEQUENCE);
        assert!(installed.checksum_valid());

        assert_eq!(lsdb.lookup(&scope, &installed.key()), Some(installed.clone()));

        match events.try_recv().expect("install emits an update event") {
            LsdbEvent::Updated {
                self_originated,
                lsa,
                ..
            } => {
                assert!(self_originated);
                assert_eq!(lsa, installed);
            }
            other => panic!("expected update event, got {other:?}"),
        }
    }

    #[test]
    fn reinstall_bumps_sequence() {
        let (lsdb, _events) = MemoryLsdb::new();
        let scope = LsaScope::Area(AREA);

        let first = lsdb
            .install(&scope, sample_lsa())
            .expect("small advertisement always fits");
        let second = lsdb
            .install(&scope, sample_lsa())
            .expect("small advertisement always fits");
        assert_eq!(second.header.sequence, first.header.sequence + 1);
    }

    #[test]
    fn sequence_space_wraps() {
        assert_eq!(super::next_sequence(LSA_INITIAL_SEQUENCE), LSA_INITIAL_SEQUENCE + 1);
        // The unsigned space between initial and max passes through the wraparound at 0.
        assert_eq!(super::next_sequence(u32::MAX), 0);
        assert_eq!(super::next_sequence(LSA_MAX_SEQUENCE), LSA_INITIAL_SEQUENCE);
    }

    #[tokio::test]
    async fn flush_floods_max_age_then_removes() {
        let (lsdb, mut events) =
            MemoryLsdb::with_timing(Duration::from_millis(10), Duration::from_millis(10));
        let scope = LsaScope::Domain;

        let installed = lsdb
            .install(&scope, sample_lsa())
            .expect("small advertisement always fits");
        events.recv().await.expect("install event");

        lsdb.schedule_flush(&scope, &installed.key());

        match timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("flush fires well within a second")
            .expect("database is still alive")
        {
            LsdbEvent::Updated { lsa, .. } => assert_eq!(lsa.header.age, LSA_MAX_AGE),
            other => panic!("expected max age update, got {other:?}"),
        }
        match timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("removal follows the max age flood")
            .expect("database is still alive")
        {
            LsdbEvent::Removed { lsa, .. } => assert_eq!(lsa.key(), installed.key()),
            other => panic!("expected removal event, got {other:?}"),
        }

        assert_eq!(lsdb.lookup(&scope, &installed.key()), None);
    }

    #[tokio::test]
    async fn refresh_is_scheduled_at_most_once() {
        let (lsdb, mut events) =
            MemoryLsdb::with_timing(Duration::from_millis(10), Duration::from_millis(10));
        let scope = LsaScope::Area(AREA);
        let key = sample_lsa().key();

        lsdb.schedule_refresh(&scope, &key);
        lsdb.schedule_refresh(&scope, &key);

        match timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("refresh fires well within a second")
            .expect("database is still alive")
        {
            LsdbEvent::RefreshDue {
                key: fired_key, ..
            } => assert_eq!(fired_key, key),
            other => panic!("expected refresh event, got {other:?}"),
        }

        // The second schedule call collapsed into the first, nothing else fires.
        assert!(timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err());

        // Once fired, a new refresh can be scheduled again.
        lsdb.schedule_refresh(&scope, &key);
        assert!(timeout(Duration::from_secs(1), events.recv()).await.is_ok());
    }

    #[test]
    fn snapshot_orders_areas_before_domain() {
        let (lsdb, _events) = MemoryLsdb::new();

        lsdb.install(&LsaScope::Domain, sample_lsa())
            .expect("small advertisement always fits");
        lsdb.install(&LsaScope::Area(AREA), sample_lsa())
            .expect("small advertisement always fits");
        lsdb.install(&LsaScope::Link(Ipv4Addr::new(10, 0, 1, 1)), {
            let mut lsa = sample_lsa();
            lsa.header.lsa_type = 9;
            lsa
        })
        .expect("small advertisement always fits");

        let snapshot = lsdb.snapshot();
        let scopes: Vec<_> = snapshot.iter().map(|entry| entry.scope).collect();
        assert_eq!(
            scopes,
            vec![
                LsaScope::Link(Ipv4Addr::new(10, 0, 1, 1)),
                LsaScope::Area(AREA),
                LsaScope::Domain
            ]
        );
    }

    #[test]
    fn learned_entries_are_not_self_originated() {
        let (lsdb, mut events) = MemoryLsdb::new();
        let mut lsa = sample_lsa();
        lsa.header.sequence = LSA_INITIAL_SEQUENCE;
        lsa.refresh_checksum();

        lsdb.learn(LsaScope::Area(AREA), lsa.clone());

        let snapshot = lsdb.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].self_originated);

        match events.try_recv().expect("learn emits an update event") {
            LsdbEvent::Updated {
                self_originated, ..
            } => assert!(!self_originated),
            other => panic!("expected update event, got {other:?}"),
        }
    }
}
