//! Client/server api for injecting opaque advertisements into a link state routing daemon.
//!
//! External applications use this api to originate, receive and withdraw opaque advertisements
//! (application defined payloads carried inside the routing protocol's flooding mechanism)
//! without being part of the daemon process. A connection consists of two tcp channels: the
//! synchronous channel carries requests and their replies, the asynchronous channel carries
//! unsolicited notifications (topology changes, advertisement changes, readiness). The
//! asynchronous channel is established through a reverse connect: the daemon, upon accepting a
//! client, immediately connects back to the client's source port + 1, so a single well known
//! port suffices for discovery.
//!
//! The server half ([`ApiServer`](server::ApiServer)) is embedded into the routing daemon and
//! talks to the link state database through the narrow [`LinkStateDb`](lsdb::LinkStateDb)
//! interface; [`MemoryLsdb`](lsdb::MemoryLsdb) is a self contained in-memory implementation.
//! The client half ([`ApiClient`](client::ApiClient)) is embedded into the external
//! application.
//!
//! Advertisements pass through a small lifecycle: origination is gated on scope readiness (at
//! least one opaque capable, fully adjacent neighbor in the scope), a re-origination of an
//! installed advertisement is staged (latest write wins) until the database's refresh trigger
//! picks it up, and withdrawal always happens gracefully by aging the instance to its maximum
//! age rather than deleting it outright.

pub use client::{ApiClient, ClientError, ConnectError, NotificationHandler};
pub use server::ApiServer;
pub use session::{SessionId, SessionStats};

pub mod client;
mod handlers;
pub mod lsa;
pub mod lsdb;
pub mod metrics;
pub mod proto;
pub mod readiness;
pub mod registry;
pub mod seqno;
pub mod server;
mod session;
pub mod topology;
