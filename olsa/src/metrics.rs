//! Collection of runtime metrics of the api server. The main item of interest is the
//! [`Metrics`] trait. Users can provide their own implementation, or use [`NoMetrics`] to
//! disable gathering metrics.

/// The collection of all metrics exported by an [`ApiServer`](crate::server::ApiServer). Every
/// method has a default no-op implementation, implementors pick the ones they care about.
pub trait Metrics {
    /// A client completed the connection bootstrap and a session was created for it.
    #[inline]
    fn session_connected(&self) {}

    /// A session was torn down, either because the client disconnected or because its connection
    /// failed.
    #[inline]
    fn session_disconnected(&self) {}

    /// A request was read from a session's synchronous channel and dispatched.
    #[inline]
    fn request_handled(&self) {}

    /// A notification was queued on a session's asynchronous channel.
    #[inline]
    fn notification_sent(&self) {}

    /// A session registered ownership of an opaque type.
    #[inline]
    fn opaque_type_registered(&self) {}

    /// A session's ownership of an opaque type was released, either explicitly or through
    /// teardown.
    #[inline]
    fn opaque_type_released(&self) {}

    /// A new advertisement instance was installed and flooded.
    #[inline]
    fn lsa_originated(&self) {}

    /// An existing advertisement instance was refreshed, picking up a staged update if one was
    /// pending.
    #[inline]
    fn lsa_refreshed(&self) {}

    /// An advertisement was scheduled for graceful withdrawal.
    #[inline]
    fn lsa_flush_scheduled(&self) {}
}

/// A [`Metrics`] implementation which doesn't record anything.
#[derive(Debug, Clone, Copy)]
pub struct NoMetrics;

impl Metrics for NoMetrics {}
