use std::sync::Arc;
use std::time::Duration;

use crate::connection::{Connection, ConnectionFactory, SessionSettings};

/// Construction-time configuration for a [`super::PriorityPool`].
///
/// Built with the standard consuming-builder pattern; every setter takes
/// `self` by value and returns `Self` so calls chain into a single
/// expression, matching the option builders elsewhere in this crate's
/// teacher lineage.
pub struct PoolOptions<C: Connection> {
    pub(crate) minconn: usize,
    pub(crate) maxconn: usize,
    pub(crate) stale_timeout: Option<Duration>,
    pub(crate) get_timeout: Option<Duration>,
    pub(crate) session_defaults: SessionSettings,
    pub(crate) connection_factory: Arc<ConnectionFactory<C>>,
}

impl<C: Connection> Clone for PoolOptions<C> {
    fn clone(&self) -> Self {
        Self {
            minconn: self.minconn,
            maxconn: self.maxconn,
            stale_timeout: self.stale_timeout,
            get_timeout: self.get_timeout,
            session_defaults: self.session_defaults.clone(),
            connection_factory: Arc::clone(&self.connection_factory),
        }
    }
}

impl<C: Connection> PoolOptions<C> {
    /// Start a builder. `minconn` and `maxconn` default to `1`; callers
    /// should set both explicitly. `connection_factory` is required and has
    /// no default — use [`PoolOptions::connection_factory`].
    pub fn new(connection_factory: ConnectionFactory<C>) -> Self {
        Self {
            minconn: 1,
            maxconn: 1,
            stale_timeout: None,
            get_timeout: None,
            session_defaults: SessionSettings::default(),
            connection_factory: Arc::new(connection_factory),
        }
    }

    /// The pool will try to keep at least this many connections alive,
    /// opportunistically replacing connections lost to staleness or errors.
    pub fn minconn(mut self, minconn: usize) -> Self {
        self.minconn = minconn;
        self
    }

    /// The pool will never hold more than this many connections (idle +
    /// checked out + pending creation) at once.
    pub fn maxconn(mut self, maxconn: usize) -> Self {
        self.maxconn = maxconn;
        self
    }

    /// Connections idle for longer than this are recycled on their next
    /// checkout instead of being handed to the caller. `None` disables
    /// staleness-based recycling.
    pub fn stale_timeout(mut self, stale_timeout: Duration) -> Self {
        self.stale_timeout = Some(stale_timeout);
        self
    }

    /// Default timeout for `get_connection` calls that don't specify one
    /// explicitly. `None` means block indefinitely.
    pub fn get_timeout(mut self, get_timeout: Duration) -> Self {
        self.get_timeout = Some(get_timeout);
        self
    }

    /// Session parameters applied to every connection handed out, and
    /// restored on return.
    pub fn session_defaults(mut self, session_defaults: SessionSettings) -> Self {
        self.session_defaults = session_defaults;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.maxconn == 0 {
            return Err("maxconn must be at least 1".into());
        }
        if self.minconn > self.maxconn {
            return Err(format!(
                "minconn ({}) must not exceed maxconn ({})",
                self.minconn, self.maxconn
            ));
        }
        Ok(())
    }
}
