//! The connection-owning side of the notification pipeline.
//!
//! A [`Listener`] connects to the transport and allows callers to listen on a
//! particular topic. [`Listener::wait_for_notification`] blocks until a
//! notification arrives, the receive slice elapses, or the supplied shutdown
//! signal fires. The default implementation (in `ripple_pg`) is tightly
//! coupled to PostgreSQL, but callers may implement their own listeners for
//! any backend they'd like.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

/// A single notification delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The topic the notification was published to.
    pub channel: String,
    /// The raw payload bytes, exactly as published.
    pub payload: Vec<u8>,
}

/// Boxed driver error, keeping this crate free of any particular transport
/// dependency.
pub type BoxedTransportError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by [`Listener`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// `connect` was called while a connection is already held.
    #[error("connection already established")]
    AlreadyConnected,
    /// An operation that needs a live connection was called before `connect`
    /// (or after `close`).
    #[error("listener is not connected")]
    NotConnected,
    /// A transport-level failure: connect, ping, or the blocking receive.
    #[error("connection error: {0}")]
    Connection(#[source] BoxedTransportError),
    /// A listen/unlisten command was rejected by the server.
    #[error("command rejected: {0}")]
    Protocol(#[source] BoxedTransportError),
    /// The caller's shutdown signal fired during a blocking receive.
    #[error("wait for notification cancelled")]
    Cancelled,
}

impl ListenerError {
    /// Wraps a driver error as a transport-level connection failure.
    pub fn connection<E: Into<BoxedTransportError>>(err: E) -> Self {
        ListenerError::Connection(err.into())
    }

    /// Wraps a driver error as a rejected command.
    pub fn protocol<E: Into<BoxedTransportError>>(err: E) -> Self {
        ListenerError::Protocol(err.into())
    }
}

/// Serializes all protocol operations against one managed connection.
///
/// The underlying connection can only run one protocol command at a time, so
/// implementations must hold a single exclusion lock for the full duration of
/// every operation, including the blocking receive. A `listen`/`unlisten`
/// issued while a receive is in flight waits until that receive completes,
/// fails, or its receive slice elapses.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Establishes the managed connection.
    ///
    /// Fails with [`ListenerError::AlreadyConnected`] if a connection is
    /// already held.
    async fn connect(&self) -> Result<(), ListenerError>;

    /// Releases the managed connection. A no-op when not connected.
    ///
    /// The handle is cleared even if the underlying close reports an error,
    /// so the listener can be reused with a subsequent `connect`.
    async fn close(&self) -> Result<(), ListenerError>;

    /// Issues a listen command for the supplied topic.
    async fn listen(&self, topic: &str) -> Result<(), ListenerError>;

    /// Issues an unlisten command for the supplied topic.
    async fn unlisten(&self, topic: &str) -> Result<(), ListenerError>;

    /// Issues a liveness probe on the managed connection.
    async fn ping(&self) -> Result<(), ListenerError>;

    /// Blocks until a notification arrives and returns it.
    ///
    /// Returns `Ok(None)` when `timeout` elapses without a notification; the
    /// lock is released between calls, which is what lets queued
    /// `listen`/`unlisten` commands run while a dispatch loop polls in a
    /// receive-wait cycle. Fails with [`ListenerError::Cancelled`] once
    /// `shutdown` observes `true` (implementations check the current value
    /// before blocking).
    ///
    /// The transport buffers notifications on the connection, so as long as
    /// `listen` has been called, repeatedly calling this yields every
    /// notification.
    async fn wait_for_notification(
        &self,
        timeout: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Notification>, ListenerError>;
}
