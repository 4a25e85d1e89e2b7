//! PostgreSQL LISTEN/NOTIFY implementation of the [`Listener`] trait.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use ripple_core::{Listener, ListenerError, Notification};
use sqlx::postgres::PgListener;
use tokio::sync::{Mutex, watch};

/// A [`Listener`] over one dedicated PostgreSQL connection.
///
/// The connection is established lazily by [`Listener::connect`] from the
/// database URL and owned outright rather than borrowed from a pool, so
/// [`Listener::close`] terminates it instead of handing it back for reuse.
/// All protocol operations are serialized behind a single lock; a queued
/// `LISTEN`/`UNLISTEN` waits for any in-flight receive to finish its slice.
pub struct PgChannelListener {
    url: String,
    conn: Mutex<Option<PgListener>>,
}

impl PgChannelListener {
    /// Creates an unconnected listener for the given database URL.
    pub fn new(url: impl Into<String>) -> Self {
        PgChannelListener {
            url: url.into(),
            conn: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Listener for PgChannelListener {
    async fn connect(&self) -> Result<(), ListenerError> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            return Err(ListenerError::AlreadyConnected);
        }
        let listener = PgListener::connect(&self.url)
            .await
            .map_err(ListenerError::connection)?;
        *conn = Some(listener);
        info!("notification connection established");
        Ok(())
    }

    async fn close(&self) -> Result<(), ListenerError> {
        let mut conn = self.conn.lock().await;
        if conn.take().is_some() {
            // Dropping the listener closes its dedicated connection.
            info!("notification connection closed");
        }
        Ok(())
    }

    async fn listen(&self, topic: &str) -> Result<(), ListenerError> {
        let mut conn = self.conn.lock().await;
        let listener = conn.as_mut().ok_or(ListenerError::NotConnected)?;
        listener
            .listen(topic)
            .await
            .map_err(ListenerError::protocol)?;
        debug!("now listening on channel '{topic}'");
        Ok(())
    }

    async fn unlisten(&self, topic: &str) -> Result<(), ListenerError> {
        let mut conn = self.conn.lock().await;
        let listener = conn.as_mut().ok_or(ListenerError::NotConnected)?;
        listener
            .unlisten(topic)
            .await
            .map_err(ListenerError::protocol)?;
        debug!("stopped listening on channel '{topic}'");
        Ok(())
    }

    async fn ping(&self) -> Result<(), ListenerError> {
        let mut conn = self.conn.lock().await;
        let listener = conn.as_mut().ok_or(ListenerError::NotConnected)?;
        sqlx::query("SELECT 1")
            .execute(&mut *listener)
            .await
            .map_err(ListenerError::connection)?;
        Ok(())
    }

    async fn wait_for_notification(
        &self,
        timeout: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Notification>, ListenerError> {
        if *shutdown.borrow() {
            return Err(ListenerError::Cancelled);
        }
        let mut conn = self.conn.lock().await;
        let listener = conn.as_mut().ok_or(ListenerError::NotConnected)?;
        tokio::select! {
            received = tokio::time::timeout(timeout, listener.recv()) => match received {
                Ok(Ok(notification)) => Ok(Some(Notification {
                    channel: notification.channel().to_string(),
                    payload: notification.payload().as_bytes().to_vec(),
                })),
                Ok(Err(err)) => Err(ListenerError::connection(err)),
                Err(_elapsed) => Ok(None),
            },
            changed = shutdown.changed() => match changed {
                Ok(()) if !*shutdown.borrow() => Ok(None),
                _ => Err(ListenerError::Cancelled),
            },
        }
    }
}
