//! Fan-out of transport notifications to per-topic subscriptions.
//!
//! The [`Notifier`] owns a [`Listener`] and runs one long-lived dispatch
//! loop. Consumers register interest in a topic with [`Notifier::listen`] and
//! get back a [`Subscription`]: a one-shot "active on the server" signal plus
//! an ordered stream of payloads. The notifier issues the underlying listen
//! command only when a topic's subscriber count goes 0→1 and the unlisten
//! command only on the 1→0 transition.
//!
//! The registry is guarded by its own lock, distinct from the listener's
//! connection lock: registering or retiring a subscription only contends with
//! the dispatch loop for the connection when a listen/unlisten command
//! actually has to be issued.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use log::{debug, error, info};
use tokio::sync::{Mutex, mpsc, watch};

use crate::listener::{Listener, ListenerError, Notification};

/// How long one blocking receive holds the listener's connection lock before
/// the dispatch loop releases it, giving queued listen/unlisten commands a
/// chance to run.
const RECEIVE_SLICE: Duration = Duration::from_millis(250);

type SubscriptionId = u64;

/// Errors returned by [`Notifier`] operations.
#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    /// The underlying listener failed.
    #[error(transparent)]
    Listener(#[from] ListenerError),
    /// [`Notifier::run`] was invoked a second time.
    #[error("dispatch loop already started")]
    AlreadyRunning,
    /// The dispatch loop has terminated; no new subscriptions are accepted.
    #[error("notifier is shut down")]
    ShutDown,
}

/// The notifier's side of a subscription: where payloads are pushed and the
/// established signal is fired. Dropping the handle closes both.
struct SubscriberHandle {
    established: watch::Sender<bool>,
    inbox: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct Registry {
    next_id: SubscriptionId,
    /// Topic → subscription ids, in registration order. A key exists iff its
    /// id list is non-empty, which is also exactly when a listen command has
    /// been issued for the topic.
    topics: HashMap<String, Vec<SubscriptionId>>,
    /// Side table resolving ids to live subscriber handles.
    subscribers: HashMap<SubscriptionId, SubscriberHandle>,
    shut_down: bool,
}

impl Registry {
    /// Removes a subscription. Returns `None` when the id is not registered,
    /// otherwise whether it was the topic's last subscriber.
    fn remove(&mut self, id: SubscriptionId, topic: &str) -> Option<bool> {
        self.subscribers.remove(&id)?;
        let last = match self.topics.get_mut(topic) {
            Some(ids) => {
                ids.retain(|other| *other != id);
                ids.is_empty()
            }
            None => false,
        };
        if last {
            self.topics.remove(topic);
        }
        Some(last)
    }
}

struct Inner<L> {
    listener: L,
    registry: Mutex<Registry>,
    running: AtomicBool,
}

impl<L: Listener> Inner<L> {
    /// Removes a subscription from the registry, issuing the unlisten command
    /// when it was the topic's last subscriber. Idempotent; a no-op once the
    /// notifier has shut down.
    async fn retire(&self, id: SubscriptionId, topic: &str) {
        let mut registry = self.registry.lock().await;
        if registry.shut_down {
            return;
        }
        let Some(last) = registry.remove(id, topic) else {
            return;
        };
        if last {
            // Best effort: the subscription is gone either way, so a failed
            // unlisten is logged rather than surfaced.
            if let Err(err) = self.listener.unlisten(topic).await {
                error!("failed to unlisten topic '{topic}': {err}");
            }
        }
        debug!("subscription {id} retired from topic '{topic}'");
    }
}

/// Dispatch engine that multiplexes one [`Listener`] connection into many
/// per-topic [`Subscription`]s.
///
/// Clones share the same registry and listener; the usual shape is one clone
/// driving [`Notifier::run`] on a dedicated task while others call
/// [`Notifier::listen`].
pub struct Notifier<L: Listener> {
    inner: Arc<Inner<L>>,
}

impl<L: Listener> Clone for Notifier<L> {
    fn clone(&self) -> Self {
        Notifier {
            inner: self.inner.clone(),
        }
    }
}

impl<L: Listener> Notifier<L> {
    /// Creates a notifier on top of a connected listener.
    pub fn new(listener: L) -> Self {
        Notifier {
            inner: Arc::new(Inner {
                listener,
                registry: Mutex::new(Registry::default()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// The listener this notifier dispatches from.
    pub fn listener(&self) -> &L {
        &self.inner.listener
    }

    /// Runs the dispatch loop until `shutdown` flips to `true` or the
    /// listener fails.
    ///
    /// Must be invoked exactly once, typically on a dedicated task. Returns
    /// `Ok(())` on a clean, shutdown-driven exit and the listener error on a
    /// transport failure; there is no reconnect here — the owning process
    /// decides whether to rebuild the listener/notifier pair. Either way,
    /// every remaining subscription is released on exit so consumers blocked
    /// on them observe end-of-stream instead of hanging.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), NotifierError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(NotifierError::AlreadyRunning);
        }
        info!("notification dispatch loop started");

        let result = loop {
            match self
                .inner
                .listener
                .wait_for_notification(RECEIVE_SLICE, &mut shutdown)
                .await
            {
                Ok(Some(notification)) => self.dispatch(notification).await,
                // Receive slice elapsed; loop around, releasing the
                // connection lock to any queued listen/unlisten.
                Ok(None) => {}
                Err(ListenerError::Cancelled) => {
                    info!("notification dispatch loop cancelled");
                    break Ok(());
                }
                Err(err) => {
                    error!("notification dispatch loop terminating: {err}");
                    break Err(NotifierError::Listener(err));
                }
            }
        };

        self.drain_registry().await;
        result
    }

    /// Registers a subscription for `topic`.
    ///
    /// When this is the topic's first subscriber the listen command is issued
    /// synchronously before returning, and the subscription's established
    /// signal fires only after it succeeds; if the topic already had
    /// subscribers the signal fires immediately. On listener failure the
    /// registration is rolled back and the error returned.
    pub async fn listen(&self, topic: &str) -> Result<Subscription<L>, NotifierError> {
        let mut registry = self.inner.registry.lock().await;
        if registry.shut_down {
            return Err(NotifierError::ShutDown);
        }

        let id = registry.next_id;
        registry.next_id += 1;
        let (established_tx, established_rx) = watch::channel(false);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let first = !registry.topics.contains_key(topic);
        registry.topics.entry(topic.to_string()).or_default().push(id);
        registry.subscribers.insert(
            id,
            SubscriberHandle {
                established: established_tx,
                inbox: inbox_tx,
            },
        );

        if first {
            // The registry lock is held across the listen command on
            // purpose: a concurrent subscriber for the same topic must not
            // observe the topic as active before the command succeeded.
            if let Err(err) = self.inner.listener.listen(topic).await {
                registry.remove(id, topic);
                return Err(err.into());
            }
        }

        if let Some(handle) = registry.subscribers.get(&id) {
            let _ = handle.established.send(true);
        }
        debug!("subscription {id} registered for topic '{topic}'");

        Ok(Subscription {
            id,
            topic: topic.to_string(),
            established: established_rx,
            inbox: inbox_rx,
            notifier: self.inner.clone(),
            retired: false,
        })
    }

    /// Pushes a notification's payload onto the inbox of every subscription
    /// currently registered for its topic, in registration order.
    async fn dispatch(&self, notification: Notification) {
        let mut registry = self.inner.registry.lock().await;
        let Some(ids) = registry.topics.get(&notification.channel) else {
            debug!("no subscribers for topic '{}'", notification.channel);
            return;
        };
        let mut dropped = Vec::new();
        for id in ids {
            if let Some(handle) = registry.subscribers.get(id) {
                // Inboxes are unbounded, so a stalled consumer costs memory
                // rather than delaying delivery to other subscriptions. A
                // send error means the consumer dropped its half without
                // retiring.
                if handle.inbox.send(notification.payload.clone()).is_err() {
                    dropped.push(*id);
                }
            }
        }
        // Subscriptions dropped without an explicit unlisten are retired
        // here, so the registry and the server-side listen set shrink.
        for id in dropped {
            if let Some(last) = registry.remove(id, &notification.channel) {
                debug!("subscription {id} dropped its receiver; retiring");
                if last {
                    if let Err(err) = self.inner.listener.unlisten(&notification.channel).await {
                        error!("failed to unlisten topic '{}': {err}", notification.channel);
                    }
                }
            }
        }
    }

    /// Marks the registry shut down and releases every remaining
    /// subscription. Dropping the handles closes the inboxes and the
    /// never-fired established signals.
    async fn drain_registry(&self) {
        let mut registry = self.inner.registry.lock().await;
        registry.shut_down = true;
        let remaining = registry.subscribers.len();
        registry.topics.clear();
        registry.subscribers.clear();
        if remaining > 0 {
            info!("released {remaining} subscription(s) on shutdown");
        }
    }
}

/// A consumer's registered interest in a topic.
///
/// Yields the topic's payloads in arrival order, starting from the moment the
/// registration took effect: nothing published earlier is replayed, and
/// nothing is withheld that arrived after. Delivery is at-most-once per live
/// subscription.
pub struct Subscription<L: Listener> {
    id: SubscriptionId,
    topic: String,
    established: watch::Receiver<bool>,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    notifier: Arc<Inner<L>>,
    retired: bool,
}

impl<L: Listener> std::fmt::Debug for Subscription<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("retired", &self.retired)
            .finish_non_exhaustive()
    }
}

impl<L: Listener> Subscription<L> {
    /// The topic this subscription is registered for.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Resolves `true` once the server-side listen for this subscription's
    /// topic has taken effect. Fires exactly once; if the notifier shuts down
    /// before the subscription became active the signal never fires and this
    /// resolves `false` instead of hanging.
    pub async fn established(&mut self) -> bool {
        self.established.wait_for(|active| *active).await.is_ok()
    }

    /// The next payload for this topic, in arrival order.
    ///
    /// Returns `None` once the subscription has been retired or the dispatch
    /// loop has exited. The sequence is not restartable.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbox.recv().await
    }

    /// Retires the subscription: no further payloads are delivered, and if it
    /// was the topic's last subscriber the unlisten command is issued.
    ///
    /// Idempotent, and safe to call after the notifier has shut down.
    pub async fn unlisten(&mut self) {
        if self.retired {
            return;
        }
        self.retired = true;
        self.inbox.close();
        self.notifier.retire(self.id, &self.topic).await;
    }
}

impl<L: Listener> Stream for Subscription<L> {
    type Item = Vec<u8>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inbox.poll_recv(cx)
    }
}
