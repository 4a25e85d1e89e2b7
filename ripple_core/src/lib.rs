//! # Ripple core
//!
//! Transport-agnostic primitives for multiplexing a single LISTEN/NOTIFY
//! style connection into many independent, concurrently-consumed topic
//! subscriptions.
//!
//! The crate is built around two pieces:
//!
//! - [`Listener`]: owns exactly one connection to the notification transport
//!   and serializes every protocol operation against it.
//! - [`Notifier`]: runs on top of a [`Listener`], tracks which topics have
//!   active subscribers, and fans each arriving notification out to every
//!   [`Subscription`] registered for its topic, in arrival order.
//!
//! The default transport lives in the `ripple_pg` crate, but callers may
//! implement [`Listener`] for any backend they'd like.

#![deny(missing_docs)]

mod listener;
mod notifier;

pub use listener::{BoxedTransportError, Listener, ListenerError, Notification};
pub use notifier::{Notifier, NotifierError, Subscription};

pub mod prelude {
    //! The prelude module for the `ripple_core` crate.
    pub use super::{Listener, ListenerError, Notification, Notifier, NotifierError, Subscription};
}
