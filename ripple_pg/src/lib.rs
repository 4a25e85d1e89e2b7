//! # Ripple PostgreSQL transport
//!
//! PostgreSQL implementation of the `ripple_core` [`Listener`] on top of
//! LISTEN/NOTIFY, plus the audit trigger that turns row changes into
//! notifications and a small pool helper for the supporting SQL.
//!
//! [`Listener`]: ripple_core::Listener

#![deny(missing_docs)]

mod listener;
mod pool;
mod trigger;

pub use listener::PgChannelListener;
pub use pool::connect_pool;
pub use trigger::{DEFAULT_EVENTS_CHANNEL, install_audit_trigger};

pub use sqlx::postgres::PgPool;
