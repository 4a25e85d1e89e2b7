//! Daemon that forwards audit events from PostgreSQL to webhook endpoints.
//!
//! On startup the audit trigger is (re)installed, one dedicated notification
//! connection is opened and a dispatch loop multiplexes it into the channel
//! subscription the consumer task reads from. Each notification is parsed
//! into a webhook event and posted to the endpoint configured for its type.

mod config;
mod parser;
mod webhook;

use std::future::Future;

use anyhow::Context;
use clap::Parser;
use log::{debug, error, info, warn};
use ripple_core::{Listener, Notifier, Subscription};
use ripple_pg::{PgChannelListener, connect_pool, install_audit_trigger};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

use crate::config::Config;
use crate::webhook::WebhookClient;

fn init_logging(config: &Config) {
    let default_level = if config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RIPPLE_LOG_LEVEL", default_level),
    )
    .init();
}

async fn consume_events(
    mut subscription: Subscription<PgChannelListener>,
    config: Config,
    client: WebhookClient,
) {
    while let Some(payload) = subscription.recv().await {
        debug!("got notification: {}", String::from_utf8_lossy(&payload));

        let event = match parser::parse_event(&payload) {
            Ok(event) => event,
            Err(err) => {
                warn!("skipping notification: {err}");
                continue;
            }
        };

        let Some(endpoint) = config.endpoint_for(&event.event_type) else {
            debug!(
                "'{}' event was triggered, but no webhook url was provided",
                event.event_type
            );
            continue;
        };

        if let Err(err) = client.deliver(endpoint, &event).await {
            error!(
                "failed to deliver '{}' event '{}': {err}",
                event.event_type, event.id
            );
        }
    }
    subscription.unlisten().await;
    info!("done listening for notifications");
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

/// Runs until either the shutdown signal fires (clean stop: cancel the
/// dispatch loop and wait it out) or the dispatch loop dies on its own, in
/// which case its error is surfaced so the process exits instead of idling
/// with a dead pipeline.
async fn supervise_dispatch<F>(
    mut dispatch: tokio::task::JoinHandle<Result<(), ripple_core::NotifierError>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_signal: F,
) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let outcome = tokio::select! {
        result = shutdown_signal => {
            result?;
            info!("received shutdown signal, shutting down");
            let _ = shutdown_tx.send(true);
            dispatch.await.context("dispatch task panicked")?
        }
        joined = &mut dispatch => joined.context("dispatch task panicked")?,
    };
    outcome.context("notification dispatch terminated")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_logging(&config);

    if !config.has_endpoints() {
        anyhow::bail!(
            "at least one of --update-entity-url, --new-submission-url, --review-submission-url is required"
        );
    }

    let pool = connect_pool(&config.db_uri)
        .await
        .context("could not connect to database")?;
    install_audit_trigger(&pool, &config.audit_table, &config.channel)
        .await
        .context("could not install the audit trigger")?;

    let listener = PgChannelListener::new(&config.db_uri);
    listener
        .connect()
        .await
        .context("could not open the notification connection")?;

    let notifier = Notifier::new(listener);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch = tokio::spawn({
        let notifier = notifier.clone();
        async move { notifier.run(shutdown_rx).await }
    });

    let mut subscription = notifier
        .listen(&config.channel)
        .await
        .context("could not subscribe to the events channel")?;
    if !subscription.established().await {
        anyhow::bail!("subscription to '{}' was never established", config.channel);
    }
    info!("listening on channel '{}'", config.channel);

    let client = WebhookClient::new(config.api_key.clone())
        .context("could not build the webhook client")?;
    let consumer = tokio::spawn(consume_events(subscription, config.clone(), client));

    let outcome = supervise_dispatch(dispatch, shutdown_tx, wait_for_shutdown()).await;

    // Whichever way the dispatch loop ended, the registry was drained, so
    // the consumer sees end-of-stream and finishes.
    consumer.await.context("consumer task panicked")?;
    notifier
        .listener()
        .close()
        .await
        .context("could not close the notification connection")?;

    outcome?;
    info!("shut down cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::{ListenerError, NotifierError};

    #[tokio::test]
    async fn exits_when_the_dispatch_loop_dies() {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let dispatch = tokio::spawn(async {
            Err(NotifierError::Listener(ListenerError::connection(
                "connection reset",
            )))
        });

        let outcome = supervise_dispatch(
            dispatch,
            shutdown_tx,
            std::future::pending::<anyhow::Result<()>>(),
        )
        .await;

        let err = outcome.expect_err("a dead dispatch loop must surface as an error");
        assert!(err.to_string().contains("notification dispatch terminated"));
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_dispatch_loop_cleanly() {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let dispatch = tokio::spawn(async move {
            shutdown_rx
                .wait_for(|stop| *stop)
                .await
                .map(|_| ())
                .map_err(|_| NotifierError::ShutDown)
        });

        supervise_dispatch(dispatch, shutdown_tx, async { Ok(()) })
            .await
            .expect("clean shutdown failed");
    }
}
