//! Connection pool setup for the supporting SQL (trigger installation and
//! anything else that is not the notification connection itself).

use std::time::Duration;

use log::{error, info};
use sqlx::Connection;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Connects a pool to the given database URL and verifies it with a ping.
pub async fn connect_pool(url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(url)
        .await
        .inspect_err(|err| error!("failed to create database pool: {err}"))?;

    let mut conn = pool.acquire().await?;
    conn.ping()
        .await
        .inspect_err(|err| error!("database ping failed: {err}"))?;

    info!("database pool ready");
    Ok(pool)
}
