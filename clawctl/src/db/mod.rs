//! Persistence layer: two SQLite databases and their repositories.
//!
//! The orders database holds billing state (orders, order events, webhook
//! dedup, checkout idempotency); the deployments database holds the
//! provisioning lifecycle (deployments, deployment events). Both run with WAL
//! journaling and foreign keys on, and all state transitions are predicated
//! updates: the source state appears in every WHERE clause, and an update
//! that matches no rows re-reads and returns the current row instead of
//! erroring. Callers treat "already done" and "did it now" identically.

pub mod errors;
pub mod handlers;
pub mod hooks;
pub mod models;

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::path::Path;
use tracing::info;

/// Get the orders database migrator
pub fn orders_migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations/orders")
}

/// Get the deployments database migrator
pub fn deployments_migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations/deployments")
}

async fn connect(path: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Open both databases, run migrations, and return the pools as
/// `(orders, deployments)`.
pub async fn setup_databases(orders_path: &Path, deployments_path: &Path) -> anyhow::Result<(SqlitePool, SqlitePool)> {
    let orders = connect(orders_path).await?;
    orders_migrator().run(&orders).await?;
    info!(path = %orders_path.display(), "Orders database ready");

    let deployments = connect(deployments_path).await?;
    deployments_migrator().run(&deployments).await?;
    info!(path = %deployments_path.display(), "Deployments database ready");

    Ok((orders, deployments))
}
