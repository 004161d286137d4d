//! Doorman Store
//!
//! Postgres persistence for the subscription ledger.
//!
//! ## Features
//!
//! - **Ledger**: [`PgLedgerStore`], the production implementation of the
//!   core [`doorman_core::store::LedgerStore`] trait
//! - **Migrations**: embedded schema migrations applied at startup
//! - **Invariants**: runnable consistency checks over the live schema

pub mod invariants;
pub mod pg;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use pg::PgLedgerStore;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{info, warn};

use doorman_core::error::{CoreError, CoreResult};

/// Connect to Postgres, retrying briefly so a fresh deployment does not lose
/// the race against its database container.
pub async fn connect_pool(database_url: &str) -> CoreResult<PgPool> {
    // 1s, 2s, 4s, 8s between the five attempts.
    let strategy = ExponentialBackoff::from_millis(2).factor(500).take(4);

    let pool = Retry::spawn(strategy, || async {
        PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| {
                warn!(error = %e, "Database connection failed, retrying");
                e
            })
    })
    .await
    .map_err(|e| CoreError::Storage(format!("failed to connect to database: {e}")))?;

    info!("Database pool created");
    Ok(pool)
}

/// Apply embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> CoreResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| CoreError::Storage(format!("migration failed: {e}")))?;
    info!("Database migrations applied");
    Ok(())
}
