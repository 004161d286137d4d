//! Doorman Background Worker
//!
//! Runs the scheduled jobs of the subscription engine:
//! - Subscription state sweep: active to grace to expired (hourly)
//! - Renewal reminders for one-time plans (daily at 10:00 UTC)
//! - Deferred operation queue drain (every 5 minutes)
//! - Payment reconciliation against the provider ledger (every 6 hours)
//! - Owner digest with funnel and revenue counters (daily at 9:00 UTC)
//! - Ledger invariant checks (daily at 3:00 UTC)
//!
//! Each job is an independent tokio timer task; overlap within a job is
//! prevented by running its work inline on the ticker, and every job is safe
//! to re-run against the same state.

use std::sync::Arc;
use std::time::Duration;

use time::{OffsetDateTime, Time};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use doorman_core::{Engine, ReconcileSummary, SweepSummary, TelegramClient};
use doorman_shared::Config;
use doorman_store::{InvariantCheckSummary, InvariantChecker, PgLedgerStore, ViolationSeverity};

/// Log results of a state sweep
fn log_sweep_results(summary: &SweepSummary) {
    info!(
        graced = summary.graced,
        expired = summary.expired,
        banned = summary.banned,
        whitelist_spared = summary.whitelist_spared,
        errors = summary.errors,
        "State sweep complete"
    );
}

/// Log results of a reconciliation pass
fn log_reconcile_results(summary: &ReconcileSummary) {
    info!(
        scanned = summary.scanned,
        applied = summary.applied,
        duplicates = summary.duplicates,
        skipped = summary.skipped,
        errors = summary.errors,
        from = %summary.from,
        to = %summary.to,
        cursor_advanced = summary.cursor_advanced,
        "Reconciliation complete"
    );
}

/// Log results of the invariant checks
fn log_invariant_results(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Invariant checks complete"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                "{}",
                violation.description
            ),
        }
    }
}

/// Sleep until the next occurrence of `hour:minute` UTC.
async fn sleep_until_utc(hour: u8, minute: u8) {
    let now = OffsetDateTime::now_utc();
    let at = Time::from_hms(hour, minute, 0).unwrap_or(Time::MIDNIGHT);
    let mut target = now.replace_time(at);
    if target <= now {
        target += time::Duration::days(1);
    }
    let secs = (target - now).whole_seconds().max(1) as u64;
    sleep(Duration::from_secs(secs)).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Doorman Worker");

    let config = Arc::new(Config::from_env()?);

    let pool = doorman_store::connect_pool(&config.database_url).await?;
    doorman_store::run_migrations(&pool).await?;

    let store = Arc::new(PgLedgerStore::new(pool.clone()));
    let client = Arc::new(TelegramClient::new(
        config.bot_token.clone(),
        config.api_timeout(),
    )?);
    let engine = Arc::new(Engine::new(config.clone(), store, client));
    let checker = Arc::new(InvariantChecker::new(pool));

    // Job 1: Subscription state sweep (hourly)
    // Moves overdue active rows into grace and closes out grace rows whose
    // deadline has passed, banning the seats that are no longer paid for.
    // The immediate first tick doubles as catch-up after downtime.
    let sweep_engine = engine.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            info!("Running subscription state sweep");
            match sweep_engine
                .lifecycle
                .run_state_sweep(OffsetDateTime::now_utc())
                .await
            {
                Ok(summary) => log_sweep_results(&summary),
                Err(e) => error!(error = %e, "State sweep failed"),
            }
        }
    });
    info!("Scheduled: Subscription state sweep (hourly)");

    // Job 2: Renewal reminders (daily at 10:00 UTC)
    let reminder_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            sleep_until_utc(10, 0).await;
            info!("Running renewal reminder pass");
            match reminder_engine
                .lifecycle
                .run_reminder_pass(OffsetDateTime::now_utc())
                .await
            {
                Ok(summary) => info!(
                    sent = summary.sent,
                    errors = summary.errors,
                    "Reminder pass complete"
                ),
                Err(e) => error!(error = %e, "Reminder pass failed"),
            }
        }
    });
    info!("Scheduled: Renewal reminders (daily at 10:00 UTC)");

    // Job 3: Drain the deferred operation queue (every 5 minutes)
    // Replays bans and notifications that were parked during an outage.
    let drain_engine = engine.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(300));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match drain_engine.drain_operation_queue().await {
                Some(summary) if summary.processed > 0 => info!(
                    processed = summary.processed,
                    succeeded = summary.succeeded,
                    requeued = summary.requeued,
                    abandoned = summary.abandoned,
                    "Operation queue drained"
                ),
                Some(_) => debug!("Operation queue empty"),
                None => warn!("Queue drain already in flight, skipping"),
            }
        }
    });
    info!("Scheduled: Operation queue drain (every 5 minutes)");

    // Job 4: Reconcile against the provider transaction ledger (every 6 hours)
    // Runs once at startup to recover anything missed while offline.
    let reconcile_engine = engine.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(6 * 3600));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            info!("Running payment reconciliation");
            match reconcile_engine.reconcile.run(OffsetDateTime::now_utc()).await {
                Ok(summary) => log_reconcile_results(&summary),
                Err(e) => error!(error = %e, "Reconciliation failed"),
            }
        }
    });
    info!("Scheduled: Payment reconciliation (every 6 hours)");

    // Job 5: Owner digest (daily at 9:00 UTC)
    let digest_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            sleep_until_utc(9, 0).await;
            info!("Sending daily owner digest");
            match digest_engine
                .digest
                .send_daily_digest(OffsetDateTime::now_utc())
                .await
            {
                Ok(summary) => info!(
                    owners_notified = summary.owners_notified,
                    errors = summary.errors,
                    "Daily digest sent"
                ),
                Err(e) => error!(error = %e, "Daily digest failed"),
            }
        }
    });
    info!("Scheduled: Owner digest (daily at 9:00 UTC)");

    // Job 6: Ledger invariant checks (daily at 3:00 UTC)
    let invariant_checker = checker.clone();
    tokio::spawn(async move {
        loop {
            sleep_until_utc(3, 0).await;
            info!("Running ledger invariant checks");
            match invariant_checker.run_all_checks().await {
                Ok(summary) => log_invariant_results(&summary),
                Err(e) => error!(error = %e, "Invariant checks failed"),
            }
        }
    });
    info!("Scheduled: Ledger invariant checks (daily at 3:00 UTC)");

    info!("Doorman Worker started successfully with {} scheduled jobs", 6);

    // Keep the main task running
    // The jobs run in background tasks
    loop {
        sleep(Duration::from_secs(3600)).await;
    }
}
