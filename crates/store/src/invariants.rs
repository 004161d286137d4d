//! Runnable consistency checks over the live ledger schema.
//!
//! Every rule the engine relies on but cannot express as a constraint is a
//! named read-only query here. The worker runs the full set daily; a check
//! can also be run by name after a migration or an incident to confirm the
//! database is in a state the sweep and the reconciler can reason about.
//! Checks never write, and a violation carries enough context to debug the
//! affected rows without re-querying by hand.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use doorman_core::error::{CoreError, CoreResult};

/// How urgent a violation is. `Critical` means access decisions are wrong
/// right now; `Low` is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl ViolationSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationSeverity::Critical => "CRITICAL",
            ViolationSeverity::High => "HIGH",
            ViolationSeverity::Medium => "MEDIUM",
            ViolationSeverity::Low => "LOW",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One broken rule, scoped to the rows that break it.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    /// Name of the check that found it, from [`InvariantChecker::NAMES`].
    pub invariant: &'static str,
    /// Telegram users affected; empty when the violation is global state.
    pub user_ids: Vec<i64>,
    pub description: String,
    /// Offending row identifiers and values, for debugging.
    pub details: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Outcome of one full run. `checks_failed` counts checks, not rows: a
/// single check reporting ten users still fails once.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleLiveRowsRow {
    user_id: i64,
    row_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct GraceNoDeadlineRow {
    sub_id: Uuid,
    user_id: i64,
    grace_started_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleActiveRow {
    sub_id: Uuid,
    user_id: i64,
    expires_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanedPaymentRow {
    payment_id: Uuid,
    user_id: i64,
    amount: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct FutureCursorRow {
    last_tx_at: OffsetDateTime,
    last_tx_id: Option<String>,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    /// Every check, in run order.
    pub const NAMES: [&'static str; 5] = [
        "single_live_subscription",
        "grace_has_deadline",
        "no_stale_active_rows",
        "payments_linked",
        "cursor_not_in_future",
    ];

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs every check in [`Self::NAMES`] and folds the results into a
    /// summary.
    pub async fn run_all_checks(&self) -> CoreResult<InvariantCheckSummary> {
        let checked_at = OffsetDateTime::now_utc();
        let mut violations = Vec::new();
        let mut checks_failed = 0;

        for name in Self::NAMES {
            let found = self.run_check(name).await?;
            if !found.is_empty() {
                checks_failed += 1;
            }
            violations.extend(found);
        }

        Ok(InvariantCheckSummary {
            checked_at,
            checks_run: Self::NAMES.len(),
            checks_passed: Self::NAMES.len() - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Runs one check by name. Unknown names report nothing rather than
    /// erroring, so callers can probe with user input.
    pub async fn run_check(&self, name: &str) -> CoreResult<Vec<InvariantViolation>> {
        match name {
            "single_live_subscription" => self.check_single_live_subscription().await,
            "grace_has_deadline" => self.check_grace_has_deadline().await,
            "no_stale_active_rows" => self.check_no_stale_active_rows().await,
            "payments_linked" => self.check_payments_linked().await,
            "cursor_not_in_future" => self.check_cursor_not_in_future().await,
            _ => Ok(Vec::new()),
        }
    }

    /// At most one `active`/`grace` row per user. Two live rows give double
    /// reminders and an ambiguous answer to "does this user have access".
    async fn check_single_live_subscription(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleLiveRowsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as row_count
            FROM subscriptions
            WHERE status IN ('active', 'grace')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| InvariantViolation {
                invariant: "single_live_subscription",
                user_ids: vec![r.user_id],
                description: format!(
                    "user carries {} live subscription rows, expected at most one",
                    r.row_count
                ),
                details: serde_json::json!({ "row_count": r.row_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Every grace row carries a deadline. The expiry sweep only selects
    /// rows with a non-NULL `grace_until`; a row without one sits in grace
    /// forever.
    async fn check_grace_has_deadline(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<GraceNoDeadlineRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, user_id, grace_started_at
            FROM subscriptions
            WHERE status = 'grace' AND grace_until IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| InvariantViolation {
                invariant: "grace_has_deadline",
                user_ids: vec![r.user_id],
                description: "grace subscription has no grace_until deadline".to_string(),
                details: serde_json::json!({
                    "subscription_id": r.sub_id,
                    "grace_started_at": r.grace_started_at.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// No active row sits long past its expiry. Being past `expires_at` is
    /// normal between sweep runs; more than a day overdue means the sweep
    /// has not run or keeps failing.
    async fn check_no_stale_active_rows(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleActiveRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, user_id, expires_at
            FROM subscriptions
            WHERE status = 'active'
              AND expires_at < NOW() - INTERVAL '24 hours'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| InvariantViolation {
                invariant: "no_stale_active_rows",
                user_ids: vec![r.user_id],
                description: format!(
                    "active subscription expired at {} and never entered grace",
                    r.expires_at
                ),
                details: serde_json::json!({
                    "subscription_id": r.sub_id,
                    "expires_at": r.expires_at.to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Payments point at the subscription they funded. The ingest path
    /// always backfills the link; an unlinked payment points at a manual
    /// edit or a broken migration.
    async fn check_payments_linked(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanedPaymentRow> = sqlx::query_as(
            r#"
            SELECT id as payment_id, user_id, amount
            FROM payments
            WHERE subscription_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| InvariantViolation {
                invariant: "payments_linked",
                user_ids: vec![r.user_id],
                description: format!(
                    "payment of {} Stars is not linked to any subscription",
                    r.amount
                ),
                details: serde_json::json!({
                    "payment_id": r.payment_id,
                    "amount": r.amount,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// The reconcile cursor never sits in the future, beyond a small clock
    /// skew allowance. A future cursor makes every window skip real
    /// transactions.
    async fn check_cursor_not_in_future(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<FutureCursorRow> = sqlx::query_as(
            r#"
            SELECT last_tx_at, last_tx_id
            FROM star_tx_cursor
            WHERE last_tx_at > NOW() + INTERVAL '5 minutes'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| InvariantViolation {
                invariant: "cursor_not_in_future",
                user_ids: Vec::new(),
                description: format!("reconcile cursor sits at {} in the future", r.last_tx_at),
                details: serde_json::json!({
                    "last_tx_at": r.last_tx_at.to_string(),
                    "last_tx_id": r.last_tx_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}
