//! Postgres implementation of the core ledger trait.
//!
//! All timestamps are `TIMESTAMPTZ` and all status columns are lowercase
//! text; the shared enums' `as_str`/`parse` define the mapping. The payment
//! path is transactional with the unique provider identifiers as the
//! idempotency barrier, so concurrent ingestion of the same charge commits
//! exactly once.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime, Time};
use uuid::Uuid;

use doorman_core::error::{CoreError, CoreResult};
use doorman_core::machine;
use doorman_core::store::LedgerStore;
use doorman_core::types::{
    FunnelEventKind, IngestOutcome, LedgerStats, Payment, PaymentEvent, ReconcileCursor,
    Subscription, UserProfile, WhitelistEntry,
};
use doorman_shared::{SubscriptionStatus, TelegramId, UserStatus};

const SELECT_SUBSCRIPTION: &str = r#"
    SELECT id, user_id, status, is_recurring, expires_at, grace_until,
           grace_started_at, cancelled_at, reminder_sent_at, created_at, updated_at
    FROM subscriptions
"#;

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: i64,
    status: String,
    is_recurring: bool,
    expires_at: OffsetDateTime,
    grace_until: Option<OffsetDateTime>,
    grace_started_at: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
    reminder_sent_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl SubscriptionRow {
    fn into_subscription(self) -> CoreResult<Subscription> {
        let status = SubscriptionStatus::parse(&self.status).ok_or_else(|| {
            CoreError::Storage(format!(
                "subscription {} has unknown status '{}'",
                self.id, self.status
            ))
        })?;
        Ok(Subscription {
            id: self.id,
            user_id: self.user_id,
            status,
            is_recurring: self.is_recurring,
            expires_at: self.expires_at,
            grace_until: self.grace_until,
            grace_started_at: self.grace_started_at,
            cancelled_at: self.cancelled_at,
            reminder_sent_at: self.reminder_sent_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn rows_into_subscriptions(rows: Vec<SubscriptionRow>) -> CoreResult<Vec<Subscription>> {
    rows.into_iter()
        .map(SubscriptionRow::into_subscription)
        .collect()
}

#[derive(Debug, sqlx::FromRow)]
struct WhitelistRow {
    telegram_id: i64,
    source: String,
    note: Option<String>,
    granted_at: OffsetDateTime,
    revoked_at: Option<OffsetDateTime>,
}

impl From<WhitelistRow> for WhitelistEntry {
    fn from(row: WhitelistRow) -> Self {
        WhitelistEntry {
            telegram_id: row.telegram_id,
            source: row.source,
            note: row.note,
            granted_at: row.granted_at,
            revoked_at: row.revoked_at,
        }
    }
}

/// [`LedgerStore`] backed by a Postgres pool.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn upsert_user(&self, profile: &UserProfile) -> CoreResult<()> {
        // Status is preserved on conflict so a refresh cannot clear a ban.
        sqlx::query(
            r#"
            INSERT INTO users (user_id, username, first_name, last_name, language_code)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                username = EXCLUDED.username,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                language_code = EXCLUDED.language_code,
                last_seen_at = NOW()
            "#,
        )
        .bind(profile.user_id)
        .bind(&profile.username)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(&profile.language_code)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn set_user_status(&self, user_id: TelegramId, status: UserStatus) -> CoreResult<()> {
        sqlx::query("UPDATE users SET status = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn apply_payment(
        &self,
        event: &PaymentEvent,
        now: OffsetDateTime,
        plan: Duration,
    ) -> CoreResult<IngestOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        // Fast duplicate check. NULL identifiers never match anything.
        let duplicate: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM payments WHERE charge_id = $1 OR star_tx_id = $2 LIMIT 1",
        )
        .bind(&event.charge_id)
        .bind(&event.star_tx_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        if duplicate.is_some() {
            return Ok(IngestOutcome::Duplicate);
        }

        // Lock the latest row so concurrent payments for one user serialize.
        let current: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "{SELECT_SUBSCRIPTION} WHERE user_id = $1 ORDER BY created_at DESC, updated_at DESC LIMIT 1 FOR UPDATE"
        ))
        .bind(event.user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;

        let live = current.filter(|row| {
            SubscriptionStatus::parse(&row.status).is_some_and(|s| s.has_access())
        });

        let subscription = match live {
            Some(row) => {
                let expires_at = machine::activation_expiry(
                    Some(row.expires_at),
                    now,
                    plan,
                    event.explicit_expiry,
                );
                let updated: SubscriptionRow = sqlx::query_as(
                    r#"
                    UPDATE subscriptions SET
                        status = 'active',
                        is_recurring = $2,
                        expires_at = $3,
                        grace_until = NULL,
                        grace_started_at = NULL,
                        reminder_sent_at = NULL,
                        cancelled_at = NULL,
                        updated_at = $4
                    WHERE id = $1
                    RETURNING id, user_id, status, is_recurring, expires_at, grace_until,
                              grace_started_at, cancelled_at, reminder_sent_at, created_at, updated_at
                    "#,
                )
                .bind(row.id)
                .bind(event.is_recurring)
                .bind(expires_at)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| CoreError::Storage(e.to_string()))?;
                updated.into_subscription()?
            }
            // Terminal or missing history: open a fresh row.
            None => {
                let expires_at =
                    machine::activation_expiry(None, now, plan, event.explicit_expiry);
                let inserted: SubscriptionRow = sqlx::query_as(
                    r#"
                    INSERT INTO subscriptions
                        (id, user_id, status, is_recurring, expires_at, created_at, updated_at)
                    VALUES ($1, $2, 'active', $3, $4, $5, $5)
                    RETURNING id, user_id, status, is_recurring, expires_at, grace_until,
                              grace_started_at, cancelled_at, reminder_sent_at, created_at, updated_at
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(event.user_id)
                .bind(event.is_recurring)
                .bind(expires_at)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| CoreError::Storage(e.to_string()))?;
                inserted.into_subscription()?
            }
        };

        let payment_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO payments
                (id, user_id, subscription_id, charge_id, star_tx_id, amount, kind,
                 is_recurring, invoice_payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.user_id)
        .bind(subscription.id)
        .bind(&event.charge_id)
        .bind(&event.star_tx_id)
        .bind(event.amount)
        .bind(event.kind.as_str())
        .bind(event.is_recurring)
        .bind(&event.invoice_payload)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;

        let Some(payment_id) = payment_id else {
            // A concurrent ingest recorded the charge first; undo our
            // subscription change and report the duplicate.
            tx.rollback()
                .await
                .map_err(|e| CoreError::Storage(e.to_string()))?;
            return Ok(IngestOutcome::Duplicate);
        };

        tx.commit()
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        Ok(IngestOutcome::Applied {
            payment: Payment {
                id: payment_id,
                user_id: event.user_id,
                charge_id: event.charge_id.clone(),
                star_tx_id: event.star_tx_id.clone(),
                amount: event.amount,
                kind: event.kind,
                is_recurring: event.is_recurring,
                invoice_payload: event.invoice_payload.clone(),
                subscription_id: Some(subscription.id),
                created_at: now,
            },
            subscription,
        })
    }

    async fn known_external_tx_ids(&self, since: OffsetDateTime) -> CoreResult<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT star_tx_id FROM payments WHERE star_tx_id IS NOT NULL AND created_at >= $1",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(ids.into_iter().collect())
    }

    async fn subscription_for_user(
        &self,
        user_id: TelegramId,
    ) -> CoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "{SELECT_SUBSCRIPTION} WHERE user_id = $1 ORDER BY created_at DESC, updated_at DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        row.map(SubscriptionRow::into_subscription).transpose()
    }

    async fn find_due_for_grace(
        &self,
        now: OffsetDateTime,
        debounce: Duration,
    ) -> CoreResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"{SELECT_SUBSCRIPTION}
            WHERE status = 'active'
              AND expires_at <= $1
              AND (grace_started_at IS NULL OR grace_started_at < $2)
            ORDER BY expires_at
            "#
        ))
        .bind(now)
        .bind(now - debounce)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        rows_into_subscriptions(rows)
    }

    async fn begin_grace(
        &self,
        subscription_id: Uuid,
        grace_until: OffsetDateTime,
        now: OffsetDateTime,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = 'grace',
                grace_until = $2,
                grace_started_at = $3,
                updated_at = $3
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(subscription_id)
        .bind(grace_until)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_due_for_expiry(&self, now: OffsetDateTime) -> CoreResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"{SELECT_SUBSCRIPTION}
            WHERE status = 'grace'
              AND grace_until IS NOT NULL
              AND grace_until <= $1
            ORDER BY grace_until
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        rows_into_subscriptions(rows)
    }

    async fn mark_expired(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = 'expired', updated_at = $2 WHERE id = $1 AND status = 'grace'",
        )
        .bind(subscription_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_expiring_soon(
        &self,
        now: OffsetDateTime,
        lead: Duration,
    ) -> CoreResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"{SELECT_SUBSCRIPTION}
            WHERE status = 'active'
              AND is_recurring = FALSE
              AND expires_at >= $1
              AND expires_at <= $2
              AND (reminder_sent_at IS NULL OR reminder_sent_at < $3)
            ORDER BY expires_at
            "#
        ))
        .bind(now)
        .bind(now + lead)
        .bind(now - machine::REMINDER_RESEND_GATE)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        rows_into_subscriptions(rows)
    }

    async fn mark_reminder_sent(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE subscriptions SET reminder_sent_at = $2, updated_at = $2 WHERE id = $1",
        )
        .bind(subscription_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn cancel_auto_renew(
        &self,
        user_id: TelegramId,
        now: OffsetDateTime,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                is_recurring = FALSE,
                cancelled_at = $2,
                updated_at = $2
            WHERE id = (
                SELECT id FROM subscriptions
                WHERE user_id = $1
                ORDER BY created_at DESC, updated_at DESC
                LIMIT 1
            )
            AND status = 'active'
            AND is_recurring = TRUE
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_banned(&self, user_id: TelegramId, now: OffsetDateTime) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = 'banned',
                updated_at = $2
            WHERE id = (
                SELECT id FROM subscriptions
                WHERE user_id = $1
                ORDER BY created_at DESC, updated_at DESC
                LIMIT 1
            )
            AND status IN ('active', 'grace')
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }

    async fn grant_whitelist(
        &self,
        telegram_id: TelegramId,
        source: &str,
        note: Option<&str>,
        now: OffsetDateTime,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO whitelist (telegram_id, source, note, granted_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (telegram_id) DO UPDATE SET
                revoked_at = NULL,
                source = EXCLUDED.source,
                note = COALESCE(EXCLUDED.note, whitelist.note)
            "#,
        )
        .bind(telegram_id)
        .bind(source)
        .bind(note)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn revoke_whitelist(
        &self,
        telegram_id: TelegramId,
        reason: &str,
        now: OffsetDateTime,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE whitelist SET
                revoked_at = $2,
                note = CASE
                    WHEN note IS NULL OR note = '' THEN $3
                    ELSE note || ' - ' || $3
                END
            WHERE telegram_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(telegram_id)
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }

    async fn is_whitelisted(&self, telegram_id: TelegramId) -> CoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM whitelist WHERE telegram_id = $1 AND revoked_at IS NULL)",
        )
        .bind(telegram_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(exists)
    }

    async fn whitelist_entry(
        &self,
        telegram_id: TelegramId,
    ) -> CoreResult<Option<WhitelistEntry>> {
        let row: Option<WhitelistRow> = sqlx::query_as(
            "SELECT telegram_id, source, note, granted_at, revoked_at FROM whitelist WHERE telegram_id = $1",
        )
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(row.map(WhitelistEntry::from))
    }

    async fn log_event(
        &self,
        kind: FunnelEventKind,
        user_id: Option<TelegramId>,
        details: serde_json::Value,
    ) -> CoreResult<()> {
        sqlx::query("INSERT INTO funnel_events (kind, user_id, details) VALUES ($1, $2, $3)")
            .bind(kind.as_str())
            .bind(user_id)
            .bind(details)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get_or_init_cursor(
        &self,
        default_start: OffsetDateTime,
    ) -> CoreResult<ReconcileCursor> {
        sqlx::query(
            "INSERT INTO star_tx_cursor (id, last_tx_at) VALUES (1, $1) ON CONFLICT (id) DO NOTHING",
        )
        .bind(default_start)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;

        let (last_tx_at, last_tx_id, updated_at): (
            OffsetDateTime,
            Option<String>,
            OffsetDateTime,
        ) = sqlx::query_as(
            "SELECT last_tx_at, last_tx_id, updated_at FROM star_tx_cursor WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;

        Ok(ReconcileCursor {
            last_tx_at,
            last_tx_id,
            updated_at,
        })
    }

    async fn advance_cursor(
        &self,
        last_tx_at: OffsetDateTime,
        last_tx_id: &str,
    ) -> CoreResult<()> {
        // GREATEST keeps the cursor monotonic under concurrent runs.
        sqlx::query(
            r#"
            INSERT INTO star_tx_cursor (id, last_tx_at, last_tx_id)
            VALUES (1, $1, $2)
            ON CONFLICT (id) DO UPDATE SET
                last_tx_at = GREATEST(star_tx_cursor.last_tx_at, EXCLUDED.last_tx_at),
                last_tx_id = EXCLUDED.last_tx_id,
                updated_at = NOW()
            "#,
        )
        .bind(last_tx_at)
        .bind(last_tx_id)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn stats(&self, now: OffsetDateTime) -> CoreResult<LedgerStats> {
        let day_ago = now - Duration::days(1);
        let month_ago = now - Duration::days(30);
        let day_start = now.replace_time(Time::MIDNIGHT);

        let (total_users, active_users_24h, new_signups_today): (i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT COUNT(*),
                       COUNT(*) FILTER (WHERE last_seen_at >= $1),
                       COUNT(*) FILTER (WHERE created_at >= $2)
                FROM users
                "#,
            )
            .bind(day_ago)
            .bind(day_start)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let (active_subs, grace_subs, recurring_subs): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FILTER (WHERE status = 'active'),
                   COUNT(*) FILTER (WHERE status = 'grace'),
                   COUNT(*) FILTER (WHERE status = 'active' AND is_recurring)
            FROM subscriptions
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;

        let (revenue_24h, revenue_30d, payments_24h): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount) FILTER (WHERE created_at >= $1), 0)::BIGINT,
                   COALESCE(SUM(amount) FILTER (WHERE created_at >= $2), 0)::BIGINT,
                   COUNT(*) FILTER (WHERE created_at >= $1)
            FROM payments
            "#,
        )
        .bind(day_ago)
        .bind(month_ago)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;

        Ok(LedgerStats {
            total_users,
            active_users_24h,
            new_signups_today,
            active_subs,
            grace_subs,
            recurring_subs,
            revenue_24h,
            revenue_30d,
            payments_24h,
        })
    }
}
