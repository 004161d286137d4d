//! Persistence seam for the lifecycle engine.
//!
//! Services depend on [`LedgerStore`] rather than a concrete database so the
//! state machine, ingestion, and reconciliation logic can be exercised
//! against an in-memory ledger in tests. The Postgres implementation lives
//! in the `doorman-store` crate.

use std::collections::HashSet;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

use doorman_shared::{TelegramId, UserStatus};

use crate::error::CoreResult;
use crate::types::{
    FunnelEventKind, IngestOutcome, LedgerStats, PaymentEvent, ReconcileCursor, Subscription,
    UserProfile, WhitelistEntry,
};

/// Storage contract for users, subscriptions, payments, the whitelist, the
/// funnel log, and the reconciliation cursor.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // --- Users ---

    /// Inserts or refreshes a user row, bumping `last_seen_at`.
    async fn upsert_user(&self, profile: &UserProfile) -> CoreResult<()>;

    /// Sets the platform-level status (active or banned).
    async fn set_user_status(&self, user_id: TelegramId, status: UserStatus) -> CoreResult<()>;

    // --- Payments and activation ---

    /// Applies a payment atomically: records it, then activates or extends
    /// the user's subscription in the same transaction.
    ///
    /// The payment insert is conditional on the provider identifiers
    /// (`charge_id`, `star_tx_id`); when either already exists the whole
    /// call is a no-op returning [`IngestOutcome::Duplicate`]. On success the
    /// payment row carries the id of the subscription it funded. A user
    /// whose latest subscription is expired or banned gets a fresh active
    /// row so history stays intact and at most one row per user is ever
    /// active or in grace.
    async fn apply_payment(
        &self,
        event: &PaymentEvent,
        now: OffsetDateTime,
        plan: Duration,
    ) -> CoreResult<IngestOutcome>;

    /// External transaction ids already recorded with `created_at` at or
    /// after `since`. Reconciliation uses this as its duplicate set.
    async fn known_external_tx_ids(&self, since: OffsetDateTime) -> CoreResult<HashSet<String>>;

    // --- Subscriptions ---

    /// The user's most recent subscription row, if any.
    async fn subscription_for_user(
        &self,
        user_id: TelegramId,
    ) -> CoreResult<Option<Subscription>>;

    /// Active subscriptions whose expiry has passed, excluding rows whose
    /// grace transition already ran within `debounce`.
    async fn find_due_for_grace(
        &self,
        now: OffsetDateTime,
        debounce: Duration,
    ) -> CoreResult<Vec<Subscription>>;

    /// Moves an active subscription into grace with the given deadline.
    /// Returns false when the row was no longer active (a payment landed
    /// between the scan and the write).
    async fn begin_grace(
        &self,
        subscription_id: uuid::Uuid,
        grace_until: OffsetDateTime,
        now: OffsetDateTime,
    ) -> CoreResult<bool>;

    /// Grace subscriptions whose deadline has passed.
    async fn find_due_for_expiry(&self, now: OffsetDateTime) -> CoreResult<Vec<Subscription>>;

    /// Marks a grace subscription expired. Returns false when the row was
    /// no longer in grace.
    async fn mark_expired(
        &self,
        subscription_id: uuid::Uuid,
        now: OffsetDateTime,
    ) -> CoreResult<bool>;

    /// Non-recurring active subscriptions expiring within `lead`, excluding
    /// rows reminded within the resend gate.
    async fn find_expiring_soon(
        &self,
        now: OffsetDateTime,
        lead: Duration,
    ) -> CoreResult<Vec<Subscription>>;

    /// Persists the reminder timestamp so overlapping passes send at most
    /// one reminder per expiry.
    async fn mark_reminder_sent(
        &self,
        subscription_id: uuid::Uuid,
        now: OffsetDateTime,
    ) -> CoreResult<()>;

    /// Turns off auto-renewal on the user's active subscription, keeping
    /// access until the paid period ends. Returns false when there was
    /// nothing to cancel.
    async fn cancel_auto_renew(
        &self,
        user_id: TelegramId,
        now: OffsetDateTime,
    ) -> CoreResult<bool>;

    /// Marks the user's active or grace subscription banned (platform ban
    /// observed). Returns false when no such row exists.
    async fn mark_banned(&self, user_id: TelegramId, now: OffsetDateTime) -> CoreResult<bool>;

    // --- Whitelist ---

    /// Grants protection from automatic bans. Re-granting an existing entry
    /// clears its revocation and appends to the note.
    async fn grant_whitelist(
        &self,
        telegram_id: TelegramId,
        source: &str,
        note: Option<&str>,
        now: OffsetDateTime,
    ) -> CoreResult<()>;

    /// Revokes a whitelist entry, appending `reason` to its note. Burning
    /// an entry on join and revoking on departure both go through here.
    /// Returns false when no active entry existed.
    async fn revoke_whitelist(
        &self,
        telegram_id: TelegramId,
        reason: &str,
        now: OffsetDateTime,
    ) -> CoreResult<bool>;

    /// Whether the user currently holds an unrevoked whitelist entry.
    async fn is_whitelisted(&self, telegram_id: TelegramId) -> CoreResult<bool>;

    /// The user's whitelist row, revoked or not.
    async fn whitelist_entry(
        &self,
        telegram_id: TelegramId,
    ) -> CoreResult<Option<WhitelistEntry>>;

    // --- Funnel log ---

    /// Appends an analytics event. Failures here must never abort the
    /// operation being logged; callers log and continue.
    async fn log_event(
        &self,
        kind: FunnelEventKind,
        user_id: Option<TelegramId>,
        details: serde_json::Value,
    ) -> CoreResult<()>;

    // --- Reconciliation cursor ---

    /// Loads the reconciliation cursor, initializing it to `default_start`
    /// on first run.
    async fn get_or_init_cursor(
        &self,
        default_start: OffsetDateTime,
    ) -> CoreResult<ReconcileCursor>;

    /// Advances the cursor. Implementations must keep it monotonic: a call
    /// with an older timestamp than the stored one leaves the cursor
    /// untouched.
    async fn advance_cursor(
        &self,
        last_tx_at: OffsetDateTime,
        last_tx_id: &str,
    ) -> CoreResult<()>;

    // --- Stats ---

    /// Aggregate counters for the daily digest.
    async fn stats(&self, now: OffsetDateTime) -> CoreResult<LedgerStats>;
}
