//! Typed records for the entities the engine operates on.
//!
//! These mirror the ledger tables one to one. The engine never sees raw rows;
//! the store trait in [`crate::store`] speaks these types exclusively.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use doorman_shared::{PaymentKind, SubscriptionStatus, UserStatus};

/// Identity record for a Telegram user. Created on first contact, updated on
/// every interaction, never deleted.
#[derive(Debug, Clone)]
pub struct User {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub status: UserStatus,
    pub last_seen_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

/// Profile fields carried by an inbound interaction, used to upsert [`User`].
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
}

/// One subscription row. Multiple historical rows per user may exist; at most
/// one is `active` or `grace` at any time.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: i64,
    pub status: SubscriptionStatus,
    pub is_recurring: bool,
    pub expires_at: OffsetDateTime,
    pub grace_until: Option<OffsetDateTime>,
    pub grace_started_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub reminder_sent_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Immutable record of a single payment. Only `subscription_id` is ever
/// backfilled after insert.
#[derive(Debug, Clone)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: i64,
    /// Provider charge identifier, unique when present.
    pub charge_id: Option<String>,
    /// Provider star-transaction identifier, unique when present.
    pub star_tx_id: Option<String>,
    /// Amount in Stars.
    pub amount: i64,
    pub kind: PaymentKind,
    pub is_recurring: bool,
    pub invoice_payload: Option<String>,
    pub subscription_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

/// Inbound payment notification, as handed to ingestion by the webhook
/// transport or by reconciliation.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub user_id: i64,
    pub charge_id: Option<String>,
    pub star_tx_id: Option<String>,
    pub amount: i64,
    pub kind: PaymentKind,
    pub is_recurring: bool,
    pub invoice_payload: Option<String>,
    /// Provider-supplied expiry for recurring charges; wins over the
    /// computed plan extension when present.
    pub explicit_expiry: Option<OffsetDateTime>,
}

/// Result of the idempotent payment write. `Duplicate` is success: the
/// original delivery already granted access.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Applied {
        payment: Payment,
        subscription: Subscription,
    },
    Duplicate,
}

impl IngestOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestOutcome::Duplicate)
    }
}

/// Free-access grant independent of payment. One row per user; active while
/// `revoked_at` is null. Revocation is one-way.
#[derive(Debug, Clone)]
pub struct WhitelistEntry {
    pub telegram_id: i64,
    pub source: String,
    pub note: Option<String>,
    pub granted_at: OffsetDateTime,
    pub revoked_at: Option<OffsetDateTime>,
}

/// Append-only audit/analytics event tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelEventKind {
    PaymentReceived,
    ReconcileApplied,
    ReconcileComplete,
    GraceNotificationSent,
    ExpiryNotificationSent,
    ReminderSent,
    AutoBanned,
    WhitelistGranted,
    WhitelistRevoked,
    MemberLeft,
}

impl FunnelEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelEventKind::PaymentReceived => "payment_received",
            FunnelEventKind::ReconcileApplied => "reconcile_applied",
            FunnelEventKind::ReconcileComplete => "reconcile_complete",
            FunnelEventKind::GraceNotificationSent => "grace_notification_sent",
            FunnelEventKind::ExpiryNotificationSent => "expiry_notification_sent",
            FunnelEventKind::ReminderSent => "reminder_sent",
            FunnelEventKind::AutoBanned => "auto_banned",
            FunnelEventKind::WhitelistGranted => "whitelist_granted",
            FunnelEventKind::WhitelistRevoked => "whitelist_revoked",
            FunnelEventKind::MemberLeft => "member_left",
        }
    }
}

impl std::fmt::Display for FunnelEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Singleton reconciliation cursor: the timestamp (and optional id) of the
/// newest provider transaction applied so far. Advances monotonically.
#[derive(Debug, Clone)]
pub struct ReconcileCursor {
    pub last_tx_at: OffsetDateTime,
    pub last_tx_id: Option<String>,
    pub updated_at: OffsetDateTime,
}

/// Aggregate counters for the daily digest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerStats {
    pub total_users: i64,
    pub active_users_24h: i64,
    pub new_signups_today: i64,
    pub active_subs: i64,
    pub grace_subs: i64,
    pub recurring_subs: i64,
    pub revenue_24h: i64,
    pub revenue_30d: i64,
    pub payments_24h: i64,
}
