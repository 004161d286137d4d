//! Pure subscription state machine.
//!
//! Everything here is synchronous and side-effect free: given a row, the
//! current wall-clock time, and the configured durations, these functions
//! decide which transition (if any) applies. The sweep service and the
//! ledger implementations execute the decisions; tests exercise the logic
//! without a store or a clock.
//!
//! Transitions:
//!
//! - `active → grace` once `now ≥ expires_at`, debounced so overlapping
//!   sweep runs cannot double-process a row.
//! - `grace → expired` once `now ≥ grace_until`. The whitelist-driven ban
//!   decision is made at this boundary, never earlier, which is why a late
//!   sweep must take `active → grace → expired` in two steps rather than
//!   jumping straight to `expired`.
//! - payment applied `→ active` from any state, clearing grace fields.

use time::{Duration, OffsetDateTime};

use doorman_shared::SubscriptionStatus;

use crate::error::{CoreError, CoreResult};
use crate::types::Subscription;

/// Gate between duplicate reminder sends across overlapping sweep runs.
pub const REMINDER_RESEND_GATE: Duration = Duration::days(1);

/// Events that drive status changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// An idempotent payment insert succeeded for this user.
    PaymentApplied,
    /// `now` reached the expiry timestamp.
    GraceDue,
    /// `now` reached the grace deadline.
    ExpiryDue,
    /// The platform reported this member banned.
    PlatformBan,
}

/// Legal transition table. Anything not listed is a bug in the caller.
pub fn transition(
    status: SubscriptionStatus,
    event: LifecycleEvent,
) -> CoreResult<SubscriptionStatus> {
    use LifecycleEvent::*;
    use SubscriptionStatus::*;

    match (status, event) {
        // Payment wins from every state. A payment against an expired or
        // banned history row materializes as a fresh active row; the table
        // treats that as the same logical edge.
        (_, PaymentApplied) => Ok(Active),
        (Active, GraceDue) => Ok(Grace),
        (Grace, ExpiryDue) => Ok(Expired),
        (Active | Grace | Expired, PlatformBan) => Ok(Banned),
        (from, event) => Err(CoreError::Validation(format!(
            "no transition from '{from}' on {event:?}"
        ))),
    }
}

/// `active → grace` predicate with the overlap debounce: a row whose grace
/// transition already ran within `debounce` is skipped.
pub fn due_for_grace(sub: &Subscription, now: OffsetDateTime, debounce: Duration) -> bool {
    if sub.status != SubscriptionStatus::Active || now < sub.expires_at {
        return false;
    }
    match sub.grace_started_at {
        None => true,
        Some(started) => started < now - debounce,
    }
}

/// The grace deadline is anchored to the expiry, not the sweep time, so a
/// late sweep does not silently lengthen the grace period.
pub fn grace_deadline(expires_at: OffsetDateTime, grace: Duration) -> OffsetDateTime {
    expires_at + grace
}

/// `grace → expired` predicate.
pub fn due_for_expiry(sub: &Subscription, now: OffsetDateTime) -> bool {
    sub.status == SubscriptionStatus::Grace
        && sub.grace_until.is_some_and(|deadline| now >= deadline)
}

/// Reminder predicate for non-recurring subscriptions approaching expiry.
/// The persisted `reminder_sent_at` plus [`REMINDER_RESEND_GATE`] guarantee
/// exactly one send across overlapping runs.
pub fn due_for_reminder(sub: &Subscription, now: OffsetDateTime, lead: Duration) -> bool {
    if sub.status != SubscriptionStatus::Active || sub.is_recurring {
        return false;
    }
    if sub.expires_at < now || sub.expires_at > now + lead {
        return false;
    }
    match sub.reminder_sent_at {
        None => true,
        Some(sent) => sent < now - REMINDER_RESEND_GATE,
    }
}

/// New expiry after a successful payment.
///
/// A provider-supplied expiry (recurring charges) wins outright. Otherwise
/// the plan duration stacks on top of whatever access remains:
/// `max(current expiry, now) + plan`, so renewing early never forfeits paid
/// time.
pub fn activation_expiry(
    current_expiry: Option<OffsetDateTime>,
    now: OffsetDateTime,
    plan: Duration,
    explicit: Option<OffsetDateTime>,
) -> OffsetDateTime {
    if let Some(expiry) = explicit {
        return expiry;
    }
    let base = match current_expiry {
        Some(current) if current > now => current,
        _ => now,
    };
    base + plan
}
