//! Lifecycle sweeps and membership handling.
//!
//! [`LifecycleService::run_state_sweep`] drives the decay transitions of
//! the state machine on a timer. The two phases run in order within one
//! pass: overdue active rows move to grace first, then every grace row
//! past its deadline (including rows that just entered grace) is expired.
//! A row therefore never jumps from `active` to `expired` directly, and
//! the whitelist is consulted exactly once, at the grace boundary, where
//! the ban decision is made.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use doorman_shared::{Config, TelegramId, UserStatus};

use crate::error::{CoreError, CoreResult};
use crate::machine;
use crate::messaging::{DeferredOp, InvoiceSpec, ResilientMessaging};
use crate::store::LedgerStore;
use crate::texts;
use crate::types::{FunnelEventKind, Subscription, UserProfile, WhitelistEntry};

/// Provider-defined renewal period for subscription invoices.
const SUBSCRIPTION_PERIOD_SECS: u32 = 2_592_000;

const PAYLOAD_ONE_TIME: &str = "plan:one_time";
const PAYLOAD_SUBSCRIPTION: &str = "plan:subscription";

/// Counters from one state sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    /// Rows moved `active → grace`.
    pub graced: usize,
    /// Rows moved `grace → expired`.
    pub expired: usize,
    /// Ban calls issued for expired rows.
    pub banned: usize,
    /// Expired rows spared from a ban by an active whitelist entry.
    pub whitelist_spared: usize,
    pub errors: usize,
}

/// Counters from one reminder pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReminderSummary {
    pub sent: usize,
    pub errors: usize,
}

/// Outcome of a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    /// Active or grace subscription: seat approved.
    ApprovedSubscriber,
    /// Whitelist entry consumed: seat approved.
    ApprovedWhitelist,
    /// No access: declined, paywall sent.
    DeclinedPaywalled,
}

pub struct LifecycleService {
    store: Arc<dyn LedgerStore>,
    messaging: Arc<ResilientMessaging>,
    config: Arc<Config>,
}

impl LifecycleService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        messaging: Arc<ResilientMessaging>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            messaging,
            config,
        }
    }

    /// One pass of the decay state machine. Row-level failures are counted
    /// and skipped so a single bad row cannot stall the sweep.
    pub async fn run_state_sweep(&self, now: OffsetDateTime) -> CoreResult<SweepSummary> {
        let mut summary = SweepSummary::default();

        let overdue = self
            .store
            .find_due_for_grace(now, self.config.grace_debounce())
            .await?;
        for sub in overdue {
            match self.enter_grace(&sub, now).await {
                Ok(true) => summary.graced += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(user_id = sub.user_id, error = %e, "grace transition failed");
                    summary.errors += 1;
                }
            }
        }

        // Re-scan after the grace phase so a row that just entered grace
        // with an already-elapsed deadline finishes in the same pass.
        let lapsed = self.store.find_due_for_expiry(now).await?;
        for sub in lapsed {
            match self.expire(&sub, now).await {
                Ok(Some(banned)) => {
                    summary.expired += 1;
                    if banned {
                        summary.banned += 1;
                    } else {
                        summary.whitelist_spared += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(user_id = sub.user_id, error = %e, "expiry transition failed");
                    summary.errors += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Moves one row into grace. Returns false when a payment won the race
    /// and the row is no longer active.
    async fn enter_grace(&self, sub: &Subscription, now: OffsetDateTime) -> CoreResult<bool> {
        let deadline = machine::grace_deadline(sub.expires_at, self.config.grace_duration());
        if !self.store.begin_grace(sub.id, deadline, now).await? {
            debug!(user_id = sub.user_id, "grace transition skipped, row changed");
            return Ok(false);
        }
        info!(
            user_id = sub.user_id,
            grace_until = %deadline,
            "subscription entered grace"
        );

        // Notification is best-effort and never blocks the transition.
        if let Err(e) = self
            .messaging
            .execute_or_enqueue(DeferredOp::SendMessage {
                chat_id: sub.user_id,
                text: texts::grace_warning(deadline),
            })
            .await
        {
            warn!(user_id = sub.user_id, error = %e, "grace notification not delivered");
        } else {
            self.log_funnel(
                FunnelEventKind::GraceNotificationSent,
                sub.user_id,
                serde_json::json!({ "grace_until": deadline.unix_timestamp() }),
            )
            .await;
        }
        Ok(true)
    }

    /// Expires one grace row. The whitelist decides the ban side effect;
    /// the row goes to `expired` either way. Returns `Some(banned)` on
    /// transition, `None` when a payment won the race.
    async fn expire(&self, sub: &Subscription, now: OffsetDateTime) -> CoreResult<Option<bool>> {
        let whitelisted = self.store.is_whitelisted(sub.user_id).await?;
        if !self.store.mark_expired(sub.id, now).await? {
            debug!(user_id = sub.user_id, "expiry transition skipped, row changed");
            return Ok(None);
        }

        if whitelisted {
            info!(user_id = sub.user_id, "subscription expired, whitelist holds the seat");
            return Ok(Some(false));
        }

        info!(user_id = sub.user_id, "subscription expired, removing member");
        self.ban_member(sub.user_id, sub.id).await;

        if let Err(e) = self
            .messaging
            .execute_or_enqueue(DeferredOp::SendMessage {
                chat_id: sub.user_id,
                text: texts::access_expired(),
            })
            .await
        {
            warn!(user_id = sub.user_id, error = %e, "expiry notification not delivered");
        } else {
            self.log_funnel(
                FunnelEventKind::ExpiryNotificationSent,
                sub.user_id,
                serde_json::json!({}),
            )
            .await;
        }
        Ok(Some(true))
    }

    /// Issues the platform ban for an expired member. A member who already
    /// left needs no call.
    async fn ban_member(&self, user_id: TelegramId, subscription_id: uuid::Uuid) {
        let chat_id = self.config.group_chat_id;
        match self.messaging.get_chat_member(chat_id, user_id).await {
            Ok(status) if !status.is_present() => {
                debug!(user_id, "member already gone, skipping ban call");
                return;
            }
            Ok(_) => {}
            // Ban anyway when the lookup fails; the call is idempotent on
            // the platform side.
            Err(e) => warn!(user_id, error = %e, "member lookup failed before ban"),
        }

        match self
            .messaging
            .execute_or_enqueue(DeferredOp::BanChatMember { chat_id, user_id })
            .await
        {
            Ok(()) => {
                if let Err(e) = self.store.set_user_status(user_id, UserStatus::Banned).await {
                    error!(user_id, error = %e, "failed to record banned status");
                }
                self.log_funnel(
                    FunnelEventKind::AutoBanned,
                    user_id,
                    serde_json::json!({ "subscription_id": subscription_id }),
                )
                .await;
            }
            Err(e) => error!(user_id, error = %e, "ban call failed"),
        }
    }

    /// Sends at most one expiry reminder per non-recurring subscription in
    /// the lead window.
    pub async fn run_reminder_pass(&self, now: OffsetDateTime) -> CoreResult<ReminderSummary> {
        let mut summary = ReminderSummary::default();
        let expiring = self
            .store
            .find_expiring_soon(now, self.config.reminder_lead())
            .await?;

        for sub in expiring {
            let text = texts::renewal_reminder(
                sub.expires_at,
                self.config.plan_stars,
                self.config.plan_days,
            );
            match self
                .messaging
                .execute_or_enqueue(DeferredOp::SendMessage {
                    chat_id: sub.user_id,
                    text,
                })
                .await
            {
                Ok(()) => {
                    self.store.mark_reminder_sent(sub.id, now).await?;
                    self.log_funnel(
                        FunnelEventKind::ReminderSent,
                        sub.user_id,
                        serde_json::json!({ "expires_at": sub.expires_at.unix_timestamp() }),
                    )
                    .await;
                    summary.sent += 1;
                }
                Err(e) => {
                    warn!(user_id = sub.user_id, error = %e, "reminder not delivered");
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Decides a pending join request: subscribers and whitelist holders
    /// get a seat, everyone else is declined and sent the paywall.
    pub async fn handle_join_request(
        &self,
        profile: &UserProfile,
        now: OffsetDateTime,
    ) -> CoreResult<JoinDecision> {
        let user_id = profile.user_id;
        self.store.upsert_user(profile).await?;
        let chat_id = self.config.group_chat_id;

        if self.store.is_whitelisted(user_id).await? {
            // Single-use: the entry is consumed by the join it admits.
            self.store
                .revoke_whitelist(user_id, "used for join", now)
                .await?;
            self.log_funnel(
                FunnelEventKind::WhitelistRevoked,
                user_id,
                serde_json::json!({ "reason": "used for join" }),
            )
            .await;
            self.messaging
                .execute_or_enqueue(DeferredOp::ApproveJoinRequest { chat_id, user_id })
                .await?;
            info!(user_id, "join approved from whitelist");
            return Ok(JoinDecision::ApprovedWhitelist);
        }

        if let Some(sub) = self.store.subscription_for_user(user_id).await? {
            if sub.status.has_access() {
                self.messaging
                    .execute_or_enqueue(DeferredOp::ApproveJoinRequest { chat_id, user_id })
                    .await?;
                info!(user_id, status = %sub.status, "join approved for subscriber");
                return Ok(JoinDecision::ApprovedSubscriber);
            }
        }

        let (one_time, subscription) = self.paywall_links().await?;
        let text = texts::paywall(
            &one_time,
            &subscription,
            self.config.plan_stars,
            self.config.sub_stars,
        );
        if let Err(e) = self
            .messaging
            .execute_or_enqueue(DeferredOp::SendMessage {
                chat_id: user_id,
                text,
            })
            .await
        {
            info!(user_id, error = %e, "paywall message not delivered");
        }
        match self.messaging.decline_join_request(chat_id, user_id).await {
            Ok(()) => {}
            Err(CoreError::Permanent(reason)) => {
                debug!(user_id, reason = %reason, "decline skipped");
            }
            Err(e) => warn!(user_id, error = %e, "decline failed"),
        }
        info!(user_id, "join declined, paywall sent");
        Ok(JoinDecision::DeclinedPaywalled)
    }

    /// Fresh invoice links for the one-time plan and the monthly
    /// subscription.
    pub async fn paywall_links(&self) -> CoreResult<(String, String)> {
        let one_time = self
            .messaging
            .create_invoice_link(&InvoiceSpec {
                title: "Group access".to_string(),
                description: format!("{} days of group access", self.config.plan_days),
                payload: PAYLOAD_ONE_TIME.to_string(),
                amount: self.config.plan_stars,
                subscription_period_secs: None,
            })
            .await?;
        let subscription = self
            .messaging
            .create_invoice_link(&InvoiceSpec {
                title: "Group access subscription".to_string(),
                description: "Monthly group access, renews automatically".to_string(),
                payload: PAYLOAD_SUBSCRIPTION.to_string(),
                amount: self.config.sub_stars,
                subscription_period_secs: Some(SUBSCRIPTION_PERIOD_SECS),
            })
            .await?;
        Ok((one_time, subscription))
    }

    /// Reacts to the platform reporting a member gone: consumes any
    /// whitelist entry and, for a ban, marks the user and their current
    /// subscription banned.
    pub async fn handle_member_departure(
        &self,
        user_id: TelegramId,
        was_banned: bool,
        now: OffsetDateTime,
    ) -> CoreResult<()> {
        if self
            .store
            .revoke_whitelist(user_id, "left group", now)
            .await?
        {
            self.log_funnel(
                FunnelEventKind::WhitelistRevoked,
                user_id,
                serde_json::json!({ "reason": "left group" }),
            )
            .await;
        }

        if was_banned {
            self.store.set_user_status(user_id, UserStatus::Banned).await?;
            self.store.mark_banned(user_id, now).await?;
        }

        self.log_funnel(
            FunnelEventKind::MemberLeft,
            user_id,
            serde_json::json!({ "was_banned": was_banned }),
        )
        .await;
        info!(user_id, was_banned, "member departure recorded");
        Ok(())
    }

    /// Disables auto-renewal; access runs to the end of the paid period.
    pub async fn cancel_subscription(
        &self,
        user_id: TelegramId,
        now: OffsetDateTime,
    ) -> CoreResult<bool> {
        if !self.store.cancel_auto_renew(user_id, now).await? {
            return Ok(false);
        }
        info!(user_id, "auto-renewal cancelled");
        if let Some(sub) = self.store.subscription_for_user(user_id).await? {
            let text = format!(
                "Auto-renewal is off. Your access runs until {}.",
                texts::human_date(sub.expires_at)
            );
            if let Err(e) = self
                .messaging
                .execute_or_enqueue(DeferredOp::SendMessage {
                    chat_id: user_id,
                    text,
                })
                .await
            {
                info!(user_id, error = %e, "cancellation notice not delivered");
            }
        }
        Ok(true)
    }

    /// Grants ban protection. Idempotent: re-granting reactivates a revoked
    /// entry.
    pub async fn grant_whitelist(
        &self,
        telegram_id: TelegramId,
        source: &str,
        note: Option<&str>,
        now: OffsetDateTime,
    ) -> CoreResult<()> {
        self.store
            .grant_whitelist(telegram_id, source, note, now)
            .await?;
        self.log_funnel(
            FunnelEventKind::WhitelistGranted,
            telegram_id,
            serde_json::json!({ "source": source }),
        )
        .await;
        Ok(())
    }

    /// Seeds whitelist entries in bulk, e.g. from a member export. Returns
    /// the number granted.
    pub async fn seed_whitelist(
        &self,
        telegram_ids: &[TelegramId],
        now: OffsetDateTime,
    ) -> CoreResult<usize> {
        let mut granted = 0;
        for &id in telegram_ids {
            self.grant_whitelist(id, "seed", None, now).await?;
            granted += 1;
        }
        info!(granted, "whitelist seeded");
        Ok(granted)
    }

    /// Admin revocation with a reason. Returns false when no active entry
    /// existed.
    pub async fn revoke_whitelist(
        &self,
        telegram_id: TelegramId,
        reason: &str,
        now: OffsetDateTime,
    ) -> CoreResult<bool> {
        if !self.store.revoke_whitelist(telegram_id, reason, now).await? {
            return Ok(false);
        }
        self.log_funnel(
            FunnelEventKind::WhitelistRevoked,
            telegram_id,
            serde_json::json!({ "reason": reason }),
        )
        .await;
        Ok(true)
    }

    pub async fn whitelist_status(
        &self,
        telegram_id: TelegramId,
    ) -> CoreResult<Option<WhitelistEntry>> {
        self.store.whitelist_entry(telegram_id).await
    }

    async fn log_funnel(
        &self,
        kind: FunnelEventKind,
        user_id: TelegramId,
        details: serde_json::Value,
    ) {
        if let Err(e) = self.store.log_event(kind, Some(user_id), details).await {
            error!(user_id, event = %kind, error = %e, "funnel log failed");
        }
    }
}
