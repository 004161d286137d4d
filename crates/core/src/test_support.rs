//! In-memory doubles for service tests: a [`MemoryLedger`] implementing
//! the store trait with the same semantics as the Postgres implementation,
//! and a [`RecordingClient`] that captures outbound platform calls.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use doorman_shared::{Config, PaymentKind, SubscriptionStatus, TelegramId, UserStatus};

use crate::digest::DigestService;
use crate::error::{CoreError, CoreResult};
use crate::ingest::PaymentIngestor;
use crate::lifecycle::LifecycleService;
use crate::machine;
use crate::messaging::{
    ChatMemberStatus, ExternalTransaction, InvoiceSpec, MessagingClient, ResilientMessaging,
};
use crate::reconcile::Reconciler;
use crate::resilience::ResilienceContext;
use crate::store::LedgerStore;
use crate::types::{
    FunnelEventKind, IngestOutcome, LedgerStats, Payment, PaymentEvent, ReconcileCursor,
    Subscription, User, UserProfile, WhitelistEntry,
};

pub fn test_config() -> Config {
    Config {
        bot_token: "12345:TEST".to_string(),
        group_chat_id: -1_001_234_567_890,
        owner_ids: vec![1],
        database_url: "postgres://localhost/doorman_test".to_string(),
        plan_stars: 499,
        sub_stars: 449,
        plan_days: 30,
        grace_hours: 48,
        grace_debounce_minutes: 60,
        reconcile_window_days: 3,
        days_before_expire: 3,
        queue_max_size: 1000,
        queue_max_attempts: 3,
        // High limits keep test loops out of the bucket.
        rate_limit_per_sec: 5000.0,
        rate_limit_burst: 5000.0,
        api_timeout_secs: 10,
    }
}

pub fn paid_event(user_id: i64, charge_id: &str) -> PaymentEvent {
    PaymentEvent {
        user_id,
        charge_id: Some(charge_id.to_string()),
        star_tx_id: None,
        amount: 499,
        kind: PaymentKind::OneTime,
        is_recurring: false,
        invoice_payload: Some("plan:one_time".to_string()),
        explicit_expiry: None,
    }
}

#[derive(Debug, Clone)]
pub struct LoggedEvent {
    pub kind: FunnelEventKind,
    pub user_id: Option<TelegramId>,
    pub details: serde_json::Value,
}

#[derive(Default)]
struct LedgerInner {
    users: HashMap<TelegramId, User>,
    subs: Vec<Subscription>,
    payments: Vec<Payment>,
    whitelist: HashMap<TelegramId, WhitelistEntry>,
    events: Vec<LoggedEvent>,
    cursor: Option<ReconcileCursor>,
}

/// In-memory [`LedgerStore`] mirroring the SQL implementation's semantics,
/// including the duplicate guard, the stacking expiry rule, and the
/// monotonic cursor.
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<LedgerInner>,
}

impl MemoryLedger {
    fn latest_sub_idx(inner: &LedgerInner, user_id: TelegramId) -> Option<usize> {
        inner
            .subs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.user_id == user_id)
            .max_by_key(|(_, s)| (s.created_at, s.updated_at))
            .map(|(i, _)| i)
    }

    // --- Inspection helpers for tests ---

    pub async fn events_of(&self, kind: FunnelEventKind) -> Vec<LoggedEvent> {
        self.inner
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub async fn payment_count(&self) -> usize {
        self.inner.lock().await.payments.len()
    }

    pub async fn subscription_count(&self, user_id: TelegramId) -> usize {
        self.inner
            .lock()
            .await
            .subs
            .iter()
            .filter(|s| s.user_id == user_id)
            .count()
    }

    pub async fn user_status(&self, user_id: TelegramId) -> Option<UserStatus> {
        self.inner
            .lock()
            .await
            .users
            .get(&user_id)
            .map(|u| u.status)
    }

    pub async fn force_status(&self, subscription_id: Uuid, status: SubscriptionStatus) {
        let mut inner = self.inner.lock().await;
        if let Some(sub) = inner.subs.iter_mut().find(|s| s.id == subscription_id) {
            sub.status = status;
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn upsert_user(&self, profile: &UserProfile) -> CoreResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock().await;
        match inner.users.get_mut(&profile.user_id) {
            Some(user) => {
                user.username.clone_from(&profile.username);
                user.first_name.clone_from(&profile.first_name);
                user.last_name.clone_from(&profile.last_name);
                user.language_code.clone_from(&profile.language_code);
                user.last_seen_at = now;
            }
            None => {
                inner.users.insert(
                    profile.user_id,
                    User {
                        user_id: profile.user_id,
                        username: profile.username.clone(),
                        first_name: profile.first_name.clone(),
                        last_name: profile.last_name.clone(),
                        language_code: profile.language_code.clone(),
                        status: UserStatus::Active,
                        last_seen_at: now,
                        created_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn set_user_status(&self, user_id: TelegramId, status: UserStatus) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.status = status;
        }
        Ok(())
    }

    async fn apply_payment(
        &self,
        event: &PaymentEvent,
        now: OffsetDateTime,
        plan: time::Duration,
    ) -> CoreResult<IngestOutcome> {
        let mut inner = self.inner.lock().await;

        let duplicate = inner.payments.iter().any(|p| {
            (event.charge_id.is_some() && p.charge_id == event.charge_id)
                || (event.star_tx_id.is_some() && p.star_tx_id == event.star_tx_id)
        });
        if duplicate {
            return Ok(IngestOutcome::Duplicate);
        }

        let latest = Self::latest_sub_idx(&inner, event.user_id);
        let subscription = match latest {
            Some(i) if inner.subs[i].status.has_access() => {
                let sub = &mut inner.subs[i];
                sub.expires_at = machine::activation_expiry(
                    Some(sub.expires_at),
                    now,
                    plan,
                    event.explicit_expiry,
                );
                sub.status = SubscriptionStatus::Active;
                sub.is_recurring = event.is_recurring;
                sub.grace_until = None;
                sub.grace_started_at = None;
                sub.reminder_sent_at = None;
                sub.cancelled_at = None;
                sub.updated_at = now;
                sub.clone()
            }
            // Terminal or missing history: a fresh row keeps the
            // one-active-row invariant and the audit trail.
            _ => {
                let sub = Subscription {
                    id: Uuid::new_v4(),
                    user_id: event.user_id,
                    status: SubscriptionStatus::Active,
                    is_recurring: event.is_recurring,
                    expires_at: machine::activation_expiry(None, now, plan, event.explicit_expiry),
                    grace_until: None,
                    grace_started_at: None,
                    cancelled_at: None,
                    reminder_sent_at: None,
                    created_at: now,
                    updated_at: now,
                };
                inner.subs.push(sub.clone());
                sub
            }
        };

        let payment = Payment {
            id: Uuid::new_v4(),
            user_id: event.user_id,
            charge_id: event.charge_id.clone(),
            star_tx_id: event.star_tx_id.clone(),
            amount: event.amount,
            kind: event.kind,
            is_recurring: event.is_recurring,
            invoice_payload: event.invoice_payload.clone(),
            subscription_id: Some(subscription.id),
            created_at: now,
        };
        inner.payments.push(payment.clone());

        Ok(IngestOutcome::Applied {
            payment,
            subscription,
        })
    }

    async fn known_external_tx_ids(&self, since: OffsetDateTime) -> CoreResult<HashSet<String>> {
        Ok(self
            .inner
            .lock()
            .await
            .payments
            .iter()
            .filter(|p| p.created_at >= since)
            .filter_map(|p| p.star_tx_id.clone())
            .collect())
    }

    async fn subscription_for_user(
        &self,
        user_id: TelegramId,
    ) -> CoreResult<Option<Subscription>> {
        let inner = self.inner.lock().await;
        Ok(Self::latest_sub_idx(&inner, user_id).map(|i| inner.subs[i].clone()))
    }

    async fn find_due_for_grace(
        &self,
        now: OffsetDateTime,
        debounce: time::Duration,
    ) -> CoreResult<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .await
            .subs
            .iter()
            .filter(|s| machine::due_for_grace(s, now, debounce))
            .cloned()
            .collect())
    }

    async fn begin_grace(
        &self,
        subscription_id: Uuid,
        grace_until: OffsetDateTime,
        now: OffsetDateTime,
    ) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.subs.iter_mut().find(|s| s.id == subscription_id) {
            Some(sub) if sub.status == SubscriptionStatus::Active => {
                sub.status = SubscriptionStatus::Grace;
                sub.grace_until = Some(grace_until);
                sub.grace_started_at = Some(now);
                sub.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_due_for_expiry(&self, now: OffsetDateTime) -> CoreResult<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .await
            .subs
            .iter()
            .filter(|s| machine::due_for_expiry(s, now))
            .cloned()
            .collect())
    }

    async fn mark_expired(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.subs.iter_mut().find(|s| s.id == subscription_id) {
            Some(sub) if sub.status == SubscriptionStatus::Grace => {
                sub.status = SubscriptionStatus::Expired;
                sub.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_expiring_soon(
        &self,
        now: OffsetDateTime,
        lead: time::Duration,
    ) -> CoreResult<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .await
            .subs
            .iter()
            .filter(|s| machine::due_for_reminder(s, now, lead))
            .cloned()
            .collect())
    }

    async fn mark_reminder_sent(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(sub) = inner.subs.iter_mut().find(|s| s.id == subscription_id) {
            sub.reminder_sent_at = Some(now);
            sub.updated_at = now;
        }
        Ok(())
    }

    async fn cancel_auto_renew(
        &self,
        user_id: TelegramId,
        now: OffsetDateTime,
    ) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(i) = Self::latest_sub_idx(&inner, user_id) else {
            return Ok(false);
        };
        let sub = &mut inner.subs[i];
        if sub.status == SubscriptionStatus::Active && sub.is_recurring {
            sub.is_recurring = false;
            sub.cancelled_at = Some(now);
            sub.updated_at = now;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn mark_banned(&self, user_id: TelegramId, now: OffsetDateTime) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(i) = Self::latest_sub_idx(&inner, user_id) else {
            return Ok(false);
        };
        let sub = &mut inner.subs[i];
        if sub.status.has_access() {
            sub.status = SubscriptionStatus::Banned;
            sub.updated_at = now;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn grant_whitelist(
        &self,
        telegram_id: TelegramId,
        source: &str,
        note: Option<&str>,
        now: OffsetDateTime,
    ) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.whitelist.get_mut(&telegram_id) {
            Some(entry) => {
                entry.revoked_at = None;
                entry.source = source.to_string();
                if let Some(note) = note {
                    entry.note = Some(note.to_string());
                }
            }
            None => {
                inner.whitelist.insert(
                    telegram_id,
                    WhitelistEntry {
                        telegram_id,
                        source: source.to_string(),
                        note: note.map(String::from),
                        granted_at: now,
                        revoked_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn revoke_whitelist(
        &self,
        telegram_id: TelegramId,
        reason: &str,
        now: OffsetDateTime,
    ) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.whitelist.get_mut(&telegram_id) {
            Some(entry) if entry.revoked_at.is_none() => {
                entry.revoked_at = Some(now);
                entry.note = Some(match entry.note.take() {
                    Some(existing) => format!("{existing} - {reason}"),
                    None => reason.to_string(),
                });
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_whitelisted(&self, telegram_id: TelegramId) -> CoreResult<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .whitelist
            .get(&telegram_id)
            .is_some_and(|e| e.revoked_at.is_none()))
    }

    async fn whitelist_entry(
        &self,
        telegram_id: TelegramId,
    ) -> CoreResult<Option<WhitelistEntry>> {
        Ok(self.inner.lock().await.whitelist.get(&telegram_id).cloned())
    }

    async fn log_event(
        &self,
        kind: FunnelEventKind,
        user_id: Option<TelegramId>,
        details: serde_json::Value,
    ) -> CoreResult<()> {
        self.inner.lock().await.events.push(LoggedEvent {
            kind,
            user_id,
            details,
        });
        Ok(())
    }

    async fn get_or_init_cursor(
        &self,
        default_start: OffsetDateTime,
    ) -> CoreResult<ReconcileCursor> {
        let mut inner = self.inner.lock().await;
        let cursor = inner.cursor.get_or_insert_with(|| ReconcileCursor {
            last_tx_at: default_start,
            last_tx_id: None,
            updated_at: OffsetDateTime::now_utc(),
        });
        Ok(cursor.clone())
    }

    async fn advance_cursor(
        &self,
        last_tx_at: OffsetDateTime,
        last_tx_id: &str,
    ) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        match &mut inner.cursor {
            Some(cursor) => {
                if last_tx_at > cursor.last_tx_at {
                    cursor.last_tx_at = last_tx_at;
                }
                cursor.last_tx_id = Some(last_tx_id.to_string());
                cursor.updated_at = OffsetDateTime::now_utc();
            }
            None => {
                inner.cursor = Some(ReconcileCursor {
                    last_tx_at,
                    last_tx_id: Some(last_tx_id.to_string()),
                    updated_at: OffsetDateTime::now_utc(),
                });
            }
        }
        Ok(())
    }

    async fn stats(&self, now: OffsetDateTime) -> CoreResult<LedgerStats> {
        let inner = self.inner.lock().await;
        let day_ago = now - time::Duration::days(1);
        let month_ago = now - time::Duration::days(30);
        Ok(LedgerStats {
            total_users: inner.users.len() as i64,
            active_users_24h: inner
                .users
                .values()
                .filter(|u| u.last_seen_at >= day_ago)
                .count() as i64,
            new_signups_today: inner
                .users
                .values()
                .filter(|u| u.created_at.date() == now.date())
                .count() as i64,
            active_subs: inner
                .subs
                .iter()
                .filter(|s| s.status == SubscriptionStatus::Active)
                .count() as i64,
            grace_subs: inner
                .subs
                .iter()
                .filter(|s| s.status == SubscriptionStatus::Grace)
                .count() as i64,
            recurring_subs: inner
                .subs
                .iter()
                .filter(|s| s.status == SubscriptionStatus::Active && s.is_recurring)
                .count() as i64,
            revenue_24h: inner
                .payments
                .iter()
                .filter(|p| p.created_at >= day_ago)
                .map(|p| p.amount)
                .sum(),
            revenue_30d: inner
                .payments
                .iter()
                .filter(|p| p.created_at >= month_ago)
                .map(|p| p.amount)
                .sum(),
            payments_24h: inner.payments.iter().filter(|p| p.created_at >= day_ago).count()
                as i64,
        })
    }
}

/// Captures every outbound call; `set_healthy(false)` makes mutating calls
/// fail with a short rate-limit hint so retry loops stay fast in tests.
pub struct RecordingClient {
    healthy: AtomicBool,
    pub sent: Mutex<Vec<(i64, String)>>,
    pub approved: Mutex<Vec<i64>>,
    pub declined: Mutex<Vec<i64>>,
    pub banned: Mutex<Vec<i64>>,
    pub transactions: Mutex<Vec<ExternalTransaction>>,
    member_statuses: Mutex<HashMap<i64, ChatMemberStatus>>,
    failing_pages: Mutex<HashSet<u32>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            approved: Mutex::new(Vec::new()),
            declined: Mutex::new(Vec::new()),
            banned: Mutex::new(Vec::new()),
            transactions: Mutex::new(Vec::new()),
            member_statuses: Mutex::new(HashMap::new()),
            failing_pages: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub async fn set_member_status(&self, user_id: i64, status: ChatMemberStatus) {
        self.member_statuses.lock().await.insert(user_id, status);
    }

    pub async fn fail_page_at(&self, offset: u32) {
        self.failing_pages.lock().await.insert(offset);
    }

    pub async fn clear_page_failures(&self) {
        self.failing_pages.lock().await.clear();
    }

    fn gate(&self) -> CoreResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::rate_limited(
                "throttled",
                StdDuration::from_millis(5),
            ))
        }
    }
}

#[async_trait]
impl MessagingClient for RecordingClient {
    async fn send_message(&self, chat_id: i64, text: &str) -> CoreResult<()> {
        self.gate()?;
        self.sent.lock().await.push((chat_id, text.to_string()));
        Ok(())
    }

    async fn approve_join_request(&self, _chat_id: i64, user_id: i64) -> CoreResult<()> {
        self.gate()?;
        self.approved.lock().await.push(user_id);
        Ok(())
    }

    async fn decline_join_request(&self, _chat_id: i64, user_id: i64) -> CoreResult<()> {
        self.gate()?;
        self.declined.lock().await.push(user_id);
        Ok(())
    }

    async fn get_chat_member(
        &self,
        _chat_id: i64,
        user_id: i64,
    ) -> CoreResult<ChatMemberStatus> {
        self.gate()?;
        Ok(self
            .member_statuses
            .lock()
            .await
            .get(&user_id)
            .copied()
            .unwrap_or(ChatMemberStatus::Member))
    }

    async fn ban_chat_member(&self, _chat_id: i64, user_id: i64) -> CoreResult<()> {
        self.gate()?;
        self.banned.lock().await.push(user_id);
        Ok(())
    }

    async fn create_invoice_link(&self, invoice: &InvoiceSpec) -> CoreResult<String> {
        self.gate()?;
        Ok(format!("https://t.me/$/{}", invoice.payload))
    }

    async fn get_star_transactions(
        &self,
        offset: u32,
        limit: u32,
    ) -> CoreResult<Vec<ExternalTransaction>> {
        self.gate()?;
        if self.failing_pages.lock().await.contains(&offset) {
            // Permanent so the retry loop exits immediately in tests.
            return Err(CoreError::Permanent("page fetch failed".to_string()));
        }
        let transactions = self.transactions.lock().await;
        let start = offset as usize;
        if start >= transactions.len() {
            return Ok(Vec::new());
        }
        let end = (start + limit as usize).min(transactions.len());
        Ok(transactions[start..end].to_vec())
    }
}

pub struct EngineFixture {
    pub config: Arc<Config>,
    pub store: Arc<MemoryLedger>,
    pub client: Arc<RecordingClient>,
    pub messaging: Arc<ResilientMessaging>,
    pub ingestor: Arc<PaymentIngestor>,
    pub lifecycle: LifecycleService,
    pub reconciler: Reconciler,
    pub digest: DigestService,
}

pub fn engine_fixture() -> EngineFixture {
    let config = Arc::new(test_config());
    let store: Arc<MemoryLedger> = Arc::new(MemoryLedger::default());
    let client = Arc::new(RecordingClient::new());
    let context = Arc::new(ResilienceContext::new(&config));
    let messaging = Arc::new(ResilientMessaging::new(
        client.clone(),
        context,
        config.queue_max_size,
        config.queue_max_attempts,
    ));
    let ingestor = Arc::new(PaymentIngestor::new(
        store.clone(),
        messaging.clone(),
        config.clone(),
    ));
    let lifecycle = LifecycleService::new(store.clone(), messaging.clone(), config.clone());
    let reconciler = Reconciler::new(
        store.clone(),
        messaging.clone(),
        ingestor.clone(),
        config.clone(),
    );
    let digest = DigestService::new(store.clone(), messaging.clone(), config.clone());

    EngineFixture {
        config,
        store,
        client,
        messaging,
        ingestor,
        lifecycle,
        reconciler,
        digest,
    }
}
