// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Doorman Core
//!
//! Subscription lifecycle and reconciliation engine for a payment-gated
//! Telegram group.
//!
//! ## Features
//!
//! - **Payment Ingestion**: Idempotent application of Stars payments from
//!   direct bot updates and from ledger reconciliation
//! - **Lifecycle Sweeps**: Overdue subscriptions enter a grace window, then
//!   expire; expired members are removed unless whitelisted
//! - **Reconciliation**: Paged scan of the provider's transaction history
//!   behind a persistent cursor, recovering payments missed while offline
//! - **Renewal Reminders**: Pre-expiry notices with a resend gate
//! - **Whitelist**: Permanent and single-use passes that bypass the paywall
//! - **Resilience**: Per-operation circuit breakers, retry with jittered
//!   backoff, rate limiting, and a deferred-operation queue
//! - **Daily Digest**: Owner-facing summary of users, revenue, and funnel

pub mod digest;
pub mod error;
pub mod ingest;
pub mod lifecycle;
pub mod machine;
pub mod messaging;
pub mod reconcile;
pub mod resilience;
pub mod store;
pub mod telegram;
pub mod texts;
pub mod types;

#[cfg(test)]
mod test_support;

// Digest
pub use digest::{DigestService, DigestSummary};

// Error
pub use error::{CoreError, CoreResult};

// Ingest
pub use ingest::{IngestSource, PaymentIngestor};

// Lifecycle
pub use lifecycle::{JoinDecision, LifecycleService, ReminderSummary, SweepSummary};

// Machine
pub use machine::LifecycleEvent;

// Messaging
pub use messaging::{
    ChatMemberStatus, DeferredOp, ExternalTransaction, InvoiceSpec, MessagingClient,
    ResilientMessaging,
};

// Reconcile
pub use reconcile::{ReconcileSummary, Reconciler};

// Resilience
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, DrainSummary, MessagingOp, OpProfile,
    OperationQueue, RateLimiter, ResilienceContext, RetryPolicy,
};

// Store
pub use store::LedgerStore;

// Telegram
pub use telegram::TelegramClient;

// Types
pub use types::{
    FunnelEventKind, IngestOutcome, LedgerStats, Payment, PaymentEvent, ReconcileCursor,
    Subscription, User, UserProfile, WhitelistEntry,
};

use std::sync::Arc;

use doorman_shared::Config;

/// Main engine that combines all lifecycle functionality
pub struct Engine {
    pub config: Arc<Config>,
    pub store: Arc<dyn LedgerStore>,
    pub messaging: Arc<ResilientMessaging>,
    pub ingest: Arc<PaymentIngestor>,
    pub lifecycle: LifecycleService,
    pub reconcile: Reconciler,
    pub digest: DigestService,
}

impl Engine {
    /// Wire the full engine over a ledger store and a platform client.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn LedgerStore>,
        client: Arc<dyn MessagingClient>,
    ) -> Self {
        let context = Arc::new(ResilienceContext::new(&config));
        let messaging = Arc::new(ResilientMessaging::new(
            client,
            context,
            config.queue_max_size,
            config.queue_max_attempts,
        ));
        let ingest = Arc::new(PaymentIngestor::new(
            store.clone(),
            messaging.clone(),
            config.clone(),
        ));

        Self {
            lifecycle: LifecycleService::new(store.clone(), messaging.clone(), config.clone()),
            reconcile: Reconciler::new(
                store.clone(),
                messaging.clone(),
                ingest.clone(),
                config.clone(),
            ),
            digest: DigestService::new(store.clone(), messaging.clone(), config.clone()),
            config,
            store,
            messaging,
            ingest,
        }
    }

    /// Replay operations parked while the platform was unreachable.
    /// Returns `None` when a drain is already in flight.
    pub async fn drain_operation_queue(&self) -> Option<DrainSummary> {
        self.messaging.drain_deferred().await
    }
}
