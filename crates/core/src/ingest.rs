//! Payment ingestion.
//!
//! Both intake paths (live payment updates and the reconciliation sweep)
//! funnel through [`PaymentIngestor::ingest`]. The ledger write is atomic
//! and idempotent; everything after it (funnel logging, join approval, the
//! confirmation message) is best-effort and can never undo a recorded
//! payment.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, error, info};

use doorman_shared::Config;

use crate::error::{CoreError, CoreResult};
use crate::messaging::{DeferredOp, ResilientMessaging};
use crate::store::LedgerStore;
use crate::texts;
use crate::types::{FunnelEventKind, IngestOutcome, PaymentEvent, Subscription, UserProfile};

/// Where a payment event came from. Decides the funnel event written for
/// an applied payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
    /// A live payment update from the transport.
    Direct,
    /// A charge recovered from the provider ledger by reconciliation.
    Reconcile,
}

impl IngestSource {
    fn funnel_event(&self) -> FunnelEventKind {
        match self {
            IngestSource::Direct => FunnelEventKind::PaymentReceived,
            IngestSource::Reconcile => FunnelEventKind::ReconcileApplied,
        }
    }
}

pub struct PaymentIngestor {
    store: Arc<dyn LedgerStore>,
    messaging: Arc<ResilientMessaging>,
    config: Arc<Config>,
}

impl PaymentIngestor {
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

    /// Records a payment and activates the subscription it pays for.
    ///
    /// Replays of an already-recorded charge return
    /// [`IngestOutcome::Duplicate`] without touching anything. Malformed
    /// events fail validation before any write. When `profile` is absent
    /// (reconciled charges carry no profile) a minimal user row is ensured
    /// so the payment has somewhere to hang.
    pub async fn ingest(
        &self,
        event: &PaymentEvent,
        profile: Option<&UserProfile>,
        source: IngestSource,
        now: OffsetDateTime,
    ) -> CoreResult<IngestOutcome> {
        validate(event)?;

        let fallback = UserProfile {
            user_id: event.user_id,
            ..UserProfile::default()
        };
        self.store
            .upsert_user(profile.unwrap_or(&fallback))
            .await?;

        let outcome = self
            .store
            .apply_payment(event, now, self.config.plan_duration())
            .await?;

        match &outcome {
            IngestOutcome::Duplicate => {
                debug!(
                    user_id = event.user_id,
                    charge_id = event.charge_id.as_deref().unwrap_or("-"),
                    star_tx_id = event.star_tx_id.as_deref().unwrap_or("-"),
                    "duplicate payment ignored"
                );
            }
            IngestOutcome::Applied {
                payment,
                subscription,
            } => {
                info!(
                    user_id = event.user_id,
                    amount = event.amount,
                    kind = %event.kind,
                    expires_at = %subscription.expires_at,
                    "payment applied"
                );
                if let Err(e) = self
                    .store
                    .log_event(
                        source.funnel_event(),
                        Some(event.user_id),
                        serde_json::json!({
                            "payment_id": payment.id,
                            "amount": event.amount,
                            "kind": event.kind.as_str(),
                            "is_recurring": event.is_recurring,
                        }),
                    )
                    .await
                {
                    error!(user_id = event.user_id, error = %e, "funnel log failed");
                }
                self.grant_access(subscription).await;
            }
        }
        Ok(outcome)
    }

    /// Post-commit side effects: approve a pending join request and confirm
    /// the payment. Unreachable-platform failures are parked on the queue;
    /// nothing here propagates an error.
    async fn grant_access(&self, subscription: &Subscription) {
        let user_id = subscription.user_id;

        match self
            .messaging
            .execute_or_enqueue(DeferredOp::ApproveJoinRequest {
                chat_id: self.config.group_chat_id,
                user_id,
            })
            .await
        {
            Ok(()) => {}
            // Usually "no pending join request": the user is already in the
            // group and just renewed.
            Err(CoreError::Permanent(reason)) => {
                debug!(user_id, reason = %reason, "join approval skipped");
            }
            Err(e) => error!(user_id, error = %e, "join approval failed"),
        }

        let text = texts::payment_confirmed(subscription.expires_at, subscription.is_recurring);
        if let Err(e) = self
            .messaging
            .execute_or_enqueue(DeferredOp::SendMessage {
                chat_id: user_id,
                text,
            })
            .await
        {
            info!(user_id, error = %e, "payment confirmation not delivered");
        }
    }
}

fn validate(event: &PaymentEvent) -> CoreResult<()> {
    if event.user_id <= 0 {
        return Err(CoreError::Validation(format!(
            "invalid payer id {}",
            event.user_id
        )));
    }
    if event.amount <= 0 {
        return Err(CoreError::Validation(format!(
            "non-positive payment amount {}",
            event.amount
        )));
    }
    if event.charge_id.is_none() && event.star_tx_id.is_none() {
        return Err(CoreError::Validation(
            "payment carries no provider identifier".to_string(),
        ));
    }
    Ok(())
}
