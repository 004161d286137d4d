//! Reconciliation against the provider's transaction ledger.
//!
//! The ingestion path can miss payments (delivery outage, crash
//! mid-request). This job re-derives them: it pages through the provider's
//! Stars transaction history over a sliding window, applies anything the
//! payment ledger does not already know, and advances a persisted cursor.
//! The design is at-least-once with idempotent apply: re-scanning overlap
//! is normal and duplicates die at the ledger's uniqueness constraint.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};

use doorman_shared::{Config, PaymentKind};

use crate::error::CoreResult;
use crate::ingest::{IngestSource, PaymentIngestor};
use crate::messaging::ResilientMessaging;
use crate::store::LedgerStore;
use crate::types::{FunnelEventKind, PaymentEvent};

const PAGE_LIMIT: u32 = 100;

/// Counters from one reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Transactions examined across all pages.
    pub scanned: usize,
    /// Payments recovered and applied.
    pub applied: usize,
    /// Transactions already present in the ledger.
    pub duplicates: usize,
    /// Out-of-window, unattributable, or garbled entries.
    pub skipped: usize,
    pub errors: usize,
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
    pub cursor_advanced: bool,
}

pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
    messaging: Arc<ResilientMessaging>,
    ingestor: Arc<PaymentIngestor>,
    config: Arc<Config>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        messaging: Arc<ResilientMessaging>,
        ingestor: Arc<PaymentIngestor>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            messaging,
            ingestor,
            config,
        }
    }

    /// One reconciliation pass over `[cursor − window, now]`.
    ///
    /// A paging failure stops the run cleanly: progress made so far stands,
    /// the cursor advances only over what was actually enumerated, and the
    /// next scheduled run re-covers the rest through the overlap.
    pub async fn run(&self, now: OffsetDateTime) -> CoreResult<ReconcileSummary> {
        let window = self.config.reconcile_window();
        let cursor = self.store.get_or_init_cursor(now - window).await?;
        let from = cursor.last_tx_at - window;
        let to = now;

        info!(from = %from, to = %to, "reconciliation started");

        // One query builds the duplicate set for the whole run; the extra
        // day absorbs clock skew between provider and ledger timestamps.
        let known = self
            .store
            .known_external_tx_ids(from - Duration::days(1))
            .await?;

        let mut summary = ReconcileSummary {
            scanned: 0,
            applied: 0,
            duplicates: 0,
            skipped: 0,
            errors: 0,
            from,
            to,
            cursor_advanced: false,
        };
        let mut offset: u32 = 0;
        let mut window_max: Option<(OffsetDateTime, String)> = None;

        loop {
            let page = match self.messaging.get_star_transactions(offset, PAGE_LIMIT).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(offset, error = %e, "transaction page fetch failed, stopping run");
                    summary.errors += 1;
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            let page_len = page.len();

            for tx in page {
                summary.scanned += 1;

                let Some(at) = tx.occurred_at() else {
                    warn!(tx_id = %tx.id, "transaction with unusable timestamp skipped");
                    summary.skipped += 1;
                    continue;
                };
                if at < from || at > to {
                    summary.skipped += 1;
                    continue;
                }

                // Duplicates still move the cursor: they prove the range
                // was enumerated.
                if window_max.as_ref().is_none_or(|(max_at, _)| at > *max_at) {
                    window_max = Some((at, tx.id.clone()));
                }

                if known.contains(&tx.id) {
                    summary.duplicates += 1;
                    continue;
                }
                let Some(user_id) = tx.source_user_id else {
                    summary.skipped += 1;
                    continue;
                };

                let event = PaymentEvent {
                    user_id,
                    charge_id: None,
                    star_tx_id: Some(tx.id.clone()),
                    amount: tx.amount,
                    kind: PaymentKind::RecurringRenewal,
                    is_recurring: true,
                    invoice_payload: None,
                    explicit_expiry: None,
                };
                match self
                    .ingestor
                    .ingest(&event, None, IngestSource::Reconcile, now)
                    .await
                {
                    Ok(outcome) if outcome.is_duplicate() => summary.duplicates += 1,
                    Ok(_) => {
                        info!(user_id, tx_id = %tx.id, amount = tx.amount, "missed payment recovered");
                        summary.applied += 1;
                    }
                    Err(e) => {
                        error!(user_id, tx_id = %tx.id, error = %e, "reconciled transaction failed to apply");
                        summary.errors += 1;
                    }
                }
            }

            if page_len < PAGE_LIMIT as usize {
                break;
            }
            offset += page_len as u32;
        }

        if let Some((max_at, max_id)) = window_max {
            self.store.advance_cursor(max_at, &max_id).await?;
            summary.cursor_advanced = true;
        }

        if let Err(e) = self
            .store
            .log_event(
                FunnelEventKind::ReconcileComplete,
                None,
                serde_json::json!({
                    "processed": summary.scanned,
                    "new_payments": summary.applied,
                    "from": from.unix_timestamp(),
                    "to": to.unix_timestamp(),
                }),
            )
            .await
        {
            error!(error = %e, "funnel log failed");
        }

        info!(
            scanned = summary.scanned,
            applied = summary.applied,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            errors = summary.errors,
            "reconciliation complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    use doorman_shared::SubscriptionStatus;

    use crate::messaging::ExternalTransaction;
    use crate::test_support::{engine_fixture, paid_event, EngineFixture};

    fn tx(id: &str, at: OffsetDateTime, user: i64) -> ExternalTransaction {
        ExternalTransaction {
            id: id.to_string(),
            timestamp_unix: at.unix_timestamp(),
            amount: 449,
            source_user_id: Some(user),
        }
    }

    async fn seed_tx(fx: &EngineFixture, t: ExternalTransaction) {
        fx.client.transactions.lock().await.push(t);
    }

    #[tokio::test]
    async fn recovers_a_missed_payment() {
        let fx = engine_fixture();
        let now = datetime!(2025-03-10 12:00 UTC);
        seed_tx(&fx, tx("tx_1", now - Duration::days(1), 7)).await;

        let summary = fx.reconciler.run(now).await.unwrap();

        assert_eq!(summary.applied, 1);
        assert_eq!(summary.duplicates, 0);
        assert!(summary.cursor_advanced);

        let sub = fx.store.subscription_for_user(7).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.is_recurring);
        // Spec extension rule, anchored at the run, not the charge.
        assert_eq!(sub.expires_at, now + fx.config.plan_duration());
        assert_eq!(
            fx.store.events_of(FunnelEventKind::ReconcileApplied).await.len(),
            1
        );
        assert_eq!(
            fx.store.events_of(FunnelEventKind::ReconcileComplete).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn known_transactions_are_not_applied_twice() {
        let fx = engine_fixture();
        let now = datetime!(2025-03-10 12:00 UTC);
        let charge_at = now - Duration::days(1);

        // The live path already ingested this charge.
        let mut event = paid_event(7, "ch_1");
        event.star_tx_id = Some("tx_1".into());
        fx.ingestor
            .ingest(&event, None, crate::ingest::IngestSource::Direct, charge_at)
            .await
            .unwrap();
        seed_tx(&fx, tx("tx_1", charge_at, 7)).await;

        let summary = fx.reconciler.run(now).await.unwrap();

        assert_eq!(summary.applied, 0);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(fx.store.payment_count().await, 1);
        // Dedup still advances the cursor over the enumerated range.
        assert!(summary.cursor_advanced);
        let cursor = fx.store.get_or_init_cursor(now).await.unwrap();
        assert_eq!(cursor.last_tx_at, charge_at);
    }

    #[tokio::test]
    async fn entries_outside_the_window_are_skipped() {
        let fx = engine_fixture();
        let now = datetime!(2025-03-10 12:00 UTC);
        // First run scans [now - 2*window, now].
        let ancient = now - fx.config.reconcile_window() * 2 - Duration::days(1);
        seed_tx(&fx, tx("tx_old", ancient, 7)).await;
        seed_tx(&fx, tx("tx_future", now + Duration::hours(1), 8)).await;

        let summary = fx.reconciler.run(now).await.unwrap();

        assert_eq!(summary.applied, 0);
        assert_eq!(summary.skipped, 2);
        assert!(!summary.cursor_advanced);
        assert!(fx.store.subscription_for_user(7).await.unwrap().is_none());
        assert!(fx.store.subscription_for_user(8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unattributable_entries_are_skipped() {
        let fx = engine_fixture();
        let now = datetime!(2025-03-10 12:00 UTC);
        let mut refund = tx("tx_refund", now - Duration::days(1), 0);
        refund.source_user_id = None;
        seed_tx(&fx, refund).await;

        let summary = fx.reconciler.run(now).await.unwrap();

        assert_eq!(summary.applied, 0);
        assert_eq!(summary.skipped, 1);
        // Enumerated entries advance the cursor even when skipped for
        // attribution.
        assert!(summary.cursor_advanced);
    }

    #[tokio::test]
    async fn pages_through_the_full_history() {
        let fx = engine_fixture();
        let now = datetime!(2025-03-10 12:00 UTC);
        for i in 0..250 {
            let at = now - Duration::days(2) + Duration::minutes(i);
            seed_tx(&fx, tx(&format!("tx_{i}"), at, 1000 + i)).await;
        }

        let summary = fx.reconciler.run(now).await.unwrap();

        assert_eq!(summary.scanned, 250);
        assert_eq!(summary.applied, 250);
        // Cursor lands on the newest charge.
        let cursor = fx.store.get_or_init_cursor(now).await.unwrap();
        assert_eq!(
            cursor.last_tx_at,
            now - Duration::days(2) + Duration::minutes(249)
        );
        assert_eq!(cursor.last_tx_id.as_deref(), Some("tx_249"));
    }

    #[tokio::test]
    async fn paging_failure_keeps_partial_progress() {
        let fx = engine_fixture();
        let now = datetime!(2025-03-10 12:00 UTC);
        for i in 0..150 {
            let at = now - Duration::days(2) + Duration::minutes(i);
            seed_tx(&fx, tx(&format!("tx_{i}"), at, 1000 + i)).await;
        }
        fx.client.fail_page_at(100).await;

        let summary = fx.reconciler.run(now).await.unwrap();

        assert_eq!(summary.applied, 100);
        assert_eq!(summary.errors, 1);
        // Cursor covers only the enumerated first page.
        let cursor = fx.store.get_or_init_cursor(now).await.unwrap();
        assert_eq!(
            cursor.last_tx_at,
            now - Duration::days(2) + Duration::minutes(99)
        );

        // The next run picks up the rest through the overlap.
        fx.client.clear_page_failures().await;
        let second = fx.reconciler.run(now + Duration::minutes(5)).await.unwrap();
        assert_eq!(second.applied, 50);
        assert_eq!(second.duplicates, 100);
    }

    #[tokio::test]
    async fn cursor_never_moves_backward() {
        let fx = engine_fixture();
        let now = datetime!(2025-03-10 12:00 UTC);
        seed_tx(&fx, tx("tx_new", now - Duration::hours(1), 7)).await;
        fx.reconciler.run(now).await.unwrap();
        let after_first = fx.store.get_or_init_cursor(now).await.unwrap();

        // A later run that only sees older in-window entries must not
        // rewind the cursor.
        seed_tx(&fx, tx("tx_older", now - Duration::days(2), 8)).await;
        fx.reconciler.run(now + Duration::minutes(10)).await.unwrap();

        let after_second = fx.store.get_or_init_cursor(now).await.unwrap();
        assert_eq!(after_second.last_tx_at, after_first.last_tx_at);
    }

    #[tokio::test]
    async fn recovered_payment_rescues_a_grace_row() {
        let fx = engine_fixture();
        let t0 = datetime!(2025-03-01 00:00 UTC);
        fx.ingestor
            .ingest(&paid_event(7, "ch_1"), None, crate::ingest::IngestSource::Direct, t0)
            .await
            .unwrap();
        let expires = fx
            .store
            .subscription_for_user(7)
            .await
            .unwrap()
            .unwrap()
            .expires_at;

        // Expiry passes, the sweep parks the row in grace, and the renewal
        // charge only surfaces via the provider ledger.
        fx.lifecycle
            .run_state_sweep(expires + Duration::hours(1))
            .await
            .unwrap();
        seed_tx(&fx, tx("tx_renewal", expires + Duration::minutes(30), 7)).await;

        let run_at = expires + Duration::hours(2);
        let summary = fx.reconciler.run(run_at).await.unwrap();
        assert_eq!(summary.applied, 1);

        let sub = fx.store.subscription_for_user(7).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.grace_until, None);
        assert_eq!(sub.expires_at, run_at + fx.config.plan_duration());
    }
}
