//! Daily owner digest.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};

use doorman_shared::Config;

use crate::error::CoreResult;
use crate::messaging::{DeferredOp, ResilientMessaging};
use crate::store::LedgerStore;
use crate::texts;
use crate::types::LedgerStats;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DigestSummary {
    pub owners_notified: usize,
    pub errors: usize,
}

pub struct DigestService {
    store: Arc<dyn LedgerStore>,
    messaging: Arc<ResilientMessaging>,
    config: Arc<Config>,
}

impl DigestService {
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

    /// Computes the day's counters and sends them to every owner.
    pub async fn send_daily_digest(&self, now: OffsetDateTime) -> CoreResult<DigestSummary> {
        let stats = self.store.stats(now).await?;
        let text = texts::daily_digest(&stats, self.monthly_recurring_revenue(&stats), now);

        let mut summary = DigestSummary::default();
        for &owner in &self.config.owner_ids {
            match self
                .messaging
                .execute_or_enqueue(DeferredOp::SendMessage {
                    chat_id: owner,
                    text: text.clone(),
                })
                .await
            {
                Ok(()) => summary.owners_notified += 1,
                Err(e) => {
                    warn!(owner, error = %e, "digest not delivered");
                    summary.errors += 1;
                }
            }
        }
        info!(
            owners = summary.owners_notified,
            active_subs = stats.active_subs,
            revenue_24h = stats.revenue_24h,
            "daily digest sent"
        );
        Ok(summary)
    }

    /// Recurring subscriptions priced at the monthly rate.
    fn monthly_recurring_revenue(&self, stats: &LedgerStats) -> i64 {
        stats.recurring_subs * self.config.sub_stars
    }
}
