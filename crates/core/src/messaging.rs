//! Transport seam and the resilient wrapper around it.
//!
//! [`MessagingClient`] is the narrow surface the engine needs from the chat
//! platform. The real implementation lives in [`crate::telegram`]; tests
//! substitute an in-memory double. [`ResilientMessaging`] wraps any client
//! with the per-operation breakers, retries, and the deferred-operation
//! queue from [`crate::resilience`].

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::resilience::{DrainSummary, MessagingOp, OperationQueue, ResilienceContext};

/// Membership standing of a user inside the managed group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
}

impl ChatMemberStatus {
    /// Whether the user currently occupies a seat in the group.
    pub fn is_present(&self) -> bool {
        matches!(
            self,
            ChatMemberStatus::Creator
                | ChatMemberStatus::Administrator
                | ChatMemberStatus::Member
                | ChatMemberStatus::Restricted
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creator" => Some(ChatMemberStatus::Creator),
            "administrator" => Some(ChatMemberStatus::Administrator),
            "member" => Some(ChatMemberStatus::Member),
            "restricted" => Some(ChatMemberStatus::Restricted),
            "left" => Some(ChatMemberStatus::Left),
            "kicked" => Some(ChatMemberStatus::Kicked),
            _ => None,
        }
    }
}

/// A charge observed on the provider's transaction ledger, as returned by
/// the paged history endpoint during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTransaction {
    /// Provider-assigned transaction id.
    pub id: String,
    /// Unix timestamp of the charge.
    pub timestamp_unix: i64,
    /// Amount in Stars.
    pub amount: i64,
    /// Paying user, when the provider exposes one. Refunds and platform
    /// entries do not.
    pub source_user_id: Option<i64>,
}

impl ExternalTransaction {
    /// Charge time as a timestamp, `None` when the provider sent garbage.
    pub fn occurred_at(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.timestamp_unix).ok()
    }
}

/// Invoice parameters for the payment provider.
#[derive(Debug, Clone)]
pub struct InvoiceSpec {
    pub title: String,
    pub description: String,
    /// Opaque payload echoed back on payment.
    pub payload: String,
    /// Price in Stars.
    pub amount: i64,
    /// Renewal period in seconds for subscription invoices, `None` for
    /// one-time purchases.
    pub subscription_period_secs: Option<u32>,
}

/// Everything the engine asks of the chat platform.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> CoreResult<()>;
    async fn approve_join_request(&self, chat_id: i64, user_id: i64) -> CoreResult<()>;
    async fn decline_join_request(&self, chat_id: i64, user_id: i64) -> CoreResult<()>;
    async fn get_chat_member(&self, chat_id: i64, user_id: i64)
        -> CoreResult<ChatMemberStatus>;
    async fn ban_chat_member(&self, chat_id: i64, user_id: i64) -> CoreResult<()>;
    async fn create_invoice_link(&self, invoice: &InvoiceSpec) -> CoreResult<String>;
    /// One page of the provider's transaction history, oldest first within
    /// the page.
    async fn get_star_transactions(
        &self,
        offset: u32,
        limit: u32,
    ) -> CoreResult<Vec<ExternalTransaction>>;
}

/// A platform call that may be executed later if it cannot run now.
/// Notifications and bans qualify; reads and invoice creation do not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredOp {
    SendMessage { chat_id: i64, text: String },
    ApproveJoinRequest { chat_id: i64, user_id: i64 },
    BanChatMember { chat_id: i64, user_id: i64 },
}

/// [`MessagingClient`] wrapped in the full resilience stack. Strict methods
/// surface the final error; [`ResilientMessaging::execute_or_enqueue`]
/// additionally parks deferrable work on the queue when the platform is
/// unreachable.
pub struct ResilientMessaging {
    client: Arc<dyn MessagingClient>,
    context: Arc<ResilienceContext>,
    queue: OperationQueue<DeferredOp>,
}

impl ResilientMessaging {
    pub fn new(
        client: Arc<dyn MessagingClient>,
        context: Arc<ResilienceContext>,
        queue_max_size: usize,
        queue_max_attempts: u32,
    ) -> Self {
        Self {
            client,
            context,
            queue: OperationQueue::new(queue_max_size, queue_max_attempts),
        }
    }

    pub async fn queued_ops(&self) -> usize {
        self.queue.len().await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> CoreResult<()> {
        self.context
            .run(MessagingOp::SendMessage, || {
                self.client.send_message(chat_id, text)
            })
            .await
    }

    pub async fn approve_join_request(&self, chat_id: i64, user_id: i64) -> CoreResult<()> {
        self.context
            .run(MessagingOp::ApproveJoinRequest, || {
                self.client.approve_join_request(chat_id, user_id)
            })
            .await
    }

    pub async fn decline_join_request(&self, chat_id: i64, user_id: i64) -> CoreResult<()> {
        self.context
            .run(MessagingOp::DeclineJoinRequest, || {
                self.client.decline_join_request(chat_id, user_id)
            })
            .await
    }

    pub async fn get_chat_member(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> CoreResult<ChatMemberStatus> {
        self.context
            .run(MessagingOp::GetChatMember, || {
                self.client.get_chat_member(chat_id, user_id)
            })
            .await
    }

    pub async fn ban_chat_member(&self, chat_id: i64, user_id: i64) -> CoreResult<()> {
        self.context
            .run(MessagingOp::BanChatMember, || {
                self.client.ban_chat_member(chat_id, user_id)
            })
            .await
    }

    pub async fn create_invoice_link(&self, invoice: &InvoiceSpec) -> CoreResult<String> {
        self.context
            .run(MessagingOp::SendInvoice, || {
                self.client.create_invoice_link(invoice)
            })
            .await
    }

    pub async fn get_star_transactions(
        &self,
        offset: u32,
        limit: u32,
    ) -> CoreResult<Vec<ExternalTransaction>> {
        self.context
            .run(MessagingOp::GetStarTransactions, || {
                self.client.get_star_transactions(offset, limit)
            })
            .await
    }

    /// Runs a deferred operation through the strict path.
    pub async fn execute(&self, op: &DeferredOp) -> CoreResult<()> {
        match op {
            DeferredOp::SendMessage { chat_id, text } => {
                self.send_message(*chat_id, text).await
            }
            DeferredOp::ApproveJoinRequest { chat_id, user_id } => {
                self.approve_join_request(*chat_id, *user_id).await
            }
            DeferredOp::BanChatMember { chat_id, user_id } => {
                self.ban_chat_member(*chat_id, *user_id).await
            }
        }
    }

    /// Runs `op` now; if the platform is unreachable (transient failure
    /// after retries, or an open breaker), parks it on the queue and
    /// reports success. Permanent errors are returned to the caller.
    pub async fn execute_or_enqueue(&self, op: DeferredOp) -> CoreResult<()> {
        match self.execute(&op).await {
            Ok(()) => Ok(()),
            Err(err) if is_deferrable(&err) => {
                warn!(op = ?op, error = %err, "platform unreachable, deferring operation");
                self.queue.push(op).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// One pass over the deferred queue. `None` when a drain is already
    /// running.
    pub async fn drain_deferred(&self) -> Option<DrainSummary> {
        self.queue.drain(|op| async move { self.execute(&op).await }).await
    }
}

fn is_deferrable(err: &CoreError) -> bool {
    err.is_transient() || matches!(err, CoreError::CircuitOpen(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    use crate::test_support::test_config;

    /// Client double whose sends fail with a short rate-limit hint while
    /// `healthy` is false. The hint keeps retry sleeps in the millisecond
    /// range.
    struct FlakyClient {
        healthy: AtomicBool,
        sent: Mutex<Vec<(i64, String)>>,
        banned: Mutex<Vec<i64>>,
    }

    impl FlakyClient {
        fn new(healthy: bool) -> Self {
            Self {
                healthy: AtomicBool::new(healthy),
                sent: Mutex::new(Vec::new()),
                banned: Mutex::new(Vec::new()),
            }
        }

        fn gate(&self) -> CoreResult<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(CoreError::rate_limited(
                    "throttled",
                    Duration::from_millis(5),
                ))
            }
        }
    }

    #[async_trait]
    impl MessagingClient for FlakyClient {
        async fn send_message(&self, chat_id: i64, text: &str) -> CoreResult<()> {
            self.gate()?;
            self.sent.lock().await.push((chat_id, text.to_string()));
            Ok(())
        }

        async fn approve_join_request(&self, _chat_id: i64, _user_id: i64) -> CoreResult<()> {
            self.gate()
        }

        async fn decline_join_request(&self, _chat_id: i64, _user_id: i64) -> CoreResult<()> {
            self.gate()
        }

        async fn get_chat_member(
            &self,
            _chat_id: i64,
            _user_id: i64,
        ) -> CoreResult<ChatMemberStatus> {
            self.gate()?;
            Ok(ChatMemberStatus::Member)
        }

        async fn ban_chat_member(&self, _chat_id: i64, user_id: i64) -> CoreResult<()> {
            self.gate()?;
            self.banned.lock().await.push(user_id);
            Ok(())
        }

        async fn create_invoice_link(&self, invoice: &InvoiceSpec) -> CoreResult<String> {
            self.gate()?;
            Ok(format!("https://t.me/invoice/{}", invoice.payload))
        }

        async fn get_star_transactions(
            &self,
            _offset: u32,
            _limit: u32,
        ) -> CoreResult<Vec<ExternalTransaction>> {
            self.gate()?;
            Ok(Vec::new())
        }
    }

    fn wrap(client: Arc<FlakyClient>) -> ResilientMessaging {
        let config = test_config();
        ResilientMessaging::new(
            client,
            Arc::new(ResilienceContext::new(&config)),
            config.queue_max_size,
            config.queue_max_attempts,
        )
    }

    #[tokio::test]
    async fn unreachable_platform_defers_the_operation() {
        let client = Arc::new(FlakyClient::new(false));
        let messaging = wrap(client.clone());

        messaging
            .execute_or_enqueue(DeferredOp::SendMessage {
                chat_id: 10,
                text: "grace started".into(),
            })
            .await
            .unwrap();

        assert_eq!(messaging.queued_ops().await, 1);
        assert!(client.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn drain_executes_deferred_operations_once_healthy() {
        let client = Arc::new(FlakyClient::new(false));
        let messaging = wrap(client.clone());

        messaging
            .execute_or_enqueue(DeferredOp::SendMessage {
                chat_id: 10,
                text: "hello".into(),
            })
            .await
            .unwrap();
        messaging
            .execute_or_enqueue(DeferredOp::BanChatMember {
                chat_id: -100,
                user_id: 42,
            })
            .await
            .unwrap();

        client.healthy.store(true, Ordering::SeqCst);
        let summary = messaging.drain_deferred().await.unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(messaging.queued_ops().await, 0);
        assert_eq!(client.sent.lock().await.as_slice(), &[(10, "hello".into())]);
        assert_eq!(client.banned.lock().await.as_slice(), &[42]);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_deferred() {
        struct BlockedClient;

        #[async_trait]
        impl MessagingClient for BlockedClient {
            async fn send_message(&self, _chat_id: i64, _text: &str) -> CoreResult<()> {
                Err(CoreError::Permanent("bot blocked by user".into()))
            }
            async fn approve_join_request(&self, _c: i64, _u: i64) -> CoreResult<()> {
                unimplemented!()
            }
            async fn decline_join_request(&self, _c: i64, _u: i64) -> CoreResult<()> {
                unimplemented!()
            }
            async fn get_chat_member(&self, _c: i64, _u: i64) -> CoreResult<ChatMemberStatus> {
                unimplemented!()
            }
            async fn ban_chat_member(&self, _c: i64, _u: i64) -> CoreResult<()> {
                unimplemented!()
            }
            async fn create_invoice_link(&self, _i: &InvoiceSpec) -> CoreResult<String> {
                unimplemented!()
            }
            async fn get_star_transactions(
                &self,
                _o: u32,
                _l: u32,
            ) -> CoreResult<Vec<ExternalTransaction>> {
                unimplemented!()
            }
        }

        let config = test_config();
        let messaging = ResilientMessaging::new(
            Arc::new(BlockedClient),
            Arc::new(ResilienceContext::new(&config)),
            config.queue_max_size,
            config.queue_max_attempts,
        );

        let result = messaging
            .execute_or_enqueue(DeferredOp::SendMessage {
                chat_id: 10,
                text: "hello".into(),
            })
            .await;

        assert!(matches!(result, Err(CoreError::Permanent(_))));
        assert_eq!(messaging.queued_ops().await, 0);
    }

    #[test]
    fn transaction_timestamps_parse() {
        let tx = ExternalTransaction {
            id: "tx_1".into(),
            timestamp_unix: 1_735_689_600,
            amount: 499,
            source_user_id: Some(7),
        };
        assert_eq!(
            tx.occurred_at().unwrap(),
            time::macros::datetime!(2025-01-01 00:00 UTC)
        );

        let bad = ExternalTransaction {
            timestamp_unix: i64::MAX,
            ..tx
        };
        assert!(bad.occurred_at().is_none());
    }

    #[test]
    fn member_status_presence() {
        assert!(ChatMemberStatus::Member.is_present());
        assert!(ChatMemberStatus::Restricted.is_present());
        assert!(!ChatMemberStatus::Left.is_present());
        assert!(!ChatMemberStatus::Kicked.is_present());
        assert_eq!(
            ChatMemberStatus::parse("kicked"),
            Some(ChatMemberStatus::Kicked)
        );
        assert_eq!(ChatMemberStatus::parse("unknown"), None);
    }
}
