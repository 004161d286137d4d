//! Telegram Bot API client.
//!
//! Thin JSON client over the handful of methods the engine uses. Every
//! response is classified onto the error taxonomy here so the resilience
//! layer never needs to know about HTTP: 429 becomes a transient error
//! carrying the exact `retry_after`, 5xx and network failures are
//! transient, 4xx are permanent.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::messaging::{
    ChatMemberStatus, ExternalTransaction, InvoiceSpec, MessagingClient,
};

const DEFAULT_API_ROOT: &str = "https://api.telegram.org";

/// Stars invoices always use this currency code.
const STARS_CURRENCY: &str = "XTR";

pub struct TelegramClient {
    http: reqwest::Client,
    api_root: String,
    token: String,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>, timeout: Duration) -> CoreResult<Self> {
        Self::with_api_root(token, timeout, DEFAULT_API_ROOT)
    }

    /// Point the client at a self-hosted Bot API server.
    pub fn with_api_root(
        token: impl Into<String>,
        timeout: Duration,
        api_root: impl Into<String>,
    ) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            api_root: api_root.into(),
            token: token.into(),
        })
    }

    async fn call<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: &str,
        body: &B,
    ) -> CoreResult<T> {
        debug!(method, "telegram api call");
        let url = format!("{}/bot{}/{}", self.api_root, self.token, method);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("telegram request failed: {e}")))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoreError::transient(format!("telegram response read failed: {e}")))?;

        // Telegram wraps errors in the same envelope as results, so parse
        // the body before looking at the HTTP status.
        let envelope: ApiResponse<T> = serde_json::from_slice(&bytes).map_err(|e| {
            CoreError::transient(format!(
                "telegram response parse failed (status {status}): {e}"
            ))
        })?;

        if envelope.ok {
            return envelope
                .result
                .ok_or_else(|| CoreError::transient("telegram response missing result"));
        }

        let description = envelope
            .description
            .unwrap_or_else(|| "no description".to_string());
        match envelope.error_code {
            Some(429) => {
                let retry_after = envelope
                    .parameters
                    .and_then(|p| p.retry_after)
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::from_secs(1));
                Err(CoreError::rate_limited(
                    format!("telegram rate limit: {description}"),
                    retry_after,
                ))
            }
            Some(code) if (500..600).contains(&code) => Err(CoreError::transient(format!(
                "telegram server error {code}: {description}"
            ))),
            Some(code) => Err(CoreError::Permanent(format!(
                "telegram error {code}: {description}"
            ))),
            None => Err(CoreError::transient(format!(
                "telegram error without code: {description}"
            ))),
        }
    }
}

#[async_trait]
impl MessagingClient for TelegramClient {
    async fn send_message(&self, chat_id: i64, text: &str) -> CoreResult<()> {
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                &json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "HTML",
                }),
            )
            .await?;
        Ok(())
    }

    async fn approve_join_request(&self, chat_id: i64, user_id: i64) -> CoreResult<()> {
        let _: bool = self
            .call(
                "approveChatJoinRequest",
                &json!({ "chat_id": chat_id, "user_id": user_id }),
            )
            .await?;
        Ok(())
    }

    async fn decline_join_request(&self, chat_id: i64, user_id: i64) -> CoreResult<()> {
        let _: bool = self
            .call(
                "declineChatJoinRequest",
                &json!({ "chat_id": chat_id, "user_id": user_id }),
            )
            .await?;
        Ok(())
    }

    async fn get_chat_member(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> CoreResult<ChatMemberStatus> {
        let member: RawChatMember = self
            .call(
                "getChatMember",
                &json!({ "chat_id": chat_id, "user_id": user_id }),
            )
            .await?;
        ChatMemberStatus::parse(&member.status).ok_or_else(|| {
            CoreError::Permanent(format!("unexpected member status '{}'", member.status))
        })
    }

    async fn ban_chat_member(&self, chat_id: i64, user_id: i64) -> CoreResult<()> {
        let _: bool = self
            .call(
                "banChatMember",
                &json!({ "chat_id": chat_id, "user_id": user_id }),
            )
            .await?;
        Ok(())
    }

    async fn create_invoice_link(&self, invoice: &InvoiceSpec) -> CoreResult<String> {
        let mut body = json!({
            "title": invoice.title,
            "description": invoice.description,
            "payload": invoice.payload,
            "currency": STARS_CURRENCY,
            "prices": [{ "label": invoice.title, "amount": invoice.amount }],
        });
        if let Some(period) = invoice.subscription_period_secs {
            body["subscription_period"] = json!(period);
        }
        self.call("createInvoiceLink", &body).await
    }

    async fn get_star_transactions(
        &self,
        offset: u32,
        limit: u32,
    ) -> CoreResult<Vec<ExternalTransaction>> {
        let page: RawStarTransactions = self
            .call(
                "getStarTransactions",
                &json!({ "offset": offset, "limit": limit }),
            )
            .await?;
        Ok(page
            .transactions
            .into_iter()
            .map(|tx| ExternalTransaction {
                id: tx.id,
                timestamp_unix: tx.date,
                amount: tx.amount,
                source_user_id: tx.source.and_then(|p| p.user.map(|u| u.id)),
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i32>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawChatMember {
    status: String,
}

#[derive(Debug, Deserialize)]
struct RawStarTransactions {
    transactions: Vec<RawStarTransaction>,
}

/// Incoming entries carry a `source` partner; outgoing (refunds, payouts)
/// carry `receiver` instead, which deserializes here with `source: None`.
#[derive(Debug, Deserialize)]
struct RawStarTransaction {
    id: String,
    amount: i64,
    date: i64,
    source: Option<RawTransactionPartner>,
}

#[derive(Debug, Deserialize)]
struct RawTransactionPartner {
    user: Option<RawPartnerUser>,
}

#[derive(Debug, Deserialize)]
struct RawPartnerUser {
    id: i64,
}
