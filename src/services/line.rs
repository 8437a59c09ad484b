//! LINE Messaging API adapter.
//!
//! Inbound: webhook signature check and the subset of the webhook event model
//! the bot reacts to (text and location messages from users).
//! Outbound: reply (by reply token) and push (by user id).
//! See: https://developers.line.biz/en/reference/messaging-api/

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

use crate::errors::AppError;

/// Request timeout for the Messaging API.
const LINE_TIMEOUT_SECS: u64 = 10;

/// Extra push attempts after a transport error or 5xx.
const PUSH_MAX_RETRIES: u32 = 2;

/// Delay between push attempts (milliseconds).
const PUSH_RETRY_DELAY_MS: u64 = 500;

/// Outbound push primitive used by the scheduler.
#[async_trait]
pub trait PushSink: Send + Sync {
    async fn push(&self, user_id: &str, text: &str) -> Result<(), AppError>;
}

/// Verify `X-Line-Signature`: base64 HMAC-SHA256 of the raw body keyed with
/// the channel secret.
pub fn verify_signature(channel_secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = BASE64.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(channel_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

// --- Webhook event model ---

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WebhookEvent {
    Message {
        #[serde(rename = "replyToken")]
        reply_token: String,
        source: EventSource,
        message: MessageContent,
    },
    /// Follow, postback, beacon, ...
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct EventSource {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
    /// Stickers, images, ...
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct ReplyRequest<'a> {
    #[serde(rename = "replyToken")]
    reply_token: &'a str,
    messages: [TextMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    messages: [TextMessage<'a>; 1],
}

fn text_message(text: &str) -> [TextMessage<'_>; 1] {
    [TextMessage { kind: "text", text }]
}

// --- Client ---

/// Client for the LINE Messaging API.
#[derive(Debug, Clone)]
pub struct LineClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

/// Outcome of one HTTP attempt.
enum Attempt {
    Sent,
    Retryable(String),
    Fatal(String),
}

impl LineClient {
    pub fn new(base_url: &str, access_token: &str) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LINE_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::InternalError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }

    /// Answer an inbound event. Reply tokens are single-use, so no retry.
    pub async fn reply(&self, reply_token: &str, text: &str) -> Result<(), AppError> {
        let body = ReplyRequest {
            reply_token,
            messages: text_message(text),
        };
        match self.post("/v2/bot/message/reply", &body).await {
            Attempt::Sent => Ok(()),
            Attempt::Retryable(msg) | Attempt::Fatal(msg) => Err(AppError::MessagingError(msg)),
        }
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Attempt {
        let url = format!("{}{}", self.base_url, path);
        let response = match self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return Attempt::Retryable(format!("LINE request failed: {}", e)),
        };

        let status = response.status();
        if status.is_success() {
            return Attempt::Sent;
        }
        let text = response.text().await.unwrap_or_default();
        let msg = format!("LINE returned HTTP {}: {}", status, text);
        if status.is_server_error() {
            Attempt::Retryable(msg)
        } else {
            Attempt::Fatal(msg)
        }
    }
}

#[async_trait]
impl PushSink for LineClient {
    async fn push(&self, user_id: &str, text: &str) -> Result<(), AppError> {
        let body = PushRequest {
            to: user_id,
            messages: text_message(text),
        };

        let mut attempt = 0;
        loop {
            match self.post("/v2/bot/message/push", &body).await {
                Attempt::Sent => return Ok(()),
                Attempt::Fatal(msg) => return Err(AppError::MessagingError(msg)),
                Attempt::Retryable(msg) if attempt >= PUSH_MAX_RETRIES => {
                    return Err(AppError::MessagingError(msg))
                }
                Attempt::Retryable(msg) => {
                    attempt += 1;
                    tracing::debug!(
                        "Push to {} failed ({}), retry {}/{}",
                        user_id,
                        msg,
                        attempt,
                        PUSH_MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_millis(PUSH_RETRY_DELAY_MS)).await;
                }
            }
        }
    }
}
