//! LINE webhook endpoint.
//!
//! POST /callback: signed event batch from the LINE platform. Text messages
//! are answered through the intent responder; location messages update the
//! sender's stored location.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use std::sync::Arc;

use crate::errors::{AppError, ErrorResponse};
use crate::services::line::{
    verify_signature, LineClient, MessageContent, WebhookEvent, WebhookPayload,
};
use crate::services::registry::UserRegistry;
use crate::services::responder::{IntentResponder, ReplyStatus};
use crate::store::models::{Location, SettingUpdate};

const SIGNATURE_HEADER: &str = "x-line-signature";

const LOCATION_SAVED_TEXT: &str = "位置情報を設定しました！\n「傘いる？」と聞いてみてください。";
const SAVE_FAILED_TEXT: &str = "すいません...\n設定を保存できませんでした。";

/// Shared application state for the webhook.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) registry: UserRegistry,
    pub(crate) responder: Arc<IntentResponder>,
    pub(crate) line: LineClient,
    pub(crate) channel_secret: Arc<str>,
}

/// Reply owed to one inbound event.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct OutgoingReply {
    pub(crate) reply_token: String,
    pub(crate) text: String,
}

/// Receive LINE webhook events.
///
/// Rejects the batch with 400 when the signature does not match the raw
/// body or the body is not a webhook payload. Reply failures are logged per
/// event and do not fail the request.
#[utoipa::path(
    post,
    path = "/callback",
    tag = "Webhook",
    params(
        ("X-Line-Signature" = String, Header, description = "Base64 HMAC-SHA256 of the body keyed with the channel secret"),
    ),
    request_body(content = String, description = "LINE webhook payload", content_type = "application/json"),
    responses(
        (status = 200, description = "Events accepted", body = String),
        (status = 400, description = "Bad signature or malformed payload", body = ErrorResponse),
    )
)]
pub async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("missing X-Line-Signature header".to_string()))?;

    if !verify_signature(&state.channel_secret, &body, signature) {
        tracing::warn!("Webhook: rejected request with invalid signature");
        return Err(AppError::BadRequest("invalid signature".to_string()));
    }

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("malformed webhook body: {}", e)))?;
    tracing::debug!("Webhook: {} event(s)", payload.events.len());

    for event in payload.events {
        let Some(reply) = handle_event(&state.registry, &state.responder, event).await else {
            continue;
        };
        if let Err(e) = state.line.reply(&reply.reply_token, &reply.text).await {
            tracing::warn!("Webhook: reply failed: {}", e);
        }
    }

    Ok("OK")
}

/// Apply one event to the registry and work out the reply, if any.
pub(crate) async fn handle_event(
    registry: &UserRegistry,
    responder: &IntentResponder,
    event: WebhookEvent,
) -> Option<OutgoingReply> {
    let WebhookEvent::Message {
        reply_token,
        source,
        message,
    } = event
    else {
        return None;
    };
    let user_id = source.user_id.unwrap_or_default();
    tracing::debug!("Webhook: message from {:?}", user_id);

    let text = match message {
        MessageContent::Text { text } => {
            let location = registry.get(&user_id).await.and_then(|s| s.location);
            let reply = responder.respond(&text, location).await;
            match reply.status {
                ReplyStatus::ScheduleSet(schedule) => {
                    store(registry, &user_id, SettingUpdate::schedule(schedule), reply.text).await
                }
                _ => reply.text,
            }
        }
        MessageContent::Location {
            latitude,
            longitude,
        } => {
            let location = Location {
                latitude,
                longitude,
            };
            store(
                registry,
                &user_id,
                SettingUpdate::location(location),
                LOCATION_SAVED_TEXT.to_string(),
            )
            .await
        }
        MessageContent::Unsupported => return None,
    };

    Some(OutgoingReply { reply_token, text })
}

/// Upsert `update` and return `confirmation`, or the save-failure text when
/// nothing was stored.
async fn store(
    registry: &UserRegistry,
    user_id: &str,
    update: SettingUpdate,
    confirmation: String,
) -> String {
    match registry.upsert(user_id, update).await {
        Ok(_) => confirmation,
        Err(e) => {
            tracing::error!("Failed to store setting for {:?}: {}", user_id, e);
            SAVE_FAILED_TEXT.to_string()
        }
    }
}
