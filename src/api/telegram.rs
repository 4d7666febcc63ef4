//! Telegram callback verifier (shared-secret-header provider).
//!
//! Authentication: `X-Telegram-Bot-Api-Secret-Token` compared against
//! the configured webhook secret in constant time. The update carries a
//! `callback_query` whose data is `approve:<id>` or `reject:<id>`.
//! Acknowledgement answers the callback query and edits the original
//! message to strip the buttons.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::api::{apply_callback, AppState, Outcome};
use crate::errors::AppError;
use crate::middleware::rate_limit;
use crate::models::approval::CallbackAction;
use crate::notification::redact_credentials;

const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Debug, Deserialize)]
struct Update {
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    from: TelegramUser,
    #[serde(default)]
    message: Option<CallbackMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackMessage {
    message_id: i64,
    chat: Chat,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

pub async fn handle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, AppError> {
    let store = state.store()?;
    rate_limit::check(store, &headers).await?;

    let secret = state
        .secrets
        .telegram_webhook_secret
        .as_deref()
        .ok_or(AppError::MissingSecret("TELEGRAM_WEBHOOK_SECRET"))?;
    verify_secret_token(secret, &headers)?;

    let update: Update = serde_json::from_str(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid update: {e}")))?;
    let query = update
        .callback_query
        .ok_or_else(|| AppError::BadRequest("update has no callback_query".into()))?;
    let data = query
        .data
        .as_deref()
        .ok_or_else(|| AppError::BadRequest("callback_query has no data".into()))?;
    let (action, request_id) = parse_callback_data(data)?;
    let actor = derive_handle(&query.from);

    let result = apply_callback(&state, action, request_id, &actor).await;

    match result {
        Ok(Outcome::Resolved { row, action, actor }) => {
            let emoji = match action {
                CallbackAction::Approve => "\u{2705}",
                CallbackAction::Reject => "\u{274C}",
            };
            let text = format!("{emoji} {} by {actor}\n\n{}", action.verb(), row.command);
            acknowledge(&state, &query, &text).await;
            Ok(Json(json!({ "ok": true })).into_response())
        }
        Ok(Outcome::AlreadyResolved(row)) => {
            let actor = row.resolved_by.as_deref().unwrap_or("someone else");
            let text = format!("Already resolved ({} by {actor}).", row.status.as_str());
            answer_callback(&state, &query.id, &text).await;
            Ok(Json(json!({ "ok": true })).into_response())
        }
        Err(err) => {
            if let Some(text) = user_visible_failure(&err) {
                answer_callback(&state, &query.id, text).await;
            }
            Err(err)
        }
    }
}

fn verify_secret_token(secret: &str, headers: &HeaderMap) -> Result<(), AppError> {
    let provided = headers
        .get(SECRET_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;
    if provided.as_bytes().ct_eq(secret.as_bytes()).into() {
        Ok(())
    } else {
        Err(AppError::Unauthorized)
    }
}

/// `approve:<uuid>` / `reject:<uuid>`.
fn parse_callback_data(data: &str) -> Result<(CallbackAction, uuid::Uuid), AppError> {
    let (verb, raw_id) = data
        .split_once(':')
        .ok_or_else(|| AppError::BadRequest("malformed callback data".into()))?;
    let action = match verb {
        "approve" => CallbackAction::Approve,
        "reject" => CallbackAction::Reject,
        other => {
            return Err(AppError::BadRequest(format!("unknown callback verb: {other}")));
        }
    };
    let request_id = crate::api::parse_request_id(raw_id)?;
    Ok((action, request_id))
}

/// Username, falling back to the display name, then the numeric id.
fn derive_handle(user: &TelegramUser) -> String {
    if let Some(username) = &user.username {
        return format!("@{username}");
    }
    let mut name = user.first_name.clone();
    if let Some(last) = &user.last_name {
        name.push(' ');
        name.push_str(last);
    }
    if !name.trim().is_empty() {
        return name;
    }
    user.id.to_string()
}

fn user_visible_failure(err: &AppError) -> Option<&'static str> {
    match err {
        AppError::NotFound => Some("Approval request not found."),
        AppError::Expired => Some("Approval request expired."),
        AppError::IdentityRejected => Some("Invalid machine signature."),
        AppError::RaceLost => Some("Already resolved by someone else."),
        _ => None,
    }
}

/// Answer the callback query and rewrite the original message without
/// its keyboard. Edit failures (old messages) degrade to the answer
/// alone; nothing here is fatal.
async fn acknowledge(state: &AppState, query: &CallbackQuery, text: &str) {
    answer_callback(state, &query.id, text).await;
    let Some(message) = &query.message else { return };
    let body = json!({
        "chat_id": message.chat.id,
        "message_id": message.message_id,
        "text": text,
    });
    call_bot_api(state, "editMessageText", &body).await;
}

async fn answer_callback(state: &AppState, callback_query_id: &str, text: &str) {
    let body = json!({
        "callback_query_id": callback_query_id,
        "text": text,
    });
    call_bot_api(state, "answerCallbackQuery", &body).await;
}

async fn call_bot_api(state: &AppState, method: &str, body: &serde_json::Value) {
    let Some(token) = state.secrets.telegram_bot_token.as_deref() else {
        tracing::warn!("TELEGRAM_BOT_TOKEN not set, skipping {method} acknowledgement");
        return;
    };
    let url = format!("https://api.telegram.org/bot{token}/{method}");
    match state.http.post(&url).json(body).send().await {
        Ok(resp) if !resp.status().is_success() => {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(
                "telegram {method} ack returned {status}: {}",
                redact_credentials(&text, &[token])
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(
                "telegram {method} ack failed: {}",
                redact_credentials(&e.to_string(), &[token])
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn secret_token_must_match_exactly() {
        let mut headers = HeaderMap::new();
        headers.insert(
            SECRET_TOKEN_HEADER,
            HeaderValue::from_static("expected-secret"),
        );
        assert!(verify_secret_token("expected-secret", &headers).is_ok());
        assert!(matches!(
            verify_secret_token("other-secret", &headers),
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            verify_secret_token("expected-secret", &HeaderMap::new()),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn callback_data_parses_both_verbs() {
        let id = uuid::Uuid::new_v4();
        let (action, parsed) = parse_callback_data(&format!("approve:{id}")).unwrap();
        assert_eq!(action, CallbackAction::Approve);
        assert_eq!(parsed, id);
        let (action, _) = parse_callback_data(&format!("reject:{id}")).unwrap();
        assert_eq!(action, CallbackAction::Reject);
    }

    #[test]
    fn callback_data_rejects_garbage() {
        for bad in ["", "approve", "snooze:123", "approve:not-a-uuid"] {
            assert!(parse_callback_data(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn handle_prefers_username_then_name_then_id() {
        let full = TelegramUser {
            id: 7,
            first_name: "Ada".into(),
            last_name: Some("Lovelace".into()),
            username: Some("ada".into()),
        };
        assert_eq!(derive_handle(&full), "@ada");

        let no_username = TelegramUser {
            id: 7,
            first_name: "Ada".into(),
            last_name: Some("Lovelace".into()),
            username: None,
        };
        assert_eq!(derive_handle(&no_username), "Ada Lovelace");

        let bare = TelegramUser {
            id: 7,
            first_name: "".into(),
            last_name: None,
            username: None,
        };
        assert_eq!(derive_handle(&bare), "7");
    }

    #[test]
    fn update_deserializes_wire_shape() {
        let raw = r#"{
            "update_id": 10000,
            "callback_query": {
                "id": "4382bfdwdsb323b2d9",
                "from": { "id": 1111, "first_name": "Ada", "username": "ada" },
                "message": { "message_id": 1365, "chat": { "id": -100123 } },
                "data": "approve:f47ac10b-58cc-4372-a567-0e02b2c3d479"
            }
        }"#;
        let update: Update = serde_json::from_str(raw).unwrap();
        let query = update.callback_query.unwrap();
        assert_eq!(query.id, "4382bfdwdsb323b2d9");
        assert_eq!(query.message.unwrap().chat.id, -100123);
    }
}
