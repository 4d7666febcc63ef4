//! Slack callback verifier (signed-body provider).
//!
//! Authentication: `X-Slack-Request-Timestamp` within 300 s and
//! `X-Slack-Signature` equal to
//! `v0=hex(HMAC_SHA256(secret, "v0:<ts>:<raw body>"))`, compared in
//! constant time. The payload is a `block_actions` interaction whose
//! action id names the verdict and whose value is the request id.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::api::{apply_callback, AppState, Outcome};
use crate::errors::AppError;
use crate::middleware::rate_limit;
use crate::models::approval::CallbackAction;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew for the signed timestamp.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

const ACTION_APPROVE: &str = "approve_command";
const ACTION_REJECT: &str = "reject_command";

#[derive(Debug, Deserialize)]
struct InteractionPayload {
    #[serde(rename = "type")]
    kind: String,
    user: InteractionUser,
    #[serde(default)]
    actions: Vec<InteractionAction>,
    #[serde(default)]
    response_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InteractionUser {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InteractionAction {
    action_id: String,
    value: String,
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
        .slack_signing_secret
        .as_deref()
        .ok_or(AppError::MissingSecret("SLACK_SIGNING_SECRET"))?;
    verify_signature(secret, &headers, &body, chrono::Utc::now().timestamp())?;

    let payload = parse_payload(&body)?;
    let (action, request_id, actor) = extract_action(&payload)?;

    let result = apply_callback(&state, action, request_id, &actor).await;

    // User-visible acknowledgement goes through response_url; the HTTP
    // status still follows the error table.
    match result {
        Ok(Outcome::Resolved { row, action, actor }) => {
            let emoji = match action {
                CallbackAction::Approve => "\u{2705}",
                CallbackAction::Reject => "\u{274C}",
            };
            let text = format!(
                "{emoji} {} by @{actor}\n```{}```",
                capitalize(action.verb()),
                row.command
            );
            respond_via_url(&state, payload.response_url.as_deref(), &text, true).await;
            Ok(StatusCode::OK.into_response())
        }
        Ok(Outcome::AlreadyResolved(row)) => {
            let actor = row.resolved_by.as_deref().unwrap_or("someone else");
            let text = format!("Already resolved ({} by {actor}).", row.status.as_str());
            respond_via_url(&state, payload.response_url.as_deref(), &text, true).await;
            Ok(StatusCode::OK.into_response())
        }
        Err(err) => {
            if let Some(text) = user_visible_failure(&err) {
                respond_via_url(&state, payload.response_url.as_deref(), text, false).await;
            }
            Err(err)
        }
    }
}

fn verify_signature(
    secret: &str,
    headers: &HeaderMap,
    body: &str,
    now: i64,
) -> Result<(), AppError> {
    let timestamp = header_value(headers, "x-slack-request-timestamp")?;
    let signature = header_value(headers, "x-slack-signature")?;

    let ts: i64 = timestamp.parse().map_err(|_| AppError::Unauthorized)?;
    if (now - ts).abs() > TIMESTAMP_TOLERANCE_SECS {
        return Err(AppError::Unauthorized);
    }

    let basestring = format!("v0:{timestamp}:{body}");
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(basestring.as_bytes());
    let expected = format!("v0={}", hex::encode(mac.finalize().into_bytes()));

    if expected.as_bytes().ct_eq(signature.as_bytes()).into() {
        Ok(())
    } else {
        Err(AppError::Unauthorized)
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)
}

/// The interaction arrives form-encoded with a single `payload` field
/// holding JSON.
fn parse_payload(body: &str) -> Result<InteractionPayload, AppError> {
    let raw = url::form_urlencoded::parse(body.as_bytes())
        .find(|(k, _)| k == "payload")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| AppError::BadRequest("missing payload field".into()))?;
    let payload: InteractionPayload = serde_json::from_str(&raw)
        .map_err(|e| AppError::BadRequest(format!("invalid interaction payload: {e}")))?;
    if payload.kind != "block_actions" {
        return Err(AppError::BadRequest(format!(
            "unsupported interaction type: {}",
            payload.kind
        )));
    }
    Ok(payload)
}

fn extract_action(
    payload: &InteractionPayload,
) -> Result<(CallbackAction, uuid::Uuid, String), AppError> {
    let action = payload
        .actions
        .first()
        .ok_or_else(|| AppError::BadRequest("no actions in payload".into()))?;
    let callback = match action.action_id.as_str() {
        ACTION_APPROVE => CallbackAction::Approve,
        ACTION_REJECT => CallbackAction::Reject,
        other => {
            return Err(AppError::BadRequest(format!("unknown action id: {other}")));
        }
    };
    let request_id = crate::api::parse_request_id(&action.value)?;
    let actor = payload
        .user
        .username
        .clone()
        .or_else(|| payload.user.name.clone())
        .or_else(|| payload.user.id.clone())
        .unwrap_or_else(|| "slack user".to_string());
    Ok((callback, request_id, actor))
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

/// Post back to Slack's response URL. Failures are logged, never fatal.
async fn respond_via_url(state: &AppState, response_url: Option<&str>, text: &str, replace: bool) {
    let Some(url) = response_url else { return };
    let body = serde_json::json!({
        "text": text,
        "replace_original": replace,
        "response_type": "ephemeral",
    });
    if let Err(e) = state.http.post(url).json(&body).send().await {
        tracing::warn!("slack response_url post failed: {e}");
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
