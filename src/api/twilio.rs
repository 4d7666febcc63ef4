//! Twilio callback verifier (sorted-params-MAC provider, text only).
//!
//! Authentication: `X-Twilio-Signature` equals
//! `base64(HMAC_SHA1(auth_token, public_url || concat(key || value sorted by key)))`
//! over all POST form fields. The SMS body must read
//! `APPROVE <id>` or `REJECT <id>` (case-insensitive); everything is
//! acknowledged with a TwiML `<Response><Message>` so the sender gets a
//! reply.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::api::{apply_callback, AppState, Outcome};
use crate::errors::AppError;
use crate::middleware::rate_limit;
use crate::models::approval::CallbackAction;

type HmacSha1 = Hmac<Sha1>;

const SIGNATURE_HEADER: &str = "x-twilio-signature";
const WEBHOOK_PATH: &str = "/webhooks/twilio";

static SMS_BODY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(APPROVE|REJECT)\s+(\S+)$").unwrap());

pub async fn handle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, AppError> {
    let store = state.store()?;
    rate_limit::check(store, &headers).await?;

    let auth_token = state
        .secrets
        .twilio_auth_token
        .as_deref()
        .ok_or(AppError::MissingSecret("TWILIO_AUTH_TOKEN"))?;
    let public_url = state
        .secrets
        .public_url
        .as_deref()
        .ok_or(AppError::MissingSecret("CMDGATE_PUBLIC_URL"))?;

    let params = parse_form(&body);
    let url = format!("{}{}", public_url.trim_end_matches('/'), WEBHOOK_PATH);
    verify_signature(auth_token, &url, &params, &headers)?;

    let sms_body = field(&params, "Body")
        .ok_or_else(|| AppError::BadRequest("missing Body field".into()))?;
    let (action, request_id) = parse_sms_body(sms_body)?;
    let actor = field(&params, "From").unwrap_or("sms sender").to_string();

    match apply_callback(&state, action, request_id, &actor).await {
        Ok(Outcome::Resolved { row, action, .. }) => Ok(twiml(
            StatusCode::OK,
            &format!("Command {}: {}", action.verb(), row.command),
        )),
        Ok(Outcome::AlreadyResolved(row)) => {
            let actor = row.resolved_by.as_deref().unwrap_or("someone else");
            Ok(twiml(
                StatusCode::OK,
                &format!("Already resolved ({} by {}).", row.status.as_str(), actor),
            ))
        }
        // Row-state refusals keep the documented status but still carry
        // a TwiML message so the sender learns what happened.
        Err(AppError::NotFound) => Ok(twiml(
            StatusCode::NOT_FOUND,
            "Approval request not found.",
        )),
        Err(AppError::Expired) => Ok(twiml(StatusCode::GONE, "Approval request expired.")),
        Err(AppError::IdentityRejected) => {
            Ok(twiml(StatusCode::FORBIDDEN, "Invalid machine signature."))
        }
        Err(AppError::RaceLost) => Ok(twiml(
            StatusCode::CONFLICT,
            "Already resolved by someone else.",
        )),
        Err(err) => Err(err),
    }
}

fn parse_form(body: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(body.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn field<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn verify_signature(
    auth_token: &str,
    url: &str,
    params: &[(String, String)],
    headers: &HeaderMap,
) -> Result<(), AppError> {
    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;
    let expected = compute_signature(auth_token, url, params);
    if expected.as_bytes().ct_eq(provided.as_bytes()).into() {
        Ok(())
    } else {
        Err(AppError::Unauthorized)
    }
}

/// Full URL, then every `key || value` pair sorted by key.
fn compute_signature(auth_token: &str, url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut base = url.to_string();
    for (k, v) in sorted {
        base.push_str(k);
        base.push_str(v);
    }
    let mut mac =
        HmacSha1::new_from_slice(auth_token.as_bytes()).expect("HMAC can take key of any size");
    mac.update(base.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

fn parse_sms_body(body: &str) -> Result<(CallbackAction, uuid::Uuid), AppError> {
    let captures = SMS_BODY_RE
        .captures(body.trim())
        .ok_or_else(|| AppError::BadRequest("message must be APPROVE <id> or REJECT <id>".into()))?;
    let action = if captures[1].eq_ignore_ascii_case("APPROVE") {
        CallbackAction::Approve
    } else {
        CallbackAction::Reject
    };
    let request_id = crate::api::parse_request_id(&captures[2])?;
    Ok((action, request_id))
}

fn twiml(status: StatusCode, message: &str) -> Response {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>{}</Message></Response>",
        xml_escape(message)
    );
    (
        status,
        [(header::CONTENT_TYPE, "application/xml")],
        body,
    )
        .into_response()
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
