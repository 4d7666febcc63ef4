//! Webhook server: one callback verifier per chat provider, all
//! reducing to the same pipeline — authenticate, parse, fetch, check
//! freshness and machine identity, transition the row exactly once,
//! acknowledge to the human.

pub mod slack;
pub mod telegram;
pub mod twilio;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::config::WebhookSecrets;
use crate::errors::AppError;
use crate::identity;
use crate::models::approval::{ApprovalRequest, CallbackAction};
use crate::store::RestStore;

/// Rows older than this are refused at callback time, independent of
/// the store's SELECT policy.
pub const ROW_FRESHNESS_SECS: i64 = 3600;

/// Shared state for the webhook handlers. The store client carries the
/// service-level credential; end users cannot hold it.
pub struct AppState {
    pub store: Option<RestStore>,
    pub secrets: WebhookSecrets,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn from_env() -> anyhow::Result<Self> {
        let secrets = WebhookSecrets::from_env();
        let store = match (&secrets.store_url, &secrets.store_service_key) {
            (Some(url), Some(key)) => Some(RestStore::new(url, key)?),
            _ => {
                tracing::error!(
                    "CMDGATE_STORE_URL / CMDGATE_STORE_SERVICE_KEY not set: callbacks will fail"
                );
                None
            }
        };
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            store,
            secrets,
            http,
        })
    }

    pub fn store(&self) -> Result<&RestStore, AppError> {
        self.store
            .as_ref()
            .ok_or(AppError::MissingSecret("CMDGATE_STORE_URL"))
    }
}

pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/webhooks/slack", post(slack::handle))
        .route("/webhooks/telegram", post(telegram::handle))
        .route("/webhooks/twilio", post(twilio::handle))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware))
}

/// Every response carries an `x-request-id` so provider retries can be
/// correlated with the logs.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = axum::http::HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

// ── Shared verification pipeline ─────────────────────────────

/// Result of the row transition: either this callback won, or the row
/// was already terminal (provider retry, or the other button).
pub enum Outcome {
    Resolved {
        row: ApprovalRequest,
        action: CallbackAction,
        actor: String,
    },
    AlreadyResolved(ApprovalRequest),
}

/// Steps 5–8 of every provider handler: fetch, freshness, identity,
/// atomic transition. Provider authentication has already happened.
pub async fn apply_callback(
    state: &AppState,
    action: CallbackAction,
    request_id: Uuid,
    actor: &str,
) -> Result<Outcome, AppError> {
    let store = state.store()?;

    let row = store
        .select_request(request_id)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?
        .ok_or(AppError::NotFound)?;

    if row.status.is_terminal() {
        return Ok(Outcome::AlreadyResolved(row));
    }

    if (Utc::now() - row.created_at).num_seconds() > ROW_FRESHNESS_SECS {
        return Err(AppError::Expired);
    }

    if let Err(e) = identity::verify(&row.machine_id, state.secrets.machine_id_secret.as_deref()) {
        tracing::warn!(request_id = %request_id, "machine identity rejected: {e}");
        return Err(AppError::IdentityRejected);
    }

    let affected = store
        .resolve_pending(request_id, action.resolved_status(), Some(actor))
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;
    if affected == 0 {
        // Resolved between the fetch and the update: the other caller won.
        return Err(AppError::RaceLost);
    }

    tracing::info!(
        request_id = %request_id,
        action = action.verb(),
        actor,
        "approval request resolved"
    );

    Ok(Outcome::Resolved { row, action, actor: actor.to_string() })
}

// ── Shared parsing helpers ───────────────────────────────────

static UUID_V4_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$",
    )
    .unwrap()
});

/// Parse a request id, accepting only canonical v4 identifiers.
pub fn parse_request_id(raw: &str) -> Result<Uuid, AppError> {
    if !UUID_V4_RE.is_match(raw) {
        return Err(AppError::BadRequest("invalid request id".into()));
    }
    Uuid::parse_str(raw).map_err(|_| AppError::BadRequest("invalid request id".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_id_accepts_canonical_v4() {
        let id = Uuid::new_v4();
        assert_eq!(parse_request_id(&id.to_string()).unwrap(), id);
        let upper = id.to_string().to_uppercase();
        assert!(parse_request_id(&upper).is_ok());
    }

    #[test]
    fn parse_request_id_rejects_non_v4_shapes() {
        for bad in [
            "",
            "not-a-uuid",
            "00000000-0000-0000-0000-000000000000",
            // v1 identifier: version nibble is 1
            "f47ac10b-58cc-1372-a567-0e02b2c3d479",
            // bad variant nibble
            "f47ac10b-58cc-4372-c567-0e02b2c3d479",
        ] {
            assert!(parse_request_id(bad).is_err(), "{bad:?}");
        }
    }
}
