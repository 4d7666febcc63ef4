//! The approval coordinator.
//!
//! One invocation per hook event: classify, persist, notify, then race
//! the remote change feed against the local terminal and the deadline.
//! Exactly one decision object is written to stdout; everything else
//! goes to stderr. Unhandled failures fall through to the configured
//! default action, and the coordinator as a whole fails closed.

pub mod tty;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{Config, DefaultAction};
use crate::identity;
use crate::mask::mask_secrets;
use crate::models::approval::{ApprovalStatus, NewApprovalRequest};
use crate::notification::{Notification, Notifier};
use crate::rules::{classify, Classification};
use crate::store::{realtime, RestStore};

const SHELL_TOOL: &str = "Bash";

// ── Hook I/O contract ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HookEvent {
    tool_name: String,
    #[serde(default)]
    tool_input: ToolInput,
}

#[derive(Debug, Deserialize, Default)]
struct ToolInput {
    #[serde(default)]
    command: Option<String>,
}

/// The one object written to stdout.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Decision {
    pub decision: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Decision {
    pub fn allow() -> Self {
        Decision {
            decision: "allow",
            reason: None,
        }
    }

    pub fn allow_with(reason: impl Into<String>) -> Self {
        Decision {
            decision: "allow",
            reason: Some(reason.into()),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Decision {
            decision: "deny",
            reason: Some(reason.into()),
        }
    }
}

// ── Entry point ──────────────────────────────────────────────

/// Run the coordinator for one raw hook event. Never panics outward;
/// every failure path maps to a decision.
pub async fn run(raw_input: &str) -> Decision {
    let command = match parse_input(raw_input) {
        Parsed::Invalid(reason) => return Decision::deny(reason),
        Parsed::NotSubject => return Decision::allow(),
        Parsed::Command(cmd) => cmd,
    };

    // Classification works even without a config file; persistence does
    // not, so an unconfigured gate fails closed further down.
    let config = match crate::config::load() {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!("config unavailable, dangerous commands will be denied: {e:#}");
            None
        }
    };

    let (custom, whitelist) = config
        .as_ref()
        .map(|c| (c.rules.custom_patterns.as_slice(), c.rules.whitelist.as_slice()))
        .unwrap_or((&[], &[]));

    match classify(&command, custom, whitelist) {
        Classification::Safe { reason } => {
            tracing::debug!(%reason, "command classified safe");
            Decision::allow()
        }
        Classification::Dangerous {
            severity,
            reason,
            pattern,
        } => {
            tracing::info!(%severity, %reason, %pattern, "command classified dangerous");
            let Some(config) = config else {
                return Decision::deny(format!("Dangerous command ({severity}): {reason}"));
            };
            gate_dangerous(&config, &command, severity, &reason).await
        }
    }
}

enum Parsed {
    Invalid(String),
    NotSubject,
    Command(String),
}

fn parse_input(raw: &str) -> Parsed {
    if raw.trim().is_empty() {
        return Parsed::Invalid("empty hook input".into());
    }
    let event: HookEvent = match serde_json::from_str(raw) {
        Ok(e) => e,
        Err(e) => return Parsed::Invalid(format!("invalid hook input: {e}")),
    };
    if event.tool_name != SHELL_TOOL {
        return Parsed::NotSubject;
    }
    match event.tool_input.command {
        Some(cmd) if !cmd.trim().is_empty() => Parsed::Command(cmd),
        _ => Parsed::NotSubject,
    }
}

// ── Dangerous path ───────────────────────────────────────────

async fn gate_dangerous(
    config: &Config,
    command: &str,
    severity: crate::rules::Severity,
    reason: &str,
) -> Decision {
    let default_action = config.rules.default_action;

    let masked = mask_secrets(command);
    let request_id = Uuid::new_v4();
    let cwd = std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("?"));

    let fingerprint = identity::fingerprint();
    let machine_id = match &config.machine_id_secret {
        Some(secret) => identity::sign(&fingerprint, secret),
        // No local secret: bare fingerprint, accepted by the webhook's
        // compatibility fallback.
        None => fingerprint,
    };

    let store = match RestStore::new(&config.store.url, &config.store.anon_key) {
        Ok(s) => s.with_machine_identity(machine_id.clone()),
        Err(e) => {
            return default(default_action, format!("Failed to reach approval store: {e}"));
        }
    };

    let row = NewApprovalRequest {
        id: request_id,
        command: masked.clone(),
        danger_reason: reason.to_string(),
        severity,
        cwd: cwd.clone(),
        status: ApprovalStatus::Pending,
        machine_id,
    };
    if let Err(e) = store.insert_request(&row).await {
        tracing::error!("failed to persist approval request: {e:#}");
        return default(default_action, "Failed to record approval request");
    }

    let notifier = match Notifier::from_config(&config.messenger) {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("notifier unavailable: {e:#}");
            return default(default_action, "Failed to send approval notification");
        }
    };

    // Subscribe before notifying so a verdict arriving immediately after
    // the prompt cannot slip past the feed.
    let subscription =
        match realtime::subscribe(&config.store.url, &config.store.anon_key, request_id).await {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!("realtime subscription unavailable: {e:#}");
                None
            }
        };

    let notification = Notification {
        request_id,
        severity,
        reason: reason.to_string(),
        masked_command: masked.clone(),
        cwd,
        timestamp: Utc::now(),
    };
    if let Err(e) = notifier.send_notification(&notification).await {
        tracing::error!("failed to send approval notification: {e:#}");
        if let Some(sub) = subscription {
            sub.close();
        }
        return default(default_action, "Failed to send approval notification");
    }

    await_verdict(
        config,
        &store,
        subscription,
        request_id,
        &masked,
        severity,
        notifier.channel_name(),
    )
    .await
}

/// Race the three waits. The first resolver wins; the losers are
/// released before returning.
async fn await_verdict(
    config: &Config,
    store: &RestStore,
    subscription: Option<realtime::RowSubscription>,
    request_id: Uuid,
    masked_command: &str,
    severity: crate::rules::Severity,
    channel: &str,
) -> Decision {
    let default_action = config.rules.default_action;
    let deadline = std::time::Duration::from_secs(config.rules.timeout_seconds);

    let mut subscription = subscription;
    let mut tty_listener = tty::spawn(masked_command, severity.as_str());

    // Waits that cannot resolve (no terminal, dropped feed) sit out the
    // race instead of winning it.
    let remote = async {
        let Some(sub) = subscription.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            match sub.recv().await {
                Some(row) if row.status.is_terminal() => return row,
                Some(_) => continue,
                None => return std::future::pending().await,
            }
        }
    };

    let local = async {
        let Some(listener) = tty_listener.as_mut() else {
            return std::future::pending().await;
        };
        match listener.recv().await {
            Some(answer) => answer,
            None => std::future::pending().await,
        }
    };

    let decision = tokio::select! {
        row = remote => match row.status {
            ApprovalStatus::Approved => {
                Decision::allow_with(format!("Approved via {channel}"))
            }
            ApprovalStatus::Rejected => {
                Decision::deny(format!("Rejected via {channel}"))
            }
            _ => default(default_action, "Approval timed out"),
        },
        approved = local => {
            if approved {
                Decision::allow_with("Approved via Local TTY")
            } else {
                Decision::deny("Rejected via Local TTY")
            }
        },
        _ = tokio::time::sleep(deadline) => {
            timeout_verdict(store, request_id, default_action).await
        }
    };

    // Losers of the race: close the feed, withdraw the terminal prompt.
    if let Some(sub) = subscription {
        sub.close();
    }
    drop(tty_listener);

    decision
}

/// Deadline fired: best-effort timeout marker, then the default action.
async fn timeout_verdict(store: &RestStore, request_id: Uuid, action: DefaultAction) -> Decision {
    if let Err(e) = store.mark_timeout(request_id).await {
        tracing::warn!("failed to mark request {request_id} as timed out: {e:#}");
    }
    default(action, "Approval timed out")
}

fn default(action: DefaultAction, reason: impl Into<String>) -> Decision {
    match action {
        DefaultAction::Allow => Decision::allow_with(reason),
        DefaultAction::Deny => Decision::deny(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_fails_closed() {
        assert!(matches!(parse_input(""), Parsed::Invalid(_)));
        assert!(matches!(parse_input("   \n"), Parsed::Invalid(_)));
    }

    #[test]
    fn malformed_json_fails_closed() {
        assert!(matches!(parse_input("{not json"), Parsed::Invalid(_)));
        assert!(matches!(parsed_invalid_reason("[1,2]"), Some(_)));
    }

    fn parsed_invalid_reason(raw: &str) -> Option<String> {
        match parse_input(raw) {
            Parsed::Invalid(r) => Some(r),
            _ => None,
        }
    }

    #[test]
    fn non_shell_tool_is_not_subject() {
        let raw = r#"{"tool_name":"Read","tool_input":{"file_path":"/etc/hosts"}}"#;
        assert!(matches!(parse_input(raw), Parsed::NotSubject));
    }

    #[test]
    fn missing_or_empty_command_is_not_subject() {
        let raw = r#"{"tool_name":"Bash","tool_input":{}}"#;
        assert!(matches!(parse_input(raw), Parsed::NotSubject));
        let raw = r#"{"tool_name":"Bash","tool_input":{"command":"  "}}"#;
        assert!(matches!(parse_input(raw), Parsed::NotSubject));
    }

    #[test]
    fn shell_command_is_extracted() {
        let raw = r#"{"tool_name":"Bash","tool_input":{"command":"ls -la"}}"#;
        match parse_input(raw) {
            Parsed::Command(cmd) => assert_eq!(cmd, "ls -la"),
            other => panic!("expected command, got {:?}", std::mem::discriminant(&other)),
        }
    }

    #[test]
    fn decision_json_shape() {
        assert_eq!(
            serde_json::to_string(&Decision::allow()).unwrap(),
            r#"{"decision":"allow"}"#
        );
        assert_eq!(
            serde_json::to_string(&Decision::deny("Approval timed out")).unwrap(),
            r#"{"decision":"deny","reason":"Approval timed out"}"#
        );
    }

    #[test]
    fn default_action_maps_to_decision() {
        assert_eq!(
            default(DefaultAction::Deny, "Approval timed out"),
            Decision::deny("Approval timed out")
        );
        assert_eq!(
            default(DefaultAction::Allow, "Approval timed out"),
            Decision::allow_with("Approval timed out")
        );
    }

    #[tokio::test]
    async fn safe_command_allows_without_config() {
        // No config file in the test environment; safe classification
        // must short-circuit before any store access.
        std::env::set_var("CMDGATE_CONFIG", "/nonexistent/cmdgate.json");
        let raw = r#"{"tool_name":"Bash","tool_input":{"command":"ls -la"}}"#;
        assert_eq!(run(raw).await, Decision::allow());
    }

    #[tokio::test]
    async fn dangerous_command_without_config_denies() {
        std::env::set_var("CMDGATE_CONFIG", "/nonexistent/cmdgate.json");
        let raw = r#"{"tool_name":"Bash","tool_input":{"command":"rm -rf /"}}"#;
        let decision = run(raw).await;
        assert_eq!(decision.decision, "deny");
        assert!(decision.reason.unwrap().contains("critical"));
    }
}
