use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rules::Severity;

/// One outstanding approval decision, persisted in the shared row store.
///
/// Created by the hook-side coordinator, resolved exactly once by the
/// webhook-side verifier, deleted by the cleanup job after 24 h.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    /// Command text after secret masking. Raw commands never reach the store.
    pub command: String,
    pub danger_reason: String,
    pub severity: Severity,
    pub cwd: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Human-readable handle of whoever resolved the request (chat username).
    pub resolved_by: Option<String>,
    /// Signed machine identity of the machine that created the row.
    /// Immutable after insert.
    pub machine_id: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Timeout => "timeout",
        }
    }

    /// Terminal states are absorbing; only `pending` may transition.
    pub fn is_terminal(&self) -> bool {
        *self != ApprovalStatus::Pending
    }
}

/// Insert payload for a new approval row. `created_at` is set by the store.
#[derive(Debug, Serialize)]
pub struct NewApprovalRequest {
    pub id: Uuid,
    pub command: String,
    pub danger_reason: String,
    pub severity: Severity,
    pub cwd: String,
    pub status: ApprovalStatus,
    pub machine_id: String,
}

/// The action a chat callback carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Approve,
    Reject,
}

impl CallbackAction {
    pub fn resolved_status(&self) -> ApprovalStatus {
        match self {
            CallbackAction::Approve => ApprovalStatus::Approved,
            CallbackAction::Reject => ApprovalStatus::Rejected,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            CallbackAction::Approve => "approved",
            CallbackAction::Reject => "rejected",
        }
    }
}
