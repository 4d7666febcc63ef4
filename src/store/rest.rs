//! REST client for the row store.
//!
//! One instance per hook invocation (anon key + signed identity header)
//! or per webhook process (service key). Filters are expressed as
//! `column=op.value` query parameters; `update_where` counts affected
//! rows from the returned representation so the `status=pending` guard
//! serializes concurrent transitions.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::mask::mask_secrets;
use crate::models::approval::{ApprovalRequest, ApprovalStatus, NewApprovalRequest};
use crate::store::{APPROVALS_TABLE, MACHINE_IDENTITY_HEADER, RATE_LIMIT_TABLE};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    machine_identity: Option<String>,
}

impl RestStore {
    pub fn new(url: &str, api_key: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build store HTTP client")?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            machine_identity: None,
        })
    }

    /// Attach the signed machine identity sent with every request; the
    /// store's insert policy reads it.
    pub fn with_machine_identity(mut self, signed: String) -> Self {
        self.machine_identity = Some(signed);
        self
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key);
        if let Some(identity) = &self.machine_identity {
            builder = builder.header(MACHINE_IDENTITY_HEADER, identity);
        }
        builder
    }

    async fn expect_success(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("store returned {}: {}", status, mask_secrets(&body));
    }

    // ── Approval rows ────────────────────────────────────────

    /// Insert a pending approval row, returning the stored row
    /// (with the store-assigned `created_at`).
    pub async fn insert_request(&self, row: &NewApprovalRequest) -> anyhow::Result<ApprovalRequest> {
        let resp = self
            .request(reqwest::Method::POST, &self.table_url(APPROVALS_TABLE))
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await
            .context("insert request failed")?;
        let resp = Self::expect_success(resp).await?;
        let mut rows: Vec<ApprovalRequest> =
            resp.json().await.context("insert returned invalid row")?;
        rows.pop().context("insert returned no row")
    }

    /// Fetch one row by id. `Ok(None)` when absent or filtered by the
    /// store's freshness policy.
    pub async fn select_request(&self, id: Uuid) -> anyhow::Result<Option<ApprovalRequest>> {
        let url = format!(
            "{}?id=eq.{}&select=*",
            self.table_url(APPROVALS_TABLE),
            id
        );
        let resp = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .context("select request failed")?;
        let resp = Self::expect_success(resp).await?;
        let mut rows: Vec<ApprovalRequest> =
            resp.json().await.context("select returned invalid rows")?;
        Ok(rows.pop())
    }

    /// Transition a row out of `pending`. The `status=eq.pending` filter
    /// is the single serialization point: exactly one concurrent caller
    /// sees an affected count of 1.
    pub async fn resolve_pending(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        resolved_by: Option<&str>,
    ) -> anyhow::Result<u64> {
        let url = format!(
            "{}?id=eq.{}&status=eq.pending",
            self.table_url(APPROVALS_TABLE),
            id
        );
        let patch = serde_json::json!({
            "status": status,
            "resolved_at": Utc::now(),
            "resolved_by": resolved_by,
        });
        let resp = self
            .request(reqwest::Method::PATCH, &url)
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await
            .context("update request failed")?;
        let resp = Self::expect_success(resp).await?;
        let rows: Vec<serde_json::Value> =
            resp.json().await.context("update returned invalid rows")?;
        Ok(rows.len() as u64)
    }

    /// Best-effort timeout marker from the coordinator's deadline arm.
    pub async fn mark_timeout(&self, id: Uuid) -> anyhow::Result<u64> {
        self.resolve_pending(id, ApprovalStatus::Timeout, None).await
    }

    // ── Rate-limit events ────────────────────────────────────

    pub async fn insert_rate_limit_event(&self, identifier: &str) -> anyhow::Result<()> {
        let resp = self
            .request(reqwest::Method::POST, &self.table_url(RATE_LIMIT_TABLE))
            .json(&serde_json::json!({ "identifier": identifier }))
            .send()
            .await
            .context("rate-limit insert failed")?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    /// Count events for `identifier` inside the rolling window, using an
    /// exact-count header so the bodies stay tiny.
    pub async fn count_rate_limit_events(
        &self,
        identifier: &str,
        window: Duration,
    ) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(window)?;
        let url = format!(
            "{}?identifier=eq.{}&created_at=gt.{}&select=id",
            self.table_url(RATE_LIMIT_TABLE),
            identifier,
            cutoff.to_rfc3339(),
        );
        let resp = self
            .request(reqwest::Method::GET, &url)
            .header("Prefer", "count=exact")
            .header("Range", "0-0")
            .send()
            .await
            .context("rate-limit count failed")?;
        let resp = Self::expect_success(resp).await?;
        let total = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .context("rate-limit count response missing content-range")?;
        Ok(total)
    }

    // ── Cleanup ──────────────────────────────────────────────

    pub async fn delete_requests_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        self.delete_older_than(APPROVALS_TABLE, cutoff).await
    }

    pub async fn delete_rate_limit_events_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        self.delete_older_than(RATE_LIMIT_TABLE, cutoff).await
    }

    async fn delete_older_than(&self, table: &str, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let url = format!(
            "{}?created_at=lt.{}",
            self.table_url(table),
            cutoff.to_rfc3339()
        );
        let resp = self
            .request(reqwest::Method::DELETE, &url)
            .header("Prefer", "return=representation")
            .send()
            .await
            .context("cleanup delete failed")?;
        let resp = Self::expect_success(resp).await?;
        let rows: Vec<serde_json::Value> =
            resp.json().await.context("delete returned invalid rows")?;
        Ok(rows.len() as u64)
    }
}

/// `content-range: 0-0/42` → 42; `*/0` → 0.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total_parses() {
        assert_eq!(parse_content_range_total("0-0/42"), Some(42));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn table_urls_strip_trailing_slash() {
        let store = RestStore::new("https://store.example.com/", "anon").unwrap();
        assert_eq!(
            store.table_url(APPROVALS_TABLE),
            "https://store.example.com/rest/v1/approval_requests"
        );
    }
}
