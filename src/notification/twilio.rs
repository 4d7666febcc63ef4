//! Twilio notifier: SMS prompts for channels without buttons. The
//! recipient replies `APPROVE <id>` or `REJECT <id>`.

use crate::config::TwilioConfig;
use crate::notification::{provider_client, redact_credentials, Notification};

const API_BASE: &str = "https://api.twilio.com/2010-04-01";

#[derive(Clone, Debug)]
pub struct TwilioNotifier {
    client: reqwest::Client,
    config: TwilioConfig,
}

impl TwilioNotifier {
    pub fn new(config: TwilioConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: provider_client()?,
            config,
        })
    }

    pub fn validate_config(&self) -> anyhow::Result<()> {
        if !self.config.account_sid.starts_with("AC") {
            anyhow::bail!("twilio account SID must start with AC");
        }
        if self.config.auth_token.trim().is_empty() {
            anyhow::bail!("twilio auth token is empty");
        }
        for (name, number) in [
            ("fromNumber", &self.config.from_number),
            ("toNumber", &self.config.to_number),
        ] {
            if !number.starts_with('+') {
                anyhow::bail!("twilio {name} must be E.164 (+...)");
            }
        }
        Ok(())
    }

    pub async fn send_notification(&self, n: &Notification) -> anyhow::Result<()> {
        let body = format!(
            "Command approval required ({})\nReason: {}\nDir: {}\nCommand: {}\n\nReply APPROVE {} or REJECT {}",
            n.severity, n.reason, n.cwd, n.masked_command, n.request_id, n.request_id,
        );
        self.send_sms(&body).await
    }

    pub async fn send_test(&self) -> anyhow::Result<()> {
        self.send_sms("cmdgate test message: notifications are working.")
            .await
    }

    /// Fetch the account resource; returns its friendly name.
    pub async fn probe_connection(&self) -> anyhow::Result<String> {
        let url = format!("{API_BASE}/Accounts/{}.json", self.config.account_sid);
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .send()
            .await
            .map_err(|e| self.redacted_err("account fetch failed", &e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(self.redacted_err(&format!("account fetch returned {status}"), &text));
        }
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| self.redacted_err("account fetch returned invalid JSON", &e.to_string()))?;
        Ok(payload["friendly_name"]
            .as_str()
            .unwrap_or("twilio account")
            .to_string())
    }

    async fn send_sms(&self, body: &str) -> anyhow::Result<()> {
        let url = format!(
            "{API_BASE}/Accounts/{}/Messages.json",
            self.config.account_sid
        );
        let form = [
            ("To", self.config.to_number.as_str()),
            ("From", self.config.from_number.as_str()),
            ("Body", body),
        ];
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| self.redacted_err("message send failed", &e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(self.redacted_err(&format!("message send returned {status}"), &text));
        }
        Ok(())
    }

    fn redacted_err(&self, what: &str, detail: &str) -> anyhow::Error {
        anyhow::anyhow!(
            "twilio {what}: {}",
            redact_credentials(detail, &[self.config.auth_token.as_str()])
        )
    }
}
