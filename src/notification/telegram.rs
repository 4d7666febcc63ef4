//! Telegram notifier: Bot API `sendMessage` with an inline keyboard.

use serde_json::json;

use crate::config::TelegramConfig;
use crate::notification::{provider_client, redact_credentials, Notification};

#[derive(Clone, Debug)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: provider_client()?,
            config,
        })
    }

    pub fn validate_config(&self) -> anyhow::Result<()> {
        if !self.config.bot_token.contains(':') {
            anyhow::bail!("telegram bot token must look like <id>:<secret>");
        }
        if self.config.chat_id.trim().is_empty() {
            anyhow::bail!("telegram chat id is empty");
        }
        Ok(())
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{}",
            self.config.bot_token, method
        )
    }

    pub async fn send_notification(&self, n: &Notification) -> anyhow::Result<()> {
        let text = format!(
            "\u{1F6A8} Command approval required\n\nSeverity: {}\nReason: {}\nDirectory: {}\nRequested: {}\n\nCommand:\n{}",
            n.severity,
            n.reason,
            n.cwd,
            n.timestamp.to_rfc3339(),
            n.masked_command,
        );
        let body = json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "reply_markup": {
                "inline_keyboard": [[
                    { "text": "\u{2705} Approve", "callback_data": format!("approve:{}", n.request_id) },
                    { "text": "\u{274C} Reject", "callback_data": format!("reject:{}", n.request_id) }
                ]]
            }
        });
        self.call("sendMessage", &body).await.map(|_| ())
    }

    pub async fn send_test(&self) -> anyhow::Result<()> {
        let body = json!({
            "chat_id": self.config.chat_id,
            "text": "cmdgate test message: notifications are working.",
        });
        self.call("sendMessage", &body).await.map(|_| ())
    }

    /// `getMe`; returns the bot username.
    pub async fn probe_connection(&self) -> anyhow::Result<String> {
        let result = self.call("getMe", &json!({})).await?;
        Ok(result["username"]
            .as_str()
            .unwrap_or("telegram bot")
            .to_string())
    }

    /// Invoke a Bot API method, returning the `result` object.
    async fn call(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| self.redacted_err(method, &e.to_string()))?;
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| self.redacted_err(method, &e.to_string()))?;
        if payload["ok"].as_bool() != Some(true) {
            let detail = payload["description"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string();
            return Err(self.redacted_err(method, &detail));
        }
        Ok(payload["result"].clone())
    }

    fn redacted_err(&self, method: &str, detail: &str) -> anyhow::Error {
        anyhow::anyhow!(
            "telegram {method} failed: {}",
            redact_credentials(detail, &[self.config.bot_token.as_str()])
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> TelegramNotifier {
        TelegramNotifier::new(TelegramConfig {
            bot_token: "12345:AAbbCCsecret".into(),
            chat_id: "-100987".into(),
        })
        .unwrap()
    }

    #[test]
    fn validate_checks_token_shape_and_chat_id() {
        assert!(notifier().validate_config().is_ok());
        let bad = TelegramNotifier::new(TelegramConfig {
            bot_token: "no-colon".into(),
            chat_id: "1".into(),
        })
        .unwrap();
        assert!(bad.validate_config().is_err());
        let empty_chat = TelegramNotifier::new(TelegramConfig {
            bot_token: "1:a".into(),
            chat_id: "  ".into(),
        })
        .unwrap();
        assert!(empty_chat.validate_config().is_err());
    }

    #[test]
    fn errors_never_carry_the_bot_token() {
        let n = notifier();
        let err = n.redacted_err(
            "sendMessage",
            "POST https://api.telegram.org/bot12345:AAbbCCsecret/sendMessage timed out",
        );
        assert!(!err.to_string().contains("AAbbCCsecret"));
    }
}
