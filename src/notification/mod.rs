//! Approval-prompt delivery, polymorphic over the configured messenger.
//!
//! Every variant implements the same four operations: send the approval
//! prompt, send a test message, probe the credentials, and a purely
//! structural config check. Construction goes through the factory keyed
//! on `messenger.type`. Variants mask their own credentials before any
//! error string leaves this module.

pub mod slack;
pub mod telegram;
pub mod twilio;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{MessengerConfig, MessengerType};
use crate::mask::mask_secrets;
use crate::rules::Severity;

pub use slack::SlackNotifier;
pub use telegram::TelegramNotifier;
pub use twilio::TwilioNotifier;

/// Provider HTTP budget: connect plus read.
pub(crate) const PROVIDER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Payload of one approval prompt. The command is already masked.
#[derive(Debug, Clone)]
pub struct Notification {
    pub request_id: Uuid,
    pub severity: Severity,
    pub reason: String,
    pub masked_command: String,
    pub cwd: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub enum Notifier {
    Slack(SlackNotifier),
    Telegram(TelegramNotifier),
    Twilio(TwilioNotifier),
}

impl Notifier {
    /// Build the configured variant. Fails when `messenger.type` is
    /// missing or its credential block is absent.
    pub fn from_config(config: &MessengerConfig) -> anyhow::Result<Self> {
        let kind = config
            .kind
            .ok_or_else(|| anyhow::anyhow!("messenger.type is not configured"))?;
        let notifier = match kind {
            MessengerType::Slack => {
                let slack = config
                    .slack
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("messenger.slack is not configured"))?;
                Notifier::Slack(SlackNotifier::new(slack.clone())?)
            }
            MessengerType::Telegram => {
                let telegram = config
                    .telegram
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("messenger.telegram is not configured"))?;
                Notifier::Telegram(TelegramNotifier::new(telegram.clone())?)
            }
            MessengerType::Twilio => {
                let twilio = config
                    .twilio
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("messenger.twilio is not configured"))?;
                Notifier::Twilio(TwilioNotifier::new(twilio.clone())?)
            }
        };
        notifier.validate_config()?;
        Ok(notifier)
    }

    /// Channel name as shown in decision reasons ("Approved via Slack").
    pub fn channel_name(&self) -> &'static str {
        match self {
            Notifier::Slack(_) => "Slack",
            Notifier::Telegram(_) => "Telegram",
            Notifier::Twilio(_) => "Twilio",
        }
    }

    /// Purely structural check; no network.
    pub fn validate_config(&self) -> anyhow::Result<()> {
        match self {
            Notifier::Slack(n) => n.validate_config(),
            Notifier::Telegram(n) => n.validate_config(),
            Notifier::Twilio(n) => n.validate_config(),
        }
    }

    /// Deliver the approval prompt with approve/reject affordances bound
    /// to the request id.
    pub async fn send_notification(&self, notification: &Notification) -> anyhow::Result<()> {
        match self {
            Notifier::Slack(n) => n.send_notification(notification).await,
            Notifier::Telegram(n) => n.send_notification(notification).await,
            Notifier::Twilio(n) => n.send_notification(notification).await,
        }
    }

    /// Deliver a no-op-effect test message.
    pub async fn send_test(&self) -> anyhow::Result<()> {
        match self {
            Notifier::Slack(n) => n.send_test().await,
            Notifier::Telegram(n) => n.send_test().await,
            Notifier::Twilio(n) => n.send_test().await,
        }
    }

    /// Authenticate the credentials against the provider; returns a
    /// display handle (bot name, account friendly name).
    pub async fn probe_connection(&self) -> anyhow::Result<String> {
        match self {
            Notifier::Slack(n) => n.probe_connection().await,
            Notifier::Telegram(n) => n.probe_connection().await,
            Notifier::Twilio(n) => n.probe_connection().await,
        }
    }
}

/// Scrub provider credentials out of an error string before it can
/// reach logs or the user.
pub(crate) fn redact_credentials(message: &str, credentials: &[&str]) -> String {
    let mut out = message.to_string();
    for cred in credentials {
        if !cred.is_empty() {
            out = out.replace(cred, "[MASKED]");
        }
    }
    mask_secrets(&out)
}

pub(crate) fn provider_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(PROVIDER_TIMEOUT)
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build provider HTTP client: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SlackConfig, TelegramConfig};

    #[test]
    fn factory_requires_messenger_type() {
        let err = Notifier::from_config(&MessengerConfig::default()).unwrap_err();
        assert!(err.to_string().contains("messenger.type"));
    }

    #[test]
    fn factory_requires_variant_block() {
        let config = MessengerConfig {
            kind: Some(MessengerType::Telegram),
            slack: None,
            telegram: None,
            twilio: None,
        };
        let err = Notifier::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("messenger.telegram"));
    }

    #[test]
    fn factory_builds_configured_variant() {
        let config = MessengerConfig {
            kind: Some(MessengerType::Slack),
            slack: Some(SlackConfig {
                webhook_url: "https://hooks.slack.com/services/T0/B0/xyz".into(),
                bot_token: None,
            }),
            telegram: Some(TelegramConfig {
                bot_token: "123:abc".into(),
                chat_id: "-1".into(),
            }),
            twilio: None,
        };
        let notifier = Notifier::from_config(&config).unwrap();
        assert_eq!(notifier.channel_name(), "Slack");
    }

    #[test]
    fn redact_credentials_strips_every_occurrence() {
        let out = redact_credentials(
            "post to https://api.telegram.org/bot123:abc/sendMessage failed: 123:abc rejected",
            &["123:abc"],
        );
        assert!(!out.contains("123:abc"));
        assert!(out.contains("[MASKED]"));
    }
}
