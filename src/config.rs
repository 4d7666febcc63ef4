//! Configuration for the hook side (a JSON document) and the webhook
//! side (environment variables).
//!
//! Hook config lives at `~/.config/cmdgate/config.json`, overridable
//! with `CMDGATE_CONFIG`. Timeout and default-action env overrides are
//! clamped so an environment cannot weaken the configured posture.

use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

use crate::rules::CustomPattern;

/// Floor applied to `rules.timeoutSeconds` from the config file.
pub const MIN_TIMEOUT_SECS: u64 = 10;
/// Floor applied to the `CMDGATE_TIMEOUT_SECONDS` env override.
pub const MIN_ENV_TIMEOUT_SECS: u64 = 60;

const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub messenger: MessengerConfig,
    pub store: StoreConfig,
    pub rules: RulesConfig,
    pub machine_id_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MessengerConfig {
    #[serde(rename = "type")]
    pub kind: Option<MessengerType>,
    pub slack: Option<SlackConfig>,
    pub telegram: Option<TelegramConfig>,
    pub twilio: Option<TwilioConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessengerType {
    Slack,
    Telegram,
    Twilio,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackConfig {
    pub webhook_url: String,
    /// Optional bot token; only needed for `probe` (auth.test).
    pub bot_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub to_number: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub url: String,
    pub anon_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RulesConfig {
    pub timeout_seconds: u64,
    pub default_action: DefaultAction,
    pub custom_patterns: Vec<CustomPattern>,
    pub whitelist: Vec<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            default_action: DefaultAction::Deny,
            custom_patterns: Vec::new(),
            whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    Allow,
    Deny,
}

impl Default for DefaultAction {
    fn default() -> Self {
        DefaultAction::Deny
    }
}

pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CMDGATE_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|p| p.join("cmdgate").join("config.json"))
}

/// Load the config document and apply clamps and env overrides.
pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    let path = config_path().context("cannot resolve config directory")?;
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    let config: Config = serde_json::from_str(&contents)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(apply_overrides(config))
}

fn apply_overrides(mut config: Config) -> Config {
    config.rules.timeout_seconds = config.rules.timeout_seconds.max(MIN_TIMEOUT_SECS);

    if let Ok(raw) = std::env::var("CMDGATE_TIMEOUT_SECONDS") {
        match raw.parse::<u64>() {
            Ok(secs) => {
                config.rules.timeout_seconds = secs.max(MIN_ENV_TIMEOUT_SECS);
            }
            Err(_) => {
                tracing::warn!(value = %raw, "ignoring unparseable CMDGATE_TIMEOUT_SECONDS");
            }
        }
    }

    if let Ok(raw) = std::env::var("CMDGATE_DEFAULT_ACTION") {
        match raw.to_lowercase().as_str() {
            "deny" => config.rules.default_action = DefaultAction::Deny,
            "allow" => {
                if config.rules.default_action == DefaultAction::Deny {
                    tracing::warn!(
                        "refusing CMDGATE_DEFAULT_ACTION=allow: env override cannot weaken deny"
                    );
                } else {
                    config.rules.default_action = DefaultAction::Allow;
                }
            }
            other => {
                tracing::warn!(value = other, "ignoring unknown CMDGATE_DEFAULT_ACTION");
            }
        }
    }

    config
}

// ── Webhook environment ──────────────────────────────────────

/// Secrets the webhook server reads at startup. Any required one that
/// is missing yields a 500 on the requests that need it, never a crash.
#[derive(Debug, Clone, Default)]
pub struct WebhookSecrets {
    pub slack_signing_secret: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_webhook_secret: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub machine_id_secret: Option<String>,
    pub store_url: Option<String>,
    pub store_service_key: Option<String>,
    /// Externally visible base URL; Twilio signs the exact public URL.
    pub public_url: Option<String>,
}

impl WebhookSecrets {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let secrets = Self {
            slack_signing_secret: env_non_empty("SLACK_SIGNING_SECRET"),
            telegram_bot_token: env_non_empty("TELEGRAM_BOT_TOKEN"),
            telegram_webhook_secret: env_non_empty("TELEGRAM_WEBHOOK_SECRET"),
            twilio_auth_token: env_non_empty("TWILIO_AUTH_TOKEN"),
            machine_id_secret: env_non_empty("MACHINE_ID_SECRET"),
            store_url: env_non_empty("CMDGATE_STORE_URL"),
            store_service_key: env_non_empty("CMDGATE_STORE_SERVICE_KEY"),
            public_url: env_non_empty("CMDGATE_PUBLIC_URL"),
        };
        if secrets.machine_id_secret.is_none() {
            tracing::warn!(
                "MACHINE_ID_SECRET not set: machine identity checks degrade to a format check"
            );
        }
        secrets
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_full_document() {
        let config = parse(
            r#"{
                "messenger": {
                    "type": "telegram",
                    "telegram": { "botToken": "123:abc", "chatId": "-100200300" }
                },
                "store": { "url": "https://store.example.com", "anonKey": "anon" },
                "rules": {
                    "timeoutSeconds": 120,
                    "defaultAction": "deny",
                    "customPatterns": [
                        { "pattern": "terraform\\s+apply", "severity": "high", "reason": "infra change" }
                    ],
                    "whitelist": ["^make test$"]
                },
                "machineIdSecret": "s3cret"
            }"#,
        );
        assert_eq!(config.messenger.kind, Some(MessengerType::Telegram));
        assert_eq!(config.rules.timeout_seconds, 120);
        assert_eq!(config.rules.custom_patterns.len(), 1);
        assert_eq!(config.machine_id_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config = parse("{}");
        assert_eq!(config.rules.timeout_seconds, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.rules.default_action, DefaultAction::Deny);
        assert!(config.messenger.kind.is_none());
    }

    #[test]
    fn config_timeout_clamped_to_ten() {
        let config = apply_overrides(parse(r#"{ "rules": { "timeoutSeconds": 3 } }"#));
        assert_eq!(config.rules.timeout_seconds, MIN_TIMEOUT_SECS);
    }
}
