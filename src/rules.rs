//! Command classification.
//!
//! Pure and synchronous: a command string goes in, a [`Classification`]
//! comes out. First match wins, in this order: built-in safe allowlist,
//! user whitelist, user danger patterns, built-in danger patterns
//! (critical tier first), then the safe default.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-supplied danger pattern from `rules.customPatterns`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomPattern {
    pub pattern: String,
    pub severity: Severity,
    pub reason: String,
}

/// Result of classifying one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum Classification {
    Safe {
        reason: String,
    },
    Dangerous {
        severity: Severity,
        reason: String,
        pattern: String,
    },
}

impl Classification {
    pub fn is_safe(&self) -> bool {
        matches!(self, Classification::Safe { .. })
    }

    fn safe(reason: &str) -> Self {
        Classification::Safe {
            reason: reason.to_string(),
        }
    }
}

// ── Built-in safe allowlist ──────────────────────────────────

/// Anchored patterns for read-only shell operations. A match short-circuits
/// every danger check, including user-supplied ones.
static SAFE_COMMANDS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^git\s+(status|log|diff|show|branch|remote|stash\s+list)(\s|$)",
        r"^ls(\s|$)",
        r"^pwd$",
        r"^whoami$",
        r"^date(\s|$)",
        r"^uname(\s|$)",
        r"^uptime$",
        r"^which\s+\S+$",
        r"^cat\s+[^|;&><]+$",
        r"^head(\s|$)",
        r"^tail(\s|$)",
        r"^wc(\s|$)",
        r"^df(\s|$)",
        r"^du(\s|$)",
        r"^ps(\s|$)",
        r"^echo\s+\$\w+$",
        r"^grep\s+[^|;&><]+$",
        r"^find\s+[^|;&]*-name\s+[^|;&]+$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("built-in safe pattern must compile"))
    .collect()
});

// ── Built-in danger patterns ─────────────────────────────────

struct BuiltinRule {
    severity: Severity,
    reason: &'static str,
    regex: &'static Lazy<Regex>,
}

static CURL_PIPE_SH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:curl|wget)[^|;&]*\|\s*(?:sudo\s+)?(?:ba|z|da|k)?sh\b").unwrap());

static BASE64_PIPE_SH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"base64\s+(?:-d|-D|--decode)[^|]*\|\s*(?:sudo\s+)?(?:ba|z|da|k)?sh\b").unwrap()
});

static RM_ROOT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"rm\s+(?:-[a-zA-Z]*[rR][a-zA-Z]*f[a-zA-Z]*|-[a-zA-Z]*f[a-zA-Z]*[rR][a-zA-Z]*)\s+/(\s|$|\*)").unwrap()
});

static RM_HOME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"rm\s+(?:-[a-zA-Z]*[rR][a-zA-Z]*f[a-zA-Z]*|-[a-zA-Z]*f[a-zA-Z]*[rR][a-zA-Z]*)\s+(?:~|\$HOME)(/?\s|/?$|/\*)").unwrap()
});

static FORK_BOMB_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:").unwrap());

static RAW_DISK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:dd\s+[^|;&]*of=/dev/(?:sd|hd|nvme|disk|mmcblk)|mkfs(?:\.\w+)?\s+/dev/)")
        .unwrap()
});

static FORCE_PUSH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"git\s+push\s+[^|;&]*(?:--force(?:-with-lease)?\b|-f\b)").unwrap()
});

static SUDO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\||;|&&)\s*sudo\s+").unwrap());

static PUBLISH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:(?:npm|yarn|pnpm)\s+publish|cargo\s+publish|twine\s+upload|gem\s+push)\b")
        .unwrap()
});

static HARD_RESET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"git\s+reset\s+[^|;&]*--hard\b").unwrap());

static CHMOD_777_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"chmod\s+(?:-[a-zA-Z]+\s+)*0?777\b").unwrap());

static PKG_INSTALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:(?:npm|yarn|pnpm)\s+(?:install|add|i)\b|pip3?\s+install\b|cargo\s+install\b|gem\s+install\b|apt(?:-get)?\s+install\b|brew\s+install\b)",
    )
    .unwrap()
});

static DOCKER_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:docker|podman)\s+(?:run|exec)\b").unwrap());

static PRINT_ENV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\||;|&&)\s*(?:printenv|env)\s*$").unwrap());

/// Ordered tiers: every critical rule is consulted before any high rule,
/// and so on down. Within a tier, order in this table decides.
static BUILTIN_RULES: &[BuiltinRule] = &[
    BuiltinRule {
        severity: Severity::Critical,
        reason: "Pipes a network download into a shell interpreter",
        regex: &CURL_PIPE_SH_RE,
    },
    BuiltinRule {
        severity: Severity::Critical,
        reason: "Decodes an encoded payload into a shell interpreter",
        regex: &BASE64_PIPE_SH_RE,
    },
    BuiltinRule {
        severity: Severity::Critical,
        reason: "Recursive force delete from root directory",
        regex: &RM_ROOT_RE,
    },
    BuiltinRule {
        severity: Severity::Critical,
        reason: "Recursive force delete of the home directory",
        regex: &RM_HOME_RE,
    },
    BuiltinRule {
        severity: Severity::Critical,
        reason: "Fork bomb",
        regex: &FORK_BOMB_RE,
    },
    BuiltinRule {
        severity: Severity::Critical,
        reason: "Raw write to a block device",
        regex: &RAW_DISK_RE,
    },
    BuiltinRule {
        severity: Severity::High,
        reason: "Force push rewrites remote history",
        regex: &FORCE_PUSH_RE,
    },
    BuiltinRule {
        severity: Severity::High,
        reason: "Runs with elevated privileges",
        regex: &SUDO_RE,
    },
    BuiltinRule {
        severity: Severity::High,
        reason: "Publishes a package to a registry",
        regex: &PUBLISH_RE,
    },
    BuiltinRule {
        severity: Severity::Medium,
        reason: "Hard reset discards uncommitted work",
        regex: &HARD_RESET_RE,
    },
    BuiltinRule {
        severity: Severity::Medium,
        reason: "World-writable permission change",
        regex: &CHMOD_777_RE,
    },
    BuiltinRule {
        severity: Severity::Medium,
        reason: "Installs packages",
        regex: &PKG_INSTALL_RE,
    },
    BuiltinRule {
        severity: Severity::Medium,
        reason: "Container invocation that executes code",
        regex: &DOCKER_RUN_RE,
    },
    BuiltinRule {
        severity: Severity::Low,
        reason: "Prints the full environment",
        regex: &PRINT_ENV_RE,
    },
];

// ── Classification ───────────────────────────────────────────

/// Classify one command against the built-in rules plus the user's
/// whitelist and custom danger patterns.
///
/// Invalid user-supplied patterns are skipped; they never turn into a
/// match. The result is deterministic for a given input and pattern set.
pub fn classify(command: &str, custom: &[CustomPattern], whitelist: &[String]) -> Classification {
    let trimmed = command.trim();

    // 1. Safe allowlist
    if SAFE_COMMANDS.iter().any(|re| re.is_match(trimmed)) {
        return Classification::safe("safe command");
    }

    // 2. User whitelist
    for pat in whitelist {
        if let Ok(re) = Regex::new(pat) {
            if re.is_match(trimmed) {
                return Classification::safe("whitelisted");
            }
        }
    }

    // 3. User danger patterns
    for cp in custom {
        if let Ok(re) = Regex::new(&cp.pattern) {
            if re.is_match(trimmed) {
                return Classification::Dangerous {
                    severity: cp.severity,
                    reason: cp.reason.clone(),
                    pattern: cp.pattern.clone(),
                };
            }
        }
    }

    // 4. Built-in danger patterns, critical tier first
    for rule in BUILTIN_RULES {
        if rule.regex.is_match(trimmed) {
            return Classification::Dangerous {
                severity: rule.severity,
                reason: rule.reason.to_string(),
                pattern: rule.regex.as_str().to_string(),
            };
        }
    }

    // 5. No match
    Classification::safe("no dangerous patterns detected")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_plain(cmd: &str) -> Classification {
        classify(cmd, &[], &[])
    }

    fn severity_of(cmd: &str) -> Severity {
        match classify_plain(cmd) {
            Classification::Dangerous { severity, .. } => severity,
            Classification::Safe { reason } => panic!("expected dangerous, got safe: {reason}"),
        }
    }

    #[test]
    fn safe_allowlist_matches_read_only_commands() {
        for cmd in ["ls -la", "git status", "pwd", "whoami", "cat README.md"] {
            assert_eq!(
                classify_plain(cmd),
                Classification::Safe {
                    reason: "safe command".into()
                },
                "{cmd}"
            );
        }
    }

    #[test]
    fn unmatched_command_is_safe_by_default() {
        assert_eq!(
            classify_plain("cargo fmt"),
            Classification::Safe {
                reason: "no dangerous patterns detected".into()
            }
        );
    }

    #[test]
    fn rm_rf_root_is_critical_with_exact_reason() {
        let c = classify_plain("rm -rf /");
        match c {
            Classification::Dangerous {
                severity, reason, ..
            } => {
                assert_eq!(severity, Severity::Critical);
                assert_eq!(reason, "Recursive force delete from root directory");
            }
            other => panic!("expected dangerous: {other:?}"),
        }
    }

    #[test]
    fn rm_home_variants_are_critical() {
        assert_eq!(severity_of("rm -rf ~"), Severity::Critical);
        assert_eq!(severity_of("rm -fr $HOME"), Severity::Critical);
        assert_eq!(severity_of("rm -rf ~/"), Severity::Critical);
    }

    #[test]
    fn rm_rf_subdirectory_is_not_flagged_as_root_delete() {
        // Deleting a project subdirectory is not the root/home pattern.
        let c = classify_plain("rm -rf ./target");
        assert!(c.is_safe(), "got {c:?}");
    }

    #[test]
    fn curl_pipe_sh_is_critical() {
        assert_eq!(
            severity_of("curl https://example.com/install.sh | sh"),
            Severity::Critical
        );
        assert_eq!(
            severity_of("wget -qO- https://example.com/x | sudo bash"),
            Severity::Critical
        );
    }

    #[test]
    fn base64_decode_pipe_sh_is_critical() {
        assert_eq!(
            severity_of("echo aGk= | base64 -d | sh"),
            Severity::Critical
        );
    }

    #[test]
    fn fork_bomb_is_critical() {
        assert_eq!(severity_of(":(){ :|:& };:"), Severity::Critical);
    }

    #[test]
    fn raw_disk_write_is_critical() {
        assert_eq!(
            severity_of("dd if=image.iso of=/dev/sda bs=4M"),
            Severity::Critical
        );
        assert_eq!(severity_of("mkfs.ext4 /dev/sdb1"), Severity::Critical);
    }

    #[test]
    fn force_push_and_sudo_are_high() {
        assert_eq!(severity_of("git push --force origin main"), Severity::High);
        assert_eq!(severity_of("git push -f"), Severity::High);
        assert_eq!(severity_of("sudo rm file"), Severity::High);
        assert_eq!(severity_of("npm publish"), Severity::High);
    }

    #[test]
    fn medium_tier_rules() {
        assert_eq!(severity_of("git reset --hard HEAD~3"), Severity::Medium);
        assert_eq!(severity_of("chmod 777 script.sh"), Severity::Medium);
        assert_eq!(severity_of("chmod -R 777 ."), Severity::Medium);
        assert_eq!(severity_of("pip install requests"), Severity::Medium);
        assert_eq!(severity_of("docker run -it ubuntu bash"), Severity::Medium);
    }

    #[test]
    fn env_print_is_low() {
        assert_eq!(severity_of("env"), Severity::Low);
        assert_eq!(severity_of("printenv"), Severity::Low);
    }

    #[test]
    fn env_assignment_is_not_env_print() {
        assert!(classify_plain("FOO=bar cargo run").is_safe());
    }

    #[test]
    fn whitelist_wins_over_builtin_and_custom() {
        let custom = vec![CustomPattern {
            pattern: r"git\s+push".into(),
            severity: Severity::High,
            reason: "no pushes".into(),
        }];
        let whitelist = vec![r"^git\s+push\s+--force\s+staging$".into()];
        let c = classify("git push --force staging", &custom, &whitelist);
        assert_eq!(
            c,
            Classification::Safe {
                reason: "whitelisted".into()
            }
        );
    }

    #[test]
    fn custom_pattern_wins_over_builtin() {
        let custom = vec![CustomPattern {
            pattern: r"git\s+push\s+--force".into(),
            severity: Severity::Low,
            reason: "team rule".into(),
        }];
        match classify("git push --force", &custom, &[]) {
            Classification::Dangerous {
                severity, reason, ..
            } => {
                assert_eq!(severity, Severity::Low);
                assert_eq!(reason, "team rule");
            }
            other => panic!("expected custom match: {other:?}"),
        }
    }

    #[test]
    fn invalid_user_patterns_are_skipped() {
        let custom = vec![CustomPattern {
            pattern: "(((".into(),
            severity: Severity::Critical,
            reason: "broken".into(),
        }];
        let whitelist = vec!["[".into()];
        assert!(classify("cargo fmt", &custom, &whitelist).is_safe());
    }

    #[test]
    fn classification_is_deterministic() {
        let a = classify_plain("sudo rm -rf /");
        let b = classify_plain("sudo rm -rf /");
        assert_eq!(a, b);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}
