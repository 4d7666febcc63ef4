//! Machine identity: a stable fingerprint plus an HMAC-signed,
//! timestamped identifier.
//!
//! Signed form: `fingerprint:unix_seconds:tag` where `tag` is the first
//! 16 hex characters of `HMAC_SHA256(secret, "fingerprint:unix_seconds")`.
//! The webhook side verifies the tag in constant time and enforces a
//! freshness window. Verification fails closed.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Signed identifiers older (or newer) than this are refused.
pub const FRESHNESS_WINDOW_SECS: i64 = 600;

const TAG_HEX_LEN: usize = 16;
const FINGERPRINT_HEX_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("malformed machine identifier")]
    Malformed,
    #[error("machine identifier timestamp outside freshness window")]
    Stale,
    #[error("machine identifier signature mismatch")]
    BadSignature,
}

// ── Fingerprint ──────────────────────────────────────────────

/// Derive the stable 32-hex machine fingerprint.
///
/// Hashes hostname, username, platform, the OS machine-id file (where
/// present), the hardware UUID (where obtainable), and the home
/// directory. Stable across invocations on the same machine and user.
pub fn fingerprint() -> String {
    let mut hasher = Sha256::new();
    hasher.update(hostname().as_bytes());
    hasher.update(b"|");
    hasher.update(username().as_bytes());
    hasher.update(b"|");
    hasher.update(std::env::consts::OS.as_bytes());
    hasher.update(b"|");
    hasher.update(std::env::consts::ARCH.as_bytes());
    hasher.update(b"|");
    hasher.update(os_machine_id().as_bytes());
    hasher.update(b"|");
    hasher.update(hardware_uuid().as_bytes());
    hasher.update(b"|");
    hasher.update(home_dir().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..FINGERPRINT_HEX_LEN].to_string()
}

fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let name = contents.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "unknown-host".to_string()
}

fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown-user".to_string())
}

fn os_machine_id() -> String {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let id = contents.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    String::new()
}

#[cfg(target_os = "linux")]
fn hardware_uuid() -> String {
    std::fs::read_to_string("/sys/class/dmi/id/product_uuid")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[cfg(target_os = "macos")]
fn hardware_uuid() -> String {
    let output = std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output();
    if let Ok(out) = output {
        let text = String::from_utf8_lossy(&out.stdout);
        for line in text.lines() {
            if line.contains("IOPlatformUUID") {
                if let Some(uuid) = line.split('"').nth(3) {
                    return uuid.to_string();
                }
            }
        }
    }
    String::new()
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn hardware_uuid() -> String {
    String::new()
}

fn home_dir() -> String {
    dirs::home_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ── Sign / verify ────────────────────────────────────────────

fn hmac_tag(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    let tag = hex::encode(mac.finalize().into_bytes());
    tag[..TAG_HEX_LEN].to_string()
}

/// Produce a signed machine identifier valid for the freshness window.
pub fn sign(fingerprint: &str, secret: &str) -> String {
    sign_at(fingerprint, secret, chrono::Utc::now().timestamp())
}

fn sign_at(fingerprint: &str, secret: &str, unix_seconds: i64) -> String {
    let message = format!("{fingerprint}:{unix_seconds}");
    let tag = hmac_tag(secret, &message);
    format!("{message}:{tag}")
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Verify a signed identifier and recover the fingerprint.
///
/// With no secret provisioned the check degrades to a 32-hex format
/// check on the fingerprint part (compatibility fallback, logged by the
/// caller). Everything else fails closed.
pub fn verify(signed: &str, secret: Option<&str>) -> Result<String, IdentityError> {
    verify_at(signed, secret, chrono::Utc::now().timestamp())
}

fn verify_at(signed: &str, secret: Option<&str>, now: i64) -> Result<String, IdentityError> {
    let Some(secret) = secret else {
        // Compatibility fallback: bare fingerprint or signed form, format only.
        let fp = signed.split(':').next().unwrap_or_default();
        if fp.len() == FINGERPRINT_HEX_LEN && is_hex(fp) {
            return Ok(fp.to_string());
        }
        return Err(IdentityError::Malformed);
    };

    let parts: Vec<&str> = signed.split(':').collect();
    if parts.len() != 3 {
        return Err(IdentityError::Malformed);
    }
    let (fp, ts_str, tag) = (parts[0], parts[1], parts[2]);
    if fp.len() != FINGERPRINT_HEX_LEN || !is_hex(fp) {
        return Err(IdentityError::Malformed);
    }
    let ts: i64 = ts_str.parse().map_err(|_| IdentityError::Malformed)?;
    if (now - ts).abs() > FRESHNESS_WINDOW_SECS {
        return Err(IdentityError::Stale);
    }

    let expected = hmac_tag(secret, &format!("{fp}:{ts}"));
    if expected.as_bytes().ct_eq(tag.as_bytes()).into() {
        Ok(fp.to_string())
    } else {
        Err(IdentityError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-shared-secret";

    fn fp() -> String {
        "0123456789abcdef0123456789abcdef".to_string()
    }

    #[test]
    fn fingerprint_is_stable_and_32_hex() {
        let a = fingerprint();
        let b = fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(is_hex(&a));
    }

    #[test]
    fn sign_then_verify_recovers_fingerprint() {
        let signed = sign_at(&fp(), SECRET, 1_700_000_000);
        let recovered = verify_at(&signed, Some(SECRET), 1_700_000_000 + 30).unwrap();
        assert_eq!(recovered, fp());
    }

    #[test]
    fn verify_accepts_anywhere_inside_freshness_window() {
        let signed = sign_at(&fp(), SECRET, 1_700_000_000);
        assert!(verify_at(&signed, Some(SECRET), 1_700_000_000 + FRESHNESS_WINDOW_SECS).is_ok());
        assert!(verify_at(&signed, Some(SECRET), 1_700_000_000 - FRESHNESS_WINDOW_SECS).is_ok());
    }

    #[test]
    fn verify_rejects_stale_timestamp() {
        let signed = sign_at(&fp(), SECRET, 1_700_000_000);
        let err = verify_at(&signed, Some(SECRET), 1_700_000_000 + FRESHNESS_WINDOW_SECS + 1)
            .unwrap_err();
        assert_eq!(err, IdentityError::Stale);
    }

    #[test]
    fn verify_rejects_mutated_tag() {
        let signed = sign_at(&fp(), SECRET, 1_700_000_000);
        let mut chars: Vec<char> = signed.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '0' { '1' } else { '0' };
        let tampered: String = chars.into_iter().collect();
        assert_eq!(
            verify_at(&tampered, Some(SECRET), 1_700_000_000),
            Err(IdentityError::BadSignature)
        );
    }

    #[test]
    fn verify_rejects_byte_flipped_timestamp() {
        let signed = sign_at(&fp(), SECRET, 1_700_000_000);
        let tampered = signed.replace(":1700000000:", ":1700000001:");
        assert_ne!(tampered, signed);
        assert_eq!(
            verify_at(&tampered, Some(SECRET), 1_700_000_000),
            Err(IdentityError::BadSignature)
        );
    }

    #[test]
    fn verify_rejects_foreign_secret() {
        let signed = sign_at(&fp(), "other-secret", 1_700_000_000);
        assert_eq!(
            verify_at(&signed, Some(SECRET), 1_700_000_000),
            Err(IdentityError::BadSignature)
        );
    }

    #[test]
    fn verify_rejects_malformed_shapes() {
        for bad in ["", "abc", "a:b", "a:b:c:d", "zz:1700000000:aaaa"] {
            assert_eq!(
                verify_at(bad, Some(SECRET), 1_700_000_000),
                Err(IdentityError::Malformed),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn missing_secret_degrades_to_format_check() {
        assert_eq!(verify_at(&fp(), None, 0).unwrap(), fp());
        let signed = sign_at(&fp(), SECRET, 1_700_000_000);
        assert_eq!(verify_at(&signed, None, 0).unwrap(), fp());
        assert!(verify_at("not-hex", None, 0).is_err());
    }

    #[test]
    fn signed_form_has_three_parts_and_16_hex_tag() {
        let signed = sign_at(&fp(), SECRET, 1_700_000_000);
        let parts: Vec<&str> = signed.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], fp());
        assert_eq!(parts[1], "1700000000");
        assert_eq!(parts[2].len(), 16);
        assert!(is_hex(parts[2]));
    }
}
