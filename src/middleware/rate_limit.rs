//! Store-backed rate limiter for the callback endpoints.
//!
//! The window lives in the shared store so every webhook instance
//! draws from one budget. Store failures are fail-open: availability
//! of the approval path beats limiter strictness.

use std::time::Duration;

use axum::http::HeaderMap;

use crate::errors::AppError;
use crate::store::RestStore;

/// Rolling window length.
pub const WINDOW: Duration = Duration::from_secs(60);
/// Requests allowed per identifier per window.
pub const MAX_PER_WINDOW: u64 = 30;

/// Record this request against the caller and refuse once the budget is
/// exhausted. Request #31 inside the window sees 429.
pub async fn check(store: &RestStore, headers: &HeaderMap) -> Result<(), AppError> {
    let identifier = client_identifier(headers);

    if let Err(e) = store.insert_rate_limit_event(&identifier).await {
        tracing::warn!("rate-limit insert failed (fail-open): {e:#}");
        return Ok(());
    }

    match store.count_rate_limit_events(&identifier, WINDOW).await {
        Ok(count) if count > MAX_PER_WINDOW => {
            tracing::warn!(%identifier, count, "rate limit exceeded");
            Err(AppError::RateLimited)
        }
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::warn!("rate-limit count failed (fail-open): {e:#}");
            Ok(())
        }
    }
}

/// Caller identifier from edge-origin headers, in documented order:
/// connecting-IP, real-IP, then the last hop of forwarded-for.
pub fn client_identifier(headers: &HeaderMap) -> String {
    if let Some(ip) = header_str(headers, "cf-connecting-ip") {
        return ip.to_string();
    }
    if let Some(ip) = header_str(headers, "x-real-ip") {
        return ip.to_string();
    }
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(last_hop) = forwarded.split(',').next_back() {
            let last_hop = last_hop.trim();
            if !last_hop.is_empty() {
                return last_hop.to_string();
            }
        }
    }
    "unknown".to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn connecting_ip_wins() {
        let h = headers(&[
            ("cf-connecting-ip", "1.1.1.1"),
            ("x-real-ip", "2.2.2.2"),
            ("x-forwarded-for", "3.3.3.3, 4.4.4.4"),
        ]);
        assert_eq!(client_identifier(&h), "1.1.1.1");
    }

    #[test]
    fn real_ip_is_second() {
        let h = headers(&[
            ("x-real-ip", "2.2.2.2"),
            ("x-forwarded-for", "3.3.3.3, 4.4.4.4"),
        ]);
        assert_eq!(client_identifier(&h), "2.2.2.2");
    }

    #[test]
    fn forwarded_for_uses_last_hop() {
        let h = headers(&[("x-forwarded-for", "3.3.3.3, 4.4.4.4")]);
        assert_eq!(client_identifier(&h), "4.4.4.4");
    }

    #[test]
    fn missing_headers_fall_back_to_unknown() {
        assert_eq!(client_identifier(&HeaderMap::new()), "unknown");
    }
}
