//! Signature-free token inspection.
//!
//! Access tokens are JWT-shaped: three dot-separated base64url segments with a
//! JSON claims object in the middle. Only structure and the `exp` claim are
//! checked here; signatures are the server's business. Anything that does not
//! decode is treated as invalid and already expired.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value};

use crate::clock::{Clock, SystemClock};

/// Decode the claims segment of a token.
#[must_use]
pub fn decode_claims(token: &str) -> Option<Map<String, Value>> {
    let mut segments = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return None;
    };
    if header.is_empty() || payload.is_empty() || signature.is_empty() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Object(claims) => Some(claims),
        _ => None,
    }
}

/// Expiry of the token in epoch milliseconds, from its `exp` claim (seconds).
#[must_use]
pub fn expiration(token: &str) -> Option<i64> {
    let claims = decode_claims(token)?;
    let exp = claims.get("exp")?;
    #[allow(clippy::cast_possible_truncation)]
    let secs = exp
        .as_i64()
        .or_else(|| exp.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))?;
    secs.checked_mul(1000)
}

#[must_use]
pub fn is_valid_token(token: &str) -> bool {
    is_valid_token_at(token, SystemClock.now_ms())
}

#[must_use]
pub fn is_valid_token_at(token: &str, now_ms: i64) -> bool {
    expiration(token).is_some_and(|exp| exp > now_ms)
}

#[must_use]
pub fn is_expiring_soon(token: &str, threshold_secs: u64) -> bool {
    is_expiring_soon_at(token, threshold_secs, SystemClock.now_ms())
}

/// True when the token expires within `threshold_secs`, has already
/// expired, or cannot be decoded.
#[must_use]
pub fn is_expiring_soon_at(token: &str, threshold_secs: u64, now_ms: i64) -> bool {
    is_due_at(expiration(token), threshold_secs, now_ms)
}

/// True when `expires_at` (epoch milliseconds) falls within `threshold_secs`
/// of `now_ms` or is unknown.
#[must_use]
pub fn is_due_at(expires_at: Option<i64>, threshold_secs: u64, now_ms: i64) -> bool {
    let threshold_ms = i64::try_from(threshold_secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    expires_at.is_none_or(|exp| exp.saturating_sub(now_ms) <= threshold_ms)
}


#[cfg(test)]
#[path = "token_test.rs"]
mod tests;
