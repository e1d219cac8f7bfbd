use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::types::Provider;

type HmacSha256 = Hmac<Sha256>;

/// Outcome of checking a provider signature. Malformed input is always [`SignatureVerdict::Invalid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVerdict {
    Valid,
    Invalid,
}

impl SignatureVerdict {
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl From<bool> for SignatureVerdict {
    fn from(valid: bool) -> Self {
        if valid {
            Self::Valid
        } else {
            Self::Invalid
        }
    }
}

/// Verifies provider webhook signatures.
#[derive(Debug, Clone, Copy)]
pub struct SignatureVerifier {
    tolerance_secs: i64,
}

impl SignatureVerifier {
    pub fn new(tolerance_secs: i64) -> Self {
        Self { tolerance_secs }
    }

    /// Checks `header` against `body` using the provider's scheme.
    ///
    /// A missing secret means the provider is not configured and every signature is rejected.
    pub fn verify(
        &self,
        provider: Provider,
        secret: Option<&str>,
        header: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> SignatureVerdict {
        let (Some(secret), Some(header)) = (secret, header) else {
            return SignatureVerdict::Invalid;
        };
        if secret.is_empty() {
            return SignatureVerdict::Invalid;
        }

        let valid = match provider {
            Provider::Stripe => self.verify_stripe(secret, header, body, now),
            Provider::PayPal => verify_hex(secret.as_bytes(), &[body], header.trim()),
            Provider::Custom => header
                .trim()
                .strip_prefix("sha256=")
                .map(|hex_part| verify_hex(secret.as_bytes(), &[body], hex_part))
                .unwrap_or(false),
        };
        valid.into()
    }

    fn verify_stripe(&self, secret: &str, header: &str, body: &[u8], now: DateTime<Utc>) -> bool {
        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let Some(raw_timestamp) = timestamp else {
            return false;
        };
        let Ok(seconds) = raw_timestamp.parse::<i64>() else {
            return false;
        };
        if !within_tolerance(now.timestamp(), seconds, self.tolerance_secs) {
            return false;
        }

        let prefix = format!("{raw_timestamp}.");
        let mut matched = false;
        for candidate in candidates {
            // Evaluate every candidate so timing does not reveal which one matched.
            matched |= verify_hex(secret.as_bytes(), &[prefix.as_bytes(), body], candidate);
        }
        matched
    }
}

/// Whether `timestamp` lies within `tolerance_secs` of `now`, for any pair of inputs.
pub fn within_tolerance(now: i64, timestamp: i64, tolerance_secs: i64) -> bool {
    tolerance_secs >= 0 && now.abs_diff(timestamp) <= tolerance_secs.unsigned_abs()
}

/// Hex-encoded HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_hex(secret: &[u8], parts: &[&[u8]]) -> String {
    hex::encode(hmac_bytes(secret, parts))
}

/// Constant-time comparison of `provided_hex` with the HMAC of `parts`.
pub fn verify_hex(secret: &[u8], parts: &[&[u8]], provided_hex: &str) -> bool {
    let Ok(provided) = hex::decode(provided_hex) else {
        return false;
    };
    let expected = hmac_bytes(secret, parts);
    expected.as_slice().ct_eq(provided.as_slice()).into()
}

fn hmac_bytes(secret: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// Builds a `stripe-signature` header value.
pub fn stripe_signature_header(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let prefix = format!("{timestamp}.");
    let signature = hmac_hex(secret.as_bytes(), &[prefix.as_bytes(), body]);
    format!("t={timestamp},v1={signature}")
}

/// Builds an `x-signature` header value for custom webhooks.
pub fn custom_signature_header(secret: &str, body: &[u8]) -> String {
    format!("sha256={}", hmac_hex(secret.as_bytes(), &[body]))
}
