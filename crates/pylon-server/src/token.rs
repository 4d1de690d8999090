//! Signed admin bearer tokens.
//!
//! A token is `base64url(payload).base64url(hmac-sha256(secret, payload))`
//! where the payload is a small JSON document carrying the expiry. Stateless
//! by design: restarting the server keeps issued tokens valid until their
//! TTL runs out, and there is nothing to persist or revoke.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    /// Expiry, seconds since the Unix epoch.
    exp: i64,
}

/// Issues and verifies admin tokens with a fixed secret and TTL.
#[derive(Clone)]
pub struct AdminTokens {
    secret: String,
    ttl_secs: u64,
}

impl AdminTokens {
    pub fn new(secret: String, ttl_secs: u64) -> Self {
        Self { secret, ttl_secs }
    }

    fn mac(&self) -> HmacSha256 {
        // An HMAC accepts keys of any length.
        HmacSha256::new_from_slice(self.secret.as_bytes()).expect("hmac accepts any key length")
    }

    /// Issues a fresh token; returns the token and its expiry.
    pub fn issue(&self, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
        let expires_at = now + chrono::Duration::seconds(self.ttl_secs as i64);
        let claims = TokenClaims {
            exp: expires_at.timestamp(),
        };
        let payload =
            serde_json::to_vec(&claims).expect("token claims serialization is infallible");

        let mut mac = self.mac();
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();

        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature)
        );
        (token, expires_at)
    }

    /// Verifies signature and expiry. Returns `false` for anything
    /// malformed, tampered with, or past its expiry.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> bool {
        let Some((payload_b64, signature_b64)) = token.split_once('.') else {
            return false;
        };
        let Ok(payload) = URL_SAFE_NO_PAD.decode(payload_b64) else {
            return false;
        };
        let Ok(signature) = URL_SAFE_NO_PAD.decode(signature_b64) else {
            return false;
        };

        let mut mac = self.mac();
        mac.update(&payload);
        if mac.verify_slice(&signature).is_err() {
            return false;
        }

        let Ok(claims) = serde_json::from_slice::<TokenClaims>(&payload) else {
            return false;
        };
        match Utc.timestamp_opt(claims.exp, 0).single() {
            Some(expires_at) => now < expires_at,
            None => false,
        }
    }
}
