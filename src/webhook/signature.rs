//! HMAC-SHA256 webhook signing (spec §4.6, §8 invariant 6).

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::{GatewayError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Computes `HMAC-SHA256(secret, timestamp + "\n" + body)`, hex-encoded.
pub fn sign(secret: &str, timestamp_unix: i64, body: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Internal(format!("invalid HMAC key: {e}")))?;
    mac.update(timestamp_unix.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify(secret: &str, timestamp_unix: i64, body: &str, signature: &str) -> Result<bool> {
    let expected = sign(secret, timestamp_unix, body)?;
    Ok(constant_time_eq(expected.as_bytes(), signature.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let sig = sign("shh", 1_700_000_000, r#"{"event":"payment.confirmed"}"#).unwrap();
        assert!(verify("shh", 1_700_000_000, r#"{"event":"payment.confirmed"}"#, &sig).unwrap());
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let sig = sign("shh", 1_700_000_000, "original").unwrap();
        assert!(!verify("shh", 1_700_000_000, "tampered", &sig).unwrap());
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let sig = sign("shh", 1_700_000_000, "body").unwrap();
        assert!(!verify("other", 1_700_000_000, "body", &sig).unwrap());
    }
}
