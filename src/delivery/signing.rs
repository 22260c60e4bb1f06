//! Webhook payload signing
//!
//! Each delivery carries `X-Contract-Signature: sha256=<hex>`, an HMAC-SHA256
//! of the exact body bytes under the subscription secret. Receivers recompute
//! it over the raw body and compare in constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::DeliveryError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Contract-Signature";
pub const DELIVERY_HEADER: &str = "X-Contract-Delivery";
pub const EVENT_HEADER: &str = "X-Contract-Event";
pub const TIMESTAMP_HEADER: &str = "X-Contract-Timestamp";

const PREFIX: &str = "sha256=";

/// Sign `body`, returning the header value
pub fn sign(body: &[u8], secret: &str) -> Result<String, DeliveryError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::Signing(e.to_string()))?;
    mac.update(body);
    Ok(format!("{}{}", PREFIX, hex::encode(mac.finalize().into_bytes())))
}

/// Check a received header value against `body`
pub fn verify(body: &[u8], secret: &str, header: &str) -> bool {
    let Some(encoded) = header.trim().strip_prefix(PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(encoded) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let body = br#"{"action":"proposal.created"}"#;
        let header = sign(body, "s3cret").unwrap();
        assert!(header.starts_with("sha256="));
        assert_eq!(header.len(), PREFIX.len() + 64);
        assert!(verify(body, "s3cret", &header));
        assert!(!verify(body, "other", &header));
        assert!(!verify(b"{}", "s3cret", &header));
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let header = sign(b"what do ya want for nothing?", "Jefe").unwrap();
        assert_eq!(
            header,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_malformed_headers_fail() {
        assert!(!verify(b"x", "k", "md5=abc"));
        assert!(!verify(b"x", "k", "sha256=zz"));
    }
}
