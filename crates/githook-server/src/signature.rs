//! Webhook signature verification.
//!
//! All comparisons are constant-time; a flipped bit anywhere in the
//! body or the header must fail without leaking position.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// Verify a `sha256=<hex>` HMAC-SHA-256 signature over `body`.
#[must_use]
pub fn verify_sha256(body: &[u8], header: &str, secret: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    computed.as_slice().ct_eq(&signature).into()
}

/// Verify GitHub's legacy `sha1=<hex>` HMAC-SHA-1 signature.
#[must_use]
pub fn verify_sha1(body: &[u8], header: &str, secret: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("sha1=") else {
        return false;
    };
    let Ok(signature) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    computed.as_slice().ct_eq(&signature).into()
}

/// Constant-time equality for shared-secret headers (GitLab).
#[must_use]
pub fn verify_token(header: &str, secret: &str) -> bool {
    header.as_bytes().ct_eq(secret.as_bytes()).into()
}

/// Compute the `sha256=<hex>` header value for `body`. Used by tests
/// and the redelivery tool.
#[must_use]
pub fn sign_sha256(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_round_trip() {
        let body = br#"{"action":"opened"}"#;
        let header = sign_sha256(body, "s3cret");
        assert!(verify_sha256(body, &header, "s3cret"));
        assert!(!verify_sha256(body, &header, "wrong"));
    }

    #[test]
    fn flipped_bit_fails() {
        let body = b"payload-bytes";
        let header = sign_sha256(body, "k");
        let mut tampered = body.to_vec();
        tampered[0] ^= 1;
        assert!(!verify_sha256(&tampered, &header, "k"));
    }

    #[test]
    fn malformed_headers_fail_closed() {
        let body = b"x";
        assert!(!verify_sha256(body, "sha256=zz-not-hex", "k"));
        assert!(!verify_sha256(body, "sha1=abcd", "k"));
        assert!(!verify_sha256(body, "", "k"));
        assert!(!verify_sha1(body, "sha256=abcd", "k"));
    }

    #[test]
    fn token_compare() {
        assert!(verify_token("tok", "tok"));
        assert!(!verify_token("tok", "tik"));
        assert!(!verify_token("", "tok"));
    }
}
