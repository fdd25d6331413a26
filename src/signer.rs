//! Canonical-request signing for the device protocol.
//!
//! Every signed request is reduced to a deterministic canonical byte string
//!
//! ```text
//! METHOD|PATH|BODY|DEVICE_ID|NONCE|TIMESTAMP
//! ```
//!
//! and the transported signature is base64(HMAC-SHA256(key, canonical)).
//! The body is the raw request payload (empty for bodyless requests) and the
//! timestamp is the ISO-8601 header value verbatim; re-serializing either
//! would break determinism between signer and verifier.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const FIELD_SEPARATOR: u8 = b'|';

/// Request fields covered by the signature.
#[derive(Debug, Clone, Copy)]
pub struct SigningInput<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub body: &'a [u8],
    pub device_id: &'a str,
    pub nonce: &'a str,
    pub timestamp: &'a str,
}

/// Build the canonical byte string for a request. Deterministic: identical
/// inputs always produce identical output.
pub fn canonical_string(input: &SigningInput<'_>) -> Vec<u8> {
    let mut canonical = Vec::with_capacity(
        input.method.len()
            + input.path.len()
            + input.body.len()
            + input.device_id.len()
            + input.nonce.len()
            + input.timestamp.len()
            + 5,
    );
    canonical.extend_from_slice(input.method.as_bytes());
    canonical.push(FIELD_SEPARATOR);
    canonical.extend_from_slice(input.path.as_bytes());
    canonical.push(FIELD_SEPARATOR);
    canonical.extend_from_slice(input.body);
    canonical.push(FIELD_SEPARATOR);
    canonical.extend_from_slice(input.device_id.as_bytes());
    canonical.push(FIELD_SEPARATOR);
    canonical.extend_from_slice(input.nonce.as_bytes());
    canonical.push(FIELD_SEPARATOR);
    canonical.extend_from_slice(input.timestamp.as_bytes());
    canonical
}

/// Sign a request with the device key. Returns the base64 signature for the
/// `X-Signature` header.
pub fn sign(input: &SigningInput<'_>, key: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&canonical_string(input));
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verify a transported signature against the canonical string.
///
/// Comparison happens inside `verify_slice`, which is constant-time. Every
/// failure path (bad base64, wrong length, byte mismatch) collapses to
/// `false`; callers map that to a generic authentication failure so the
/// response never distinguishes a wrong key from a tampered body.
pub fn verify(input: &SigningInput<'_>, key: &[u8], signature_b64: &str) -> bool {
    let Ok(sig_bytes) = BASE64.decode(signature_b64.as_bytes()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&canonical_string(input));
    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input<'a>(body: &'a [u8], nonce: &'a str) -> SigningInput<'a> {
        SigningInput {
            method: "GET",
            path: "/poll",
            body,
            device_id: "dev-123",
            nonce,
            timestamp: "2026-01-15T10:30:00Z",
        }
    }

    #[test]
    fn test_canonical_string_layout() {
        let input = sample_input(b"", "n-1");
        let canonical = canonical_string(&input);
        assert_eq!(
            canonical,
            b"GET|/poll||dev-123|n-1|2026-01-15T10:30:00Z".to_vec()
        );
    }

    #[test]
    fn test_sign_is_deterministic() {
        let input = sample_input(b"{\"approval_id\":\"a-1\"}", "nonce-77");
        let key = b"device-key-material";
        let first = sign(&input, key);
        let second = sign(&input, key);
        assert_eq!(first, second);
        // 32-byte MAC -> 44 base64 chars
        assert_eq!(first.len(), 44);
    }

    #[test]
    fn test_roundtrip_verifies() {
        let input = sample_input(b"payload", "nonce-1");
        let key = b"k1";
        let sig = sign(&input, key);
        assert!(verify(&input, key, &sig));
    }

    #[test]
    fn test_any_field_change_breaks_verification() {
        let key = b"k1";
        let sig = sign(&sample_input(b"payload", "nonce-1"), key);

        assert!(!verify(&sample_input(b"payloae", "nonce-1"), key, &sig));
        assert!(!verify(&sample_input(b"payload", "nonce-2"), key, &sig));

        let mut moved = sample_input(b"payload", "nonce-1");
        moved.path = "/ack";
        assert!(!verify(&moved, key, &sig));

        let mut late = sample_input(b"payload", "nonce-1");
        late.timestamp = "2026-01-15T10:30:01Z";
        assert!(!verify(&late, key, &sig));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let input = sample_input(b"", "nonce-1");
        let sig = sign(&input, b"right-key");
        assert!(!verify(&input, b"wrong-key", &sig));
    }

    #[test]
    fn test_garbage_signature_rejected() {
        let input = sample_input(b"", "nonce-1");
        assert!(!verify(&input, b"key", "not-base64!@#$"));
        assert!(!verify(&input, b"key", ""));
        // Valid base64 of the wrong length is still a hard reject
        assert!(!verify(&input, b"key", &BASE64.encode(b"short")));
    }
}
