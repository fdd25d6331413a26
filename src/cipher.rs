//! AES-256-GCM envelope for delivered signal batches.
//!
//! Each envelope is encrypted with a per-device key version and carries the
//! version in cleartext so the device can pick the matching key during a
//! rotation grace window. The AAD binds the ciphertext to the device and the
//! delivery context; an envelope replayed to a different device fails
//! authentication even if the keys were somehow shared.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// AES-GCM standard nonce length.
const NONCE_LEN: usize = 12;
/// AES-256 key length.
const KEY_LEN: usize = 32;
/// Envelope wire version.
const ENVELOPE_VERSION: u8 = 1;

/// Delivery context folded into the AAD for poll responses.
pub const CONTEXT_POLL_BATCH: &str = "poll-batch";

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("key material must be {KEY_LEN} bytes, got {0}")]
    BadKeyLength(usize),
    #[error("envelope field is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("nonce must be {NONCE_LEN} bytes, got {0}")]
    BadNonceLength(usize),
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
}

/// Wire form of an encrypted payload. The GCM tag rides inside the
/// ciphertext; only the nonce and key version travel in clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherEnvelope {
    pub v: u8,
    pub key_version: u32,
    pub nonce_b64: String,
    pub ciphertext_b64: String,
}

fn build_aad(device_id: &str, context: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(device_id.len() + context.len() + 1);
    aad.extend_from_slice(device_id.as_bytes());
    aad.push(b'|');
    aad.extend_from_slice(context.as_bytes());
    aad
}

/// Encrypt `plaintext` for one device under one key version.
///
/// A fresh random nonce is drawn per call; reusing a nonce under the same
/// key would break GCM, so there is no caller-supplied nonce path.
pub fn encrypt(
    key: &[u8],
    key_version: u32,
    device_id: &str,
    context: &str,
    plaintext: &[u8],
) -> Result<CipherEnvelope, CipherError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::BadKeyLength(key.len()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let aad = build_aad(device_id, context);
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| CipherError::EncryptionFailed)?;

    Ok(CipherEnvelope {
        v: ENVELOPE_VERSION,
        key_version,
        nonce_b64: BASE64.encode(nonce_bytes),
        ciphertext_b64: BASE64.encode(ciphertext),
    })
}

/// Decrypt an envelope with one candidate key. Fails closed: any tag or AAD
/// mismatch surfaces as `DecryptionFailed` with no plaintext.
pub fn decrypt(
    key: &[u8],
    device_id: &str,
    context: &str,
    envelope: &CipherEnvelope,
) -> Result<Vec<u8>, CipherError> {
    if envelope.v != ENVELOPE_VERSION {
        return Err(CipherError::UnsupportedVersion(envelope.v));
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::BadKeyLength(key.len()))?;

    let nonce_bytes = BASE64.decode(&envelope.nonce_b64)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(CipherError::BadNonceLength(nonce_bytes.len()));
    }
    let ciphertext = BASE64.decode(&envelope.ciphertext_b64)?;

    let aad = build_aad(device_id, context);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CipherError::DecryptionFailed)
}
