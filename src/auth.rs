//! Device request authentication.
//!
//! Every protocol request runs the same gate: load the device, refuse
//! revoked ones, verify the canonical-request signature against the
//! device's live keys, then claim the nonce. The nonce claim comes last so
//! traffic that cannot even produce a valid signature never consumes
//! replay-guard state.

use crate::error::ProtocolError;
use crate::keystore::DeviceKeyStore;
use crate::metrics;
use crate::model::Device;
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::TrustStore;
use crate::replay::{ReplayError, ReplayGuard};
use crate::signer::{self, SigningInput};
use actix_web::HttpRequest;
use std::sync::Arc;
use tracing::debug;

pub const HEADER_DEVICE_ID: &str = "X-Device-Id";
pub const HEADER_NONCE: &str = "X-Nonce";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Signature";

/// The four auth headers, extracted verbatim. The timestamp stays a string
/// here; parsing happens inside the replay guard so the signed bytes and
/// the verified bytes are identical.
#[derive(Debug, Clone)]
pub struct AuthHeaders {
    pub device_id: String,
    pub nonce: String,
    pub timestamp: String,
    pub signature: String,
}

impl AuthHeaders {
    pub fn from_request(req: &HttpRequest) -> Result<Self, ProtocolError> {
        let header = |name: &str| -> Result<String, ProtocolError> {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    debug!(header = name, "Missing or unreadable auth header");
                    metrics::inc_auth_failures();
                    ProtocolError::AuthenticationFailed
                })
        };
        Ok(Self {
            device_id: header(HEADER_DEVICE_ID)?,
            nonce: header(HEADER_NONCE)?,
            timestamp: header(HEADER_TIMESTAMP)?,
            signature: header(HEADER_SIGNATURE)?,
        })
    }
}

/// Front gate shared by the poll and ack handlers.
pub struct DeviceAuthenticator {
    store: Arc<TrustStore>,
    keystore: Arc<DeviceKeyStore>,
    replay: Arc<ReplayGuard>,
}

impl DeviceAuthenticator {
    pub fn new(
        store: Arc<TrustStore>,
        keystore: Arc<DeviceKeyStore>,
        replay: Arc<ReplayGuard>,
    ) -> Self {
        Self {
            store,
            keystore,
            replay,
        }
    }

    /// Run the full gate for one request. Returns the authenticated device
    /// on success; every failure maps to the coarse taxonomy in
    /// [`ProtocolError`].
    pub async fn authenticate(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        headers: &AuthHeaders,
    ) -> Result<Device, ProtocolError> {
        let device = self.store.load_device(&headers.device_id)?.ok_or_else(|| {
            metrics::inc_auth_failures();
            ProtocolError::UnknownDevice(headers.device_id.clone())
        })?;

        if device.revoked {
            metrics::inc_auth_failures();
            return Err(ProtocolError::DeviceRevoked(device.device_id));
        }

        let input = SigningInput {
            method,
            path,
            body,
            device_id: &headers.device_id,
            nonce: &headers.nonce,
            timestamp: &headers.timestamp,
        };
        // During a rotation grace window the device may still sign with the
        // superseded key, so try every live version (at most two)
        let mut verified = false;
        for key in self.keystore.live_keys(&device.device_id)? {
            let material = key.material().map_err(|_| {
                StoreError::Integrity(format!(
                    "key v{} for device {} is not valid base64",
                    key.version, key.device_id
                ))
            })?;
            if signer::verify(&input, &material, &headers.signature) {
                verified = true;
                break;
            }
        }
        if !verified {
            metrics::inc_auth_failures();
            return Err(ProtocolError::AuthenticationFailed);
        }

        if let Err(err) = self
            .replay
            .check_and_record(&headers.device_id, &headers.nonce, &headers.timestamp)
            .await
        {
            if !matches!(err, ReplayError::Store(_)) {
                metrics::inc_replay_rejections();
            }
            return Err(ProtocolError::Replay(err));
        }

        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_header_extraction() {
        let req = TestRequest::default()
            .insert_header((HEADER_DEVICE_ID, "dev-1"))
            .insert_header((HEADER_NONCE, "n-1"))
            .insert_header((HEADER_TIMESTAMP, "2026-01-15T10:30:00Z"))
            .insert_header((HEADER_SIGNATURE, "c2ln"))
            .to_http_request();

        let headers = AuthHeaders::from_request(&req).unwrap();
        assert_eq!(headers.device_id, "dev-1");
        assert_eq!(headers.nonce, "n-1");
        assert_eq!(headers.timestamp, "2026-01-15T10:30:00Z");
        assert_eq!(headers.signature, "c2ln");
    }

    #[test]
    fn test_any_missing_header_is_auth_failure() {
        let req = TestRequest::default()
            .insert_header((HEADER_DEVICE_ID, "dev-1"))
            .insert_header((HEADER_NONCE, "n-1"))
            .insert_header((HEADER_TIMESTAMP, "2026-01-15T10:30:00Z"))
            .to_http_request();

        let err = AuthHeaders::from_request(&req).unwrap_err();
        assert!(matches!(err, ProtocolError::AuthenticationFailed));
    }
}
