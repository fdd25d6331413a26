//! Per-device symmetric key lifecycle.
//!
//! Each device owns a private derivation seed, generated at registration and
//! never sent anywhere. Every key version is HMAC-SHA256(seed, salt ‖
//! version) with a fresh random salt, so versions are independent of each
//! other and the stored material never equals the seed itself. The same
//! 32-byte material backs both request signing (HMAC) and envelope
//! encryption (AES-256-GCM).
//!
//! Versions are arena-style rows: rotation writes a new open-ended row and
//! stamps the superseded one with `expires_at = now + grace`, giving
//! in-flight envelopes a window where both keys still work. Expired rows
//! linger read-only until the retention window passes, then the sweeper
//! purges them.

use crate::context::GatewayContext;
use crate::model::{Device, DeviceKey, SecretSeed};
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::TrustStore;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Duration;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::sync::Arc;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

const SEED_LEN: usize = 32;
const SALT_LEN: usize = 16;

pub struct DeviceKeyStore {
    store: Arc<TrustStore>,
    ctx: GatewayContext,
    rotation_grace_secs: i64,
    retention_secs: i64,
}

impl DeviceKeyStore {
    pub fn new(
        store: Arc<TrustStore>,
        ctx: GatewayContext,
        rotation_grace_secs: i64,
        retention_secs: i64,
    ) -> Self {
        Self {
            store,
            ctx,
            rotation_grace_secs,
            retention_secs,
        }
    }

    fn derive_material(seed: &[u8], salt: &[u8], version: u32) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(seed).expect("HMAC accepts any key length");
        mac.update(salt);
        mac.update(&version.to_be_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    fn mint_key(&self, device_id: &str, seed: &SecretSeed, version: u32) -> Result<DeviceKey, StoreError> {
        let seed_bytes = seed.bytes().map_err(|_| {
            StoreError::Integrity(format!("stored seed for device {} is not valid base64", device_id))
        })?;
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let material = Self::derive_material(&seed_bytes, &salt, version);
        Ok(DeviceKey {
            device_id: device_id.to_string(),
            version,
            material_b64: BASE64.encode(material),
            created_at: self.ctx.time.now(),
            expires_at: None,
        })
    }

    /// Create a device for a tenant and issue its first key, atomically.
    pub fn register(&self, client_id: &str) -> Result<(Device, DeviceKey), StoreError> {
        let mut seed_bytes = [0u8; SEED_LEN];
        OsRng.fill_bytes(&mut seed_bytes);

        let device = Device {
            device_id: self.ctx.id.new_id(),
            client_id: client_id.to_string(),
            seed: SecretSeed::from_bytes(&seed_bytes),
            revoked: false,
            created_at: self.ctx.time.now(),
            revoked_at: None,
        };
        let key = self.mint_key(&device.device_id, &device.seed, 1)?;

        self.store.commit_registration(&device, &key)?;
        info!(
            device_id = %device.device_id,
            client_id = %device.client_id,
            "🔑 Device registered with key v1"
        );
        Ok((device, key))
    }

    /// Issue the next key version and start the grace countdown on the
    /// superseded current key.
    pub fn rotate(&self, device: &Device) -> Result<DeviceKey, StoreError> {
        let now = self.ctx.time.now();
        let keys = self.store.load_device_keys(&device.device_id)?;
        let next_version = keys.iter().map(|k| k.version).max().unwrap_or(0) + 1;

        let new_key = self.mint_key(&device.device_id, &device.seed, next_version)?;
        let superseded = keys
            .into_iter()
            .filter(|k| !k.is_expired(now))
            .max_by_key(|k| k.version)
            .map(|mut old| {
                old.expires_at = Some(now + Duration::seconds(self.rotation_grace_secs));
                old
            });

        self.store.commit_rotation(&new_key, superseded.as_ref())?;
        info!(
            device_id = %device.device_id,
            version = new_key.version,
            grace_secs = self.rotation_grace_secs,
            "🔑 Device key rotated"
        );
        Ok(new_key)
    }

    /// Mark the device revoked and expire every live key immediately.
    pub fn revoke(&self, device: &Device) -> Result<Device, StoreError> {
        let now = self.ctx.time.now();
        let mut revoked = device.clone();
        revoked.revoked = true;
        revoked.revoked_at = Some(now);

        let expired: Vec<DeviceKey> = self
            .store
            .load_device_keys(&device.device_id)?
            .into_iter()
            .filter(|k| !k.is_expired(now))
            .map(|mut k| {
                k.expires_at = Some(now);
                k
            })
            .collect();

        self.store.commit_revocation(&revoked, &expired)?;
        info!(device_id = %device.device_id, "🚫 Device revoked");
        Ok(revoked)
    }

    /// Keys a request from this device may currently authenticate or
    /// decrypt with: the current key first, then the immediately-prior one
    /// while its grace window is open. Never more than two.
    pub fn live_keys(&self, device_id: &str) -> Result<Vec<DeviceKey>, StoreError> {
        let now = self.ctx.time.now();
        let mut keys: Vec<DeviceKey> = self
            .store
            .load_device_keys(device_id)?
            .into_iter()
            .filter(|k| !k.is_expired(now))
            .collect();
        keys.sort_by(|a, b| b.version.cmp(&a.version));
        keys.truncate(2);
        Ok(keys)
    }

    /// The single key new envelopes are encrypted under, if the device has
    /// any live key at all.
    pub fn current(&self, device_id: &str) -> Result<Option<DeviceKey>, StoreError> {
        Ok(self.live_keys(device_id)?.into_iter().next())
    }

    /// Drop key versions whose expiry is older than the retention window.
    /// Called from the background sweeper task.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let cutoff = self.ctx.time.now() - Duration::seconds(self.retention_secs);
        self.store.purge_device_keys_expired_before(cutoff)
    }
}
