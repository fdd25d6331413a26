//! Replay prevention: timestamp freshness plus single-use nonces.
//!
//! Freshness and uniqueness are independent checks. The freshness window
//! bounds how old (or future-dated) a signed request may be; the nonce store
//! makes each accepted `(device, nonce)` pair unusable for the nonce TTL.
//! The TTL must stay at least twice the freshness window: by the time a
//! nonce record expires, any request still carrying that nonce is already
//! stale on timestamp alone. `Settings::validate` enforces the ratio.

use crate::context::GatewayContext;
use crate::persistence::redb_store::{RedbStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("timestamp is not valid ISO-8601: {0:?}")]
    MalformedTimestamp(String),
    #[error("timestamp is {0}s old (tolerance {1}s)")]
    StaleTimestamp(i64, i64),
    #[error("timestamp is {0}s in the future (tolerance {1}s)")]
    FutureTimestamp(i64, i64),
    #[error("nonce already used by this device")]
    ReplayedNonce,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Shared nonce state with one required property: the test-and-set must be
/// atomic. Two concurrent requests presenting the same `(device, nonce)`
/// must never both see `true`.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Returns `true` if the pair was unused (now recorded with the given
    /// TTL), `false` if a live record already exists.
    async fn test_and_set(
        &self,
        device_id: &str,
        nonce: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Drop expired records; returns how many were removed.
    async fn purge_expired(&self, now_ms: i64) -> Result<usize, StoreError>;
}

fn nonce_key(device_id: &str, nonce: &str) -> String {
    format!("{}:{}", device_id, nonce)
}

/// Process-local nonce store. The dashmap entry API holds the shard lock
/// across the check and the insert, which is the whole atomicity argument.
#[derive(Default)]
pub struct InMemoryNonceStore {
    records: DashMap<String, i64>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn test_and_set(
        &self,
        device_id: &str,
        nonce: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool, StoreError> {
        let fresh = match self.records.entry(nonce_key(device_id, nonce)) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now_ms {
                    false
                } else {
                    // Previous claim expired; the pair is usable again
                    occupied.insert(now_ms + ttl_ms);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now_ms + ttl_ms);
                true
            }
        };
        Ok(fresh)
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, StoreError> {
        let before = self.records.len();
        self.records.retain(|_, expiry| *expiry > now_ms);
        Ok(before.saturating_sub(self.records.len()))
    }
}

/// Durable nonce store. Survives restarts, so an attacker cannot replay a
/// captured request into the freshness window of a freshly booted server.
pub struct RedbNonceStore {
    store: Arc<RedbStore>,
}

impl RedbNonceStore {
    pub fn new(store: Arc<RedbStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NonceStore for RedbNonceStore {
    async fn test_and_set(
        &self,
        device_id: &str,
        nonce: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool, StoreError> {
        self.store
            .claim_nonce(&nonce_key(device_id, nonce), now_ms, ttl_ms)
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, StoreError> {
        self.store.purge_nonces(now_ms)
    }
}

/// Gate every signed request through timestamp freshness and nonce
/// single-use before any handler logic runs.
pub struct ReplayGuard {
    nonces: Arc<dyn NonceStore>,
    ctx: GatewayContext,
    tolerance_secs: i64,
    nonce_ttl_secs: i64,
}

impl ReplayGuard {
    pub fn new(
        nonces: Arc<dyn NonceStore>,
        ctx: GatewayContext,
        tolerance_secs: i64,
        nonce_ttl_secs: i64,
    ) -> Self {
        Self {
            nonces,
            ctx,
            tolerance_secs,
            nonce_ttl_secs,
        }
    }

    /// Validate the transmitted timestamp and claim the nonce.
    ///
    /// The timestamp is parsed from the header value verbatim; freshness is
    /// judged against the injected clock, so the 299s/301s boundaries are
    /// exact under test. The nonce claim happens only after the timestamp
    /// passes, keeping malformed requests from burning nonce state.
    pub async fn check_and_record(
        &self,
        device_id: &str,
        nonce: &str,
        raw_timestamp: &str,
    ) -> Result<(), ReplayError> {
        let ts = DateTime::parse_from_rfc3339(raw_timestamp)
            .map_err(|_| ReplayError::MalformedTimestamp(raw_timestamp.to_string()))?
            .with_timezone(&Utc);

        let now = self.ctx.time.now();
        let skew_secs = (now - ts).num_seconds();
        if skew_secs > self.tolerance_secs {
            warn!(device_id, skew_secs, "⏱️ Stale request timestamp");
            return Err(ReplayError::StaleTimestamp(skew_secs, self.tolerance_secs));
        }
        if -skew_secs > self.tolerance_secs {
            warn!(device_id, skew_secs, "⏱️ Future-dated request timestamp");
            return Err(ReplayError::FutureTimestamp(
                -skew_secs,
                self.tolerance_secs,
            ));
        }

        let fresh = self
            .nonces
            .test_and_set(
                device_id,
                nonce,
                self.ctx.time.now_millis(),
                self.nonce_ttl_secs * 1_000,
            )
            .await?;
        if !fresh {
            warn!(device_id, nonce, "🔁 Replayed nonce rejected");
            return Err(ReplayError::ReplayedNonce);
        }
        debug!(device_id, nonce, "Nonce claimed");
        Ok(())
    }

    /// Sweep expired nonce records. Called from the background sweeper task.
    pub async fn sweep(&self) -> Result<usize, ReplayError> {
        Ok(self.nonces.purge_expired(self.ctx.time.now_millis()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{SequentialIdProvider, SimulatedTimeProvider};
    use chrono::Duration;

    const START_MS: i64 = 1_760_000_000_000;

    fn guard() -> (ReplayGuard, GatewayContext) {
        let ctx = GatewayContext::new_simulated(START_MS);
        let guard = ReplayGuard::new(
            Arc::new(InMemoryNonceStore::new()),
            ctx.clone(),
            300,
            600,
        );
        (guard, ctx)
    }

    fn ts_offset(ctx: &GatewayContext, offset_secs: i64) -> String {
        (ctx.time.now() + Duration::seconds(offset_secs)).to_rfc3339()
    }

    #[tokio::test]
    async fn test_malformed_timestamp_rejected() {
        let (guard, _ctx) = guard();
        for raw in ["", "not-a-time", "2026-13-40T99:00:00Z", "1760000000"] {
            let err = guard
                .check_and_record("dev-1", "n-1", raw)
                .await
                .unwrap_err();
            assert!(matches!(err, ReplayError::MalformedTimestamp(_)), "{raw}");
        }
    }

    #[tokio::test]
    async fn test_freshness_boundaries_both_directions() {
        let (guard, ctx) = guard();

        let stale_ok = ts_offset(&ctx, -299);
        assert!(guard.check_and_record("dev-1", "n-1", &stale_ok).await.is_ok());

        let stale_bad = ts_offset(&ctx, -301);
        let err = guard
            .check_and_record("dev-1", "n-2", &stale_bad)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::StaleTimestamp(301, 300)));

        let future_ok = ts_offset(&ctx, 299);
        assert!(guard.check_and_record("dev-1", "n-3", &future_ok).await.is_ok());

        let future_bad = ts_offset(&ctx, 301);
        let err = guard
            .check_and_record("dev-1", "n-4", &future_bad)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::FutureTimestamp(301, 300)));
    }

    #[tokio::test]
    async fn test_nonce_single_use_within_ttl() {
        let (guard, ctx) = guard();
        let ts = ts_offset(&ctx, 0);

        assert!(guard.check_and_record("dev-1", "n-1", &ts).await.is_ok());
        let err = guard.check_and_record("dev-1", "n-1", &ts).await.unwrap_err();
        assert!(matches!(err, ReplayError::ReplayedNonce));

        // Same nonce from a different device is an independent pair
        assert!(guard.check_and_record("dev-2", "n-1", &ts).await.is_ok());
    }

    #[tokio::test]
    async fn test_nonce_reusable_after_ttl_but_timestamp_blocks_replay() {
        let clock = Arc::new(SimulatedTimeProvider::new(START_MS));
        let ctx = GatewayContext {
            time: clock.clone(),
            id: Arc::new(SequentialIdProvider::new()),
        };
        let guard = ReplayGuard::new(Arc::new(InMemoryNonceStore::new()), ctx.clone(), 300, 600);

        let original_ts = ctx.time.now().to_rfc3339();
        assert!(guard
            .check_and_record("dev-1", "n-1", &original_ts)
            .await
            .is_ok());

        clock.advance(601_000);

        // The nonce record has lapsed, but a verbatim replay of the captured
        // request now fails on freshness
        let err = guard
            .check_and_record("dev-1", "n-1", &original_ts)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::StaleTimestamp(601, 300)));

        // A fresh request may legitimately reuse the lapsed nonce
        let fresh_ts = ctx.time.now().to_rfc3339();
        assert!(guard.check_and_record("dev-1", "n-1", &fresh_ts).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_record_can_be_reclaimed() {
        let store = InMemoryNonceStore::new();
        assert!(store.test_and_set("dev-1", "n-1", 1_000, 600_000).await.unwrap());
        assert!(!store.test_and_set("dev-1", "n-1", 2_000, 600_000).await.unwrap());
        // Past the expiry the pair is claimable again
        assert!(store
            .test_and_set("dev-1", "n-1", 1_000 + 600_001, 600_000)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sweep_drops_only_expired_records() {
        let store = InMemoryNonceStore::new();
        store.test_and_set("dev-1", "old", 0, 1_000).await.unwrap();
        store.test_and_set("dev-1", "new", 0, 10_000).await.unwrap();

        let removed = store.purge_expired(5_000).await.unwrap();
        assert_eq!(removed, 1);
        // The live record still blocks reuse
        assert!(!store.test_and_set("dev-1", "new", 5_000, 10_000).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_nonce_exactly_one_wins() {
        let store = Arc::new(InMemoryNonceStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.test_and_set("dev-1", "contended", 1_000, 600_000).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
