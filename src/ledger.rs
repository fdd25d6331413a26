//! Position bookkeeping derived from acknowledged executions.
//!
//! The ledger never writes execution rows itself. For an ack it derives the
//! position effect (open a new position, or close a prior one with an
//! error), and the gateway commits that effect in the same transaction as
//! the execution record. The close-command path is the one direct mutation.

use crate::context::GatewayContext;
use crate::metrics;
use crate::model::{Approval, ExecutionOutcome, OpenPosition, Signal, decode_owner_levels};
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::TrustStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PositionLedger {
    store: Arc<TrustStore>,
    ctx: GatewayContext,
}

impl PositionLedger {
    pub fn new(store: Arc<TrustStore>, ctx: GatewayContext) -> Self {
        Self { store, ctx }
    }

    /// Derive what one acknowledged execution does to position state.
    ///
    /// Returns `(open, close)`: at most one side is populated. A placed ack
    /// opens a position unless the (approval, device) pair already holds
    /// one; failed and cancelled acks close the pair's position if an open
    /// one exists; an unknown outcome touches nothing.
    pub fn derive_effects(
        &self,
        signal: &Signal,
        approval: &Approval,
        device_id: &str,
        execution_id: &str,
        outcome: &ExecutionOutcome,
    ) -> Result<(Option<OpenPosition>, Option<OpenPosition>), StoreError> {
        match outcome {
            ExecutionOutcome::Placed { .. } => {
                if let Some(existing) = self
                    .store
                    .load_position_for_pair(&approval.approval_id, device_id)?
                {
                    debug!(
                        position_id = %existing.position_id,
                        device_id,
                        "Pair already holds a position; recording execution only"
                    );
                    return Ok((None, None));
                }

                let levels = decode_owner_levels(signal.owner_levels.as_ref());
                if signal.owner_levels.is_some() && levels.is_none() {
                    warn!(
                        signal_id = %signal.signal_id,
                        "Owner levels blob did not decode; opening position without levels"
                    );
                }

                let position = OpenPosition {
                    position_id: self.ctx.id.new_id(),
                    signal_id: signal.signal_id.clone(),
                    approval_id: approval.approval_id.clone(),
                    device_id: device_id.to_string(),
                    execution_id: execution_id.to_string(),
                    client_id: signal.client_id.clone(),
                    instrument: signal.instrument.clone(),
                    side: signal.side,
                    entry_price: signal.price,
                    quantity: signal.quantity,
                    levels,
                    opened_at: self.ctx.time.now(),
                    closed_at: None,
                    close_reason: None,
                };
                Ok((Some(position), None))
            }
            ExecutionOutcome::Failed { error } => {
                let reason = error.as_deref().unwrap_or("failed");
                Ok((None, self.close_for_outcome(approval, device_id, reason)?))
            }
            ExecutionOutcome::Cancelled => {
                Ok((None, self.close_for_outcome(approval, device_id, "cancelled")?))
            }
            ExecutionOutcome::Unknown => Ok((None, None)),
        }
    }

    fn close_for_outcome(
        &self,
        approval: &Approval,
        device_id: &str,
        reason: &str,
    ) -> Result<Option<OpenPosition>, StoreError> {
        let Some(mut position) = self
            .store
            .load_position_for_pair(&approval.approval_id, device_id)?
        else {
            return Ok(None);
        };
        if !position.is_open() {
            return Ok(None);
        }
        position.closed_at = Some(self.ctx.time.now());
        position.close_reason = Some(reason.to_string());
        Ok(Some(position))
    }

    /// Close a position by id (the close-command channel). Closing an
    /// already-closed position is a no-op that returns the stored row, so
    /// operator retries are safe. `None` means the id is unknown.
    pub fn close_position(
        &self,
        position_id: &str,
        reason: Option<&str>,
    ) -> Result<Option<OpenPosition>, StoreError> {
        let Some(mut position) = self.store.load_position(position_id)? else {
            return Ok(None);
        };
        if !position.is_open() {
            debug!(position_id, "Close requested for already-closed position");
            return Ok(Some(position));
        }

        position.closed_at = Some(self.ctx.time.now());
        position.close_reason = reason.map(str::to_string);
        self.store.save_position(&position)?;
        metrics::inc_positions_closed();
        info!(position_id, reason = ?position.close_reason, "📕 Position closed");
        Ok(Some(position))
    }

    /// All positions, optionally narrowed to one tenant.
    pub fn positions(&self, client_id: Option<&str>) -> Result<Vec<OpenPosition>, StoreError> {
        let mut items = self.store.load_positions()?;
        if let Some(client_id) = client_id {
            items.retain(|p| p.client_id == client_id);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Decision, ExecStatus, ExecutionRecord, Side};
    use crate::persistence::redb_store::RedbStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn fixture(tag: &str) -> (PositionLedger, Arc<TrustStore>) {
        let path = std::env::temp_dir().join(format!(
            "beacon-ledger-{}-{}.redb",
            tag,
            uuid::Uuid::new_v4()
        ));
        let store = Arc::new(TrustStore::new(Arc::new(
            RedbStore::new(path).expect("open store"),
        )));
        let ctx = GatewayContext::new_simulated(1_760_000_000_000);
        (PositionLedger::new(store.clone(), ctx), store)
    }

    fn sample_signal(owner_levels: Option<serde_json::Value>) -> Signal {
        Signal {
            signal_id: "s-1".to_string(),
            client_id: "client-a".to_string(),
            instrument: "ETH-USDT".to_string(),
            side: Side::Sell,
            price: dec!(3200),
            quantity: dec!(2),
            leverage: Some(dec!(3)),
            owner_levels,
            decision: Decision::Approved,
            approval_id: Some("apr-1".to_string()),
            created_at: Utc::now(),
        }
    }

    fn sample_approval() -> Approval {
        Approval {
            approval_id: "apr-1".to_string(),
            signal_id: "s-1".to_string(),
            client_id: "client-a".to_string(),
            decided_at: Utc::now(),
        }
    }

    fn placed() -> ExecutionOutcome {
        ExecutionOutcome::Placed {
            broker_ticket: Some("T-1".to_string()),
        }
    }

    fn commit_placed(ledger: &PositionLedger, store: &TrustStore, signal: &Signal) -> OpenPosition {
        let (open, close) = ledger
            .derive_effects(signal, &sample_approval(), "dev-1", "exec-1", &placed())
            .unwrap();
        assert!(close.is_none());
        let position = open.expect("placed ack opens a position");
        let execution = ExecutionRecord {
            execution_id: "exec-1".to_string(),
            approval_id: "apr-1".to_string(),
            signal_id: signal.signal_id.clone(),
            device_id: "dev-1".to_string(),
            status: ExecStatus::Placed,
            broker_ticket: Some("T-1".to_string()),
            error: None,
            created_at: Utc::now(),
        };
        store
            .commit_execution(&execution, Some(&position), None)
            .unwrap();
        position
    }

    #[test]
    fn test_placed_opens_position_with_levels() {
        let (ledger, store) = fixture("open");
        let signal = sample_signal(Some(json!({"stop_loss": 3300, "take_profit": 3000})));
        let position = commit_placed(&ledger, &store, &signal);

        assert_eq!(position.entry_price, dec!(3200));
        assert_eq!(position.instrument, "ETH-USDT");
        let levels = position.levels.expect("levels decoded");
        assert_eq!(levels.stop_loss, Some(dec!(3300)));
        assert_eq!(levels.take_profit, Some(dec!(3000)));
    }

    #[test]
    fn test_corrupt_levels_degrade_to_none() {
        let (ledger, store) = fixture("corrupt");
        let signal = sample_signal(Some(json!([1, 2, 3])));
        let position = commit_placed(&ledger, &store, &signal);
        assert!(position.levels.is_none());
        assert!(position.is_open());
    }

    #[test]
    fn test_second_placed_ack_opens_nothing() {
        let (ledger, store) = fixture("dup");
        let signal = sample_signal(None);
        commit_placed(&ledger, &store, &signal);

        let (open, close) = ledger
            .derive_effects(&signal, &sample_approval(), "dev-1", "exec-2", &placed())
            .unwrap();
        assert!(open.is_none());
        assert!(close.is_none());

        // A different device still opens its own position
        let (open, _) = ledger
            .derive_effects(&signal, &sample_approval(), "dev-2", "exec-3", &placed())
            .unwrap();
        assert!(open.is_some());
    }

    #[test]
    fn test_failure_closes_prior_position_with_error() {
        let (ledger, store) = fixture("fail");
        let signal = sample_signal(None);
        let position = commit_placed(&ledger, &store, &signal);

        let failed = ExecutionOutcome::Failed {
            error: Some("insufficient margin".to_string()),
        };
        let (open, close) = ledger
            .derive_effects(&signal, &sample_approval(), "dev-1", "exec-2", &failed)
            .unwrap();
        assert!(open.is_none());
        let closed = close.expect("prior position closes");
        assert_eq!(closed.position_id, position.position_id);
        assert!(!closed.is_open());
        assert_eq!(closed.close_reason.as_deref(), Some("insufficient margin"));
    }

    #[test]
    fn test_failure_without_prior_position_records_nothing() {
        let (ledger, _store) = fixture("nofail");
        let signal = sample_signal(None);
        let cancelled = ExecutionOutcome::Cancelled;
        let (open, close) = ledger
            .derive_effects(&signal, &sample_approval(), "dev-1", "exec-1", &cancelled)
            .unwrap();
        assert!(open.is_none());
        assert!(close.is_none());
    }

    #[test]
    fn test_close_command_is_idempotent() {
        let (ledger, store) = fixture("close");
        let signal = sample_signal(None);
        let position = commit_placed(&ledger, &store, &signal);

        let closed = ledger
            .close_position(&position.position_id, Some("take-profit hit"))
            .unwrap()
            .unwrap();
        assert!(!closed.is_open());
        assert_eq!(closed.close_reason.as_deref(), Some("take-profit hit"));

        // Retrying keeps the original close, does not re-stamp
        let again = ledger
            .close_position(&position.position_id, Some("other reason"))
            .unwrap()
            .unwrap();
        assert_eq!(again.closed_at, closed.closed_at);
        assert_eq!(again.close_reason.as_deref(), Some("take-profit hit"));

        assert!(ledger.close_position("missing", None).unwrap().is_none());
    }

    #[test]
    fn test_position_listing_filters_by_tenant() {
        let (ledger, store) = fixture("list");
        let signal = sample_signal(None);
        commit_placed(&ledger, &store, &signal);

        assert_eq!(ledger.positions(None).unwrap().len(), 1);
        assert_eq!(ledger.positions(Some("client-a")).unwrap().len(), 1);
        assert!(ledger.positions(Some("client-b")).unwrap().is_empty());
    }
}
