//! The poll/ack state machine.
//!
//! Per (signal, device) pair a signal moves `not-visible -> visible ->
//! executed`. Visibility means: the signal is approved, belongs to the
//! device's tenant, postdates the device's `since` cursor, and the device
//! has not yet acknowledged it. An ack of any status is terminal for the
//! pair; a device that never acks simply keeps seeing the signal.
//!
//! Poll responses carry owner-only data, so the whole batch is sealed with
//! the device's current key before it leaves the gateway. Ack bodies are
//! plaintext JSON.

use crate::cipher::{self, CipherEnvelope, CONTEXT_POLL_BATCH};
use crate::context::GatewayContext;
use crate::error::ProtocolError;
use crate::keystore::DeviceKeyStore;
use crate::ledger::PositionLedger;
use crate::metrics;
use crate::model::{
    AckRequest, AckResponse, Approval, Decision, Device, ExecutionOutcome, ExecutionRecord,
    NewSignalRequest, PollBatch, PollInstruction, Signal, decode_owner_levels,
};
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::TrustStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

pub struct SignalGateway {
    store: Arc<TrustStore>,
    keystore: Arc<DeviceKeyStore>,
    ledger: Arc<PositionLedger>,
    ctx: GatewayContext,
    max_poll_batch: usize,
}

impl SignalGateway {
    pub fn new(
        store: Arc<TrustStore>,
        keystore: Arc<DeviceKeyStore>,
        ledger: Arc<PositionLedger>,
        ctx: GatewayContext,
        max_poll_batch: usize,
    ) -> Self {
        Self {
            store,
            keystore,
            ledger,
            ctx,
            max_poll_batch,
        }
    }

    /// Select the signals visible to a device and seal them into one
    /// envelope under the device's current key. `None` means nothing is
    /// eligible; the caller sends an empty plaintext batch instead.
    pub fn poll(
        &self,
        device: &Device,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<CipherEnvelope>, ProtocolError> {
        let mut batch = Vec::new();
        for signal in self.store.load_approved_signals(&device.client_id)? {
            if matches!(since, Some(cursor) if signal.created_at <= cursor) {
                continue;
            }
            if self
                .store
                .execution_exists(&signal.signal_id, &device.device_id)?
            {
                continue;
            }
            let Some(approval_id) = signal.approval_id.clone() else {
                warn!(signal_id = %signal.signal_id, "Approved signal has no approval id; skipping");
                continue;
            };
            batch.push(PollInstruction {
                approval_id,
                signal_id: signal.signal_id,
                instrument: signal.instrument,
                side: signal.side,
                price: signal.price,
                quantity: signal.quantity,
                leverage: signal.leverage,
                levels: decode_owner_levels(signal.owner_levels.as_ref()),
                created_at: signal.created_at,
            });
            if batch.len() >= self.max_poll_batch {
                break;
            }
        }

        metrics::inc_polls_served();
        if batch.is_empty() {
            info!(device_id = %device.device_id, "📭 Poll: nothing eligible");
            return Ok(None);
        }

        let Some(key) = self.keystore.current(&device.device_id)? else {
            // The device authenticated moments ago, so this is a revocation
            // racing the poll; treat it as the auth failure it will be on
            // the next request
            return Err(ProtocolError::AuthenticationFailed);
        };
        let material = key.material().map_err(|_| {
            StoreError::Integrity(format!(
                "key v{} for device {} is not valid base64",
                key.version, key.device_id
            ))
        })?;

        let count = batch.len();
        let plaintext =
            serde_json::to_vec(&PollBatch { signals: batch }).map_err(StoreError::from)?;
        let envelope = cipher::encrypt(
            &material,
            key.version,
            &device.device_id,
            CONTEXT_POLL_BATCH,
            &plaintext,
        )?;

        metrics::inc_signals_delivered(count as u64);
        info!(
            device_id = %device.device_id,
            count,
            key_version = key.version,
            "📬 Poll: sealed batch"
        );
        Ok(Some(envelope))
    }

    /// Record a device's execution report for an approval.
    ///
    /// Tenant authorization happens before anything else. Every accepted
    /// ack writes its own execution row, duplicates included; position
    /// effects come from the ledger and commit in the same transaction.
    pub fn ack(&self, device: &Device, request: &AckRequest) -> Result<AckResponse, ProtocolError> {
        let approval = self
            .store
            .load_approval(&request.approval_id)?
            .ok_or_else(|| ProtocolError::UnknownApproval(request.approval_id.clone()))?;

        if approval.client_id != device.client_id {
            metrics::inc_tenant_rejections();
            warn!(
                device_id = %device.device_id,
                approval_id = %approval.approval_id,
                "⛔ Ack rejected: approval belongs to another tenant"
            );
            return Err(ProtocolError::TenantMismatch);
        }

        let signal = self.store.load_signal(&approval.signal_id)?.ok_or_else(|| {
            StoreError::Integrity(format!(
                "approval {} references missing signal {}",
                approval.approval_id, approval.signal_id
            ))
        })?;

        if self
            .store
            .execution_exists(&signal.signal_id, &device.device_id)?
        {
            metrics::inc_duplicate_acks();
            warn!(
                device_id = %device.device_id,
                approval_id = %approval.approval_id,
                "Duplicate ack for pair; keeping as audit row"
            );
        }

        let outcome = ExecutionOutcome::from(request);
        let execution = ExecutionRecord {
            execution_id: self.ctx.id.new_id(),
            approval_id: approval.approval_id.clone(),
            signal_id: signal.signal_id.clone(),
            device_id: device.device_id.clone(),
            status: outcome.status(),
            broker_ticket: outcome.broker_ticket().map(str::to_string),
            error: outcome.error().map(str::to_string),
            created_at: self.ctx.time.now(),
        };

        let (open, close) = self.ledger.derive_effects(
            &signal,
            &approval,
            &device.device_id,
            &execution.execution_id,
            &outcome,
        )?;
        self.store
            .commit_execution(&execution, open.as_ref(), close.as_ref())?;

        metrics::inc_acks_recorded();
        if open.is_some() {
            metrics::inc_positions_opened();
        }
        if close.is_some() {
            metrics::inc_positions_closed();
        }
        info!(
            device_id = %device.device_id,
            approval_id = %approval.approval_id,
            status = %execution.status,
            opened = open.is_some(),
            closed = close.is_some(),
            "✅ Ack recorded"
        );

        Ok(AckResponse {
            execution_id: execution.execution_id,
            approval_id: execution.approval_id,
            status: execution.status,
            position_id: open.map(|p| p.position_id),
        })
    }

    /// Create a pending signal for a tenant (upstream strategy surface).
    pub fn create_signal(&self, request: &NewSignalRequest) -> Result<Signal, ProtocolError> {
        let signal = Signal {
            signal_id: self.ctx.id.new_id(),
            client_id: request.client_id.clone(),
            instrument: request.instrument.clone(),
            side: request.side,
            price: request.price,
            quantity: request.quantity,
            leverage: request.leverage,
            owner_levels: request.owner_levels.clone(),
            decision: Decision::Pending,
            approval_id: None,
            created_at: self.ctx.time.now(),
        };
        self.store.save_signal(&signal)?;
        info!(
            signal_id = %signal.signal_id,
            client_id = %signal.client_id,
            instrument = %signal.instrument,
            "📨 Signal created"
        );
        Ok(signal)
    }

    /// Apply the one-shot decision to a pending signal. Approval mints the
    /// approval row devices will ack against.
    pub fn decide(&self, signal_id: &str, decision: Decision) -> Result<Signal, ProtocolError> {
        let mut signal = self
            .store
            .load_signal(signal_id)?
            .ok_or(ProtocolError::NotFound)?;
        if signal.decision != Decision::Pending {
            return Err(ProtocolError::DecisionAlreadySet(signal_id.to_string()));
        }

        match decision {
            Decision::Pending => {
                return Err(ProtocolError::MalformedRequest(
                    "decision must be approved or rejected".to_string(),
                ));
            }
            Decision::Approved => {
                let approval = Approval {
                    approval_id: self.ctx.id.new_id(),
                    signal_id: signal.signal_id.clone(),
                    client_id: signal.client_id.clone(),
                    decided_at: self.ctx.time.now(),
                };
                signal.decision = Decision::Approved;
                signal.approval_id = Some(approval.approval_id.clone());
                self.store.record_decision(&signal, Some(&approval))?;
                info!(
                    signal_id = %signal.signal_id,
                    approval_id = %approval.approval_id,
                    "👍 Signal approved"
                );
            }
            Decision::Rejected => {
                signal.decision = Decision::Rejected;
                self.store.record_decision(&signal, None)?;
                info!(signal_id = %signal.signal_id, "👎 Signal rejected");
            }
        }
        Ok(signal)
    }
}
