use crate::model::{Approval, Device, DeviceKey, ExecutionRecord, OpenPosition, Signal};
use crate::persistence::redb_store::{RedbStore, StoreError};
use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};
use std::sync::Arc;

// Tables
const DEVICES_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("devices");
const DEVICE_KEYS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("device_keys");
const SIGNALS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("signals");
const APPROVALS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("approvals");
const EXECUTIONS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("executions");
const POSITIONS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("positions");
/// `{signal_id}|{device_id}` -> first execution_id. Presence is what hides a
/// signal from later polls by the same device.
const EXECUTED_PAIRS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("executed_pairs");
/// `{approval_id}|{device_id}` -> position_id. At most one position per pair,
/// kept after close so a late duplicate ack cannot open a second one.
const POSITION_PAIRS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("position_pairs");

fn key_row_id(device_id: &str, version: u32) -> String {
    // Zero-padded so lexicographic key order matches version order
    format!("{}:{:010}", device_id, version)
}

fn pair_key(left: &str, right: &str) -> String {
    format!("{}|{}", left, right)
}

/// Create every trust table if it is missing. Runs once when the database
/// is opened: redb only materializes a table on first write, and a read
/// transaction that opens an absent table errors instead of seeing it empty.
pub(super) fn ensure_tables(txn: &redb::WriteTransaction<'_>) -> Result<(), redb::TableError> {
    let _ = txn.open_table(DEVICES_TABLE)?;
    let _ = txn.open_table(DEVICE_KEYS_TABLE)?;
    let _ = txn.open_table(SIGNALS_TABLE)?;
    let _ = txn.open_table(APPROVALS_TABLE)?;
    let _ = txn.open_table(EXECUTIONS_TABLE)?;
    let _ = txn.open_table(POSITIONS_TABLE)?;
    let _ = txn.open_table(EXECUTED_PAIRS_TABLE)?;
    let _ = txn.open_table(POSITION_PAIRS_TABLE)?;
    Ok(())
}

/// Persistent state for the device trust protocol: devices, key versions,
/// signals, approvals, executions and positions, all as serde_json rows in
/// redb tables. Multi-row effects (registration, rotation, an ack) go
/// through `commit_*` methods so they land in a single write transaction.
pub struct TrustStore {
    store: Arc<RedbStore>,
}

impl TrustStore {
    pub fn new(store: Arc<RedbStore>) -> Self {
        Self { store }
    }

    // --- Devices & keys ---

    pub fn load_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(DEVICES_TABLE)?;
        let maybe = table
            .get(device_id)?
            .map(|v| serde_json::from_slice::<Device>(&v.value()))
            .transpose()?;
        Ok(maybe)
    }

    pub fn save_device(&self, device: &Device) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(DEVICES_TABLE)?;
            let data = serde_json::to_vec(device)?;
            table.insert(device.device_id.as_str(), data)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// All key versions for a device, oldest version first.
    pub fn load_device_keys(&self, device_id: &str) -> Result<Vec<DeviceKey>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(DEVICE_KEYS_TABLE)?;
        let mut items = Vec::new();
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            let item: DeviceKey = serde_json::from_slice(&v.value())?;
            if item.device_id == device_id {
                items.push(item);
            }
        }
        items.sort_by_key(|k| k.version);
        Ok(items)
    }

    /// Device row plus its first key, one transaction.
    pub fn commit_registration(&self, device: &Device, key: &DeviceKey) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut devices = txn.open_table(DEVICES_TABLE)?;
            devices.insert(device.device_id.as_str(), serde_json::to_vec(device)?)?;
        }
        {
            let mut keys = txn.open_table(DEVICE_KEYS_TABLE)?;
            let row = key_row_id(&key.device_id, key.version);
            keys.insert(row.as_str(), serde_json::to_vec(key)?)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// New current key plus the expiry stamp on the superseded one, one
    /// transaction. A crash can never leave a device with two open-ended
    /// key versions.
    pub fn commit_rotation(
        &self,
        new_key: &DeviceKey,
        superseded: Option<&DeviceKey>,
    ) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut keys = txn.open_table(DEVICE_KEYS_TABLE)?;
            let row = key_row_id(&new_key.device_id, new_key.version);
            keys.insert(row.as_str(), serde_json::to_vec(new_key)?)?;
            if let Some(old) = superseded {
                let row = key_row_id(&old.device_id, old.version);
                keys.insert(row.as_str(), serde_json::to_vec(old)?)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Revoked device row plus expiry stamps on all of its keys.
    pub fn commit_revocation(
        &self,
        device: &Device,
        expired_keys: &[DeviceKey],
    ) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut devices = txn.open_table(DEVICES_TABLE)?;
            devices.insert(device.device_id.as_str(), serde_json::to_vec(device)?)?;
        }
        {
            let mut keys = txn.open_table(DEVICE_KEYS_TABLE)?;
            for key in expired_keys {
                let row = key_row_id(&key.device_id, key.version);
                keys.insert(row.as_str(), serde_json::to_vec(key)?)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove key versions whose expiry predates `cutoff`. Returns how many
    /// rows were purged.
    pub fn purge_device_keys_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let txn = self.store.begin_write()?;
        let removed = {
            let mut table = txn.open_table(DEVICE_KEYS_TABLE)?;
            let mut stale = Vec::new();
            for res in table.range::<&str>(..)? {
                let (k, v) = res?;
                let key: DeviceKey = serde_json::from_slice(&v.value())?;
                if matches!(key.expires_at, Some(at) if at < cutoff) {
                    stale.push(k.value().to_string());
                }
            }
            for row in &stale {
                table.remove(row.as_str())?;
            }
            stale.len()
        };
        txn.commit()?;
        Ok(removed)
    }

    // --- Signals & approvals ---

    pub fn save_signal(&self, signal: &Signal) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(SIGNALS_TABLE)?;
            let data = serde_json::to_vec(signal)?;
            table.insert(signal.signal_id.as_str(), data)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_signal(&self, signal_id: &str) -> Result<Option<Signal>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(SIGNALS_TABLE)?;
        let maybe = table
            .get(signal_id)?
            .map(|v| serde_json::from_slice::<Signal>(&v.value()))
            .transpose()?;
        Ok(maybe)
    }

    /// Decided signal row plus its approval row (when approved), one
    /// transaction.
    pub fn record_decision(
        &self,
        signal: &Signal,
        approval: Option<&Approval>,
    ) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut signals = txn.open_table(SIGNALS_TABLE)?;
            signals.insert(signal.signal_id.as_str(), serde_json::to_vec(signal)?)?;
        }
        if let Some(approval) = approval {
            let mut approvals = txn.open_table(APPROVALS_TABLE)?;
            approvals.insert(approval.approval_id.as_str(), serde_json::to_vec(approval)?)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_approval(&self, approval_id: &str) -> Result<Option<Approval>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(APPROVALS_TABLE)?;
        let maybe = table
            .get(approval_id)?
            .map(|v| serde_json::from_slice::<Approval>(&v.value()))
            .transpose()?;
        Ok(maybe)
    }

    /// Approved signals for one tenant, creation time ascending.
    pub fn load_approved_signals(&self, client_id: &str) -> Result<Vec<Signal>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(SIGNALS_TABLE)?;
        let mut items = Vec::new();
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            let item: Signal = serde_json::from_slice(&v.value())?;
            if item.client_id == client_id && item.decision == crate::model::Decision::Approved {
                items.push(item);
            }
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    // --- Executions & positions ---

    pub fn execution_exists(&self, signal_id: &str, device_id: &str) -> Result<bool, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(EXECUTED_PAIRS_TABLE)?;
        let pair = pair_key(signal_id, device_id);
        Ok(table.get(pair.as_str())?.is_some())
    }

    /// Everything one ack persists: the execution row always, plus at most
    /// one position effect (a newly opened position, or a prior position
    /// updated to closed). All of it commits atomically or not at all.
    pub fn commit_execution(
        &self,
        execution: &ExecutionRecord,
        open: Option<&OpenPosition>,
        close: Option<&OpenPosition>,
    ) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut executions = txn.open_table(EXECUTIONS_TABLE)?;
            executions.insert(
                execution.execution_id.as_str(),
                serde_json::to_vec(execution)?,
            )?;
        }
        {
            let mut pairs = txn.open_table(EXECUTED_PAIRS_TABLE)?;
            let pair = pair_key(&execution.signal_id, &execution.device_id);
            // Keep the first execution as the pair's anchor; later duplicates
            // still get their own row in EXECUTIONS_TABLE above
            if pairs.get(pair.as_str())?.is_none() {
                pairs.insert(pair.as_str(), execution.execution_id.as_str())?;
            }
        }
        if open.is_some() || close.is_some() {
            let mut positions = txn.open_table(POSITIONS_TABLE)?;
            if let Some(position) = open {
                positions.insert(position.position_id.as_str(), serde_json::to_vec(position)?)?;
            }
            if let Some(position) = close {
                positions.insert(position.position_id.as_str(), serde_json::to_vec(position)?)?;
            }
        }
        if let Some(position) = open {
            let mut pairs = txn.open_table(POSITION_PAIRS_TABLE)?;
            let pair = pair_key(&position.approval_id, &position.device_id);
            pairs.insert(pair.as_str(), position.position_id.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(EXECUTIONS_TABLE)?;
        let maybe = table
            .get(execution_id)?
            .map(|v| serde_json::from_slice::<ExecutionRecord>(&v.value()))
            .transpose()?;
        Ok(maybe)
    }

    pub fn load_position(&self, position_id: &str) -> Result<Option<OpenPosition>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(POSITIONS_TABLE)?;
        let maybe = table
            .get(position_id)?
            .map(|v| serde_json::from_slice::<OpenPosition>(&v.value()))
            .transpose()?;
        Ok(maybe)
    }

    /// The position (open or closed) anchored to an (approval, device) pair,
    /// if any ack ever opened one.
    pub fn load_position_for_pair(
        &self,
        approval_id: &str,
        device_id: &str,
    ) -> Result<Option<OpenPosition>, StoreError> {
        let txn = self.store.begin_read()?;
        let pairs = txn.open_table(POSITION_PAIRS_TABLE)?;
        let pair = pair_key(approval_id, device_id);
        let Some(position_id) = pairs.get(pair.as_str())?.map(|v| v.value().to_string()) else {
            return Ok(None);
        };
        let positions = txn.open_table(POSITIONS_TABLE)?;
        let maybe = positions
            .get(position_id.as_str())?
            .map(|v| serde_json::from_slice::<OpenPosition>(&v.value()))
            .transpose()?;
        Ok(maybe)
    }

    pub fn save_position(&self, position: &OpenPosition) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(POSITIONS_TABLE)?;
            let data = serde_json::to_vec(position)?;
            table.insert(position.position_id.as_str(), data)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// All positions, oldest first.
    pub fn load_positions(&self) -> Result<Vec<OpenPosition>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(POSITIONS_TABLE)?;
        let mut items = Vec::new();
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            let item: OpenPosition = serde_json::from_slice(&v.value())?;
            items.push(item);
        }
        items.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Decision, ExecStatus, Side};
    use rust_decimal_macros::dec;

    fn temp_store(tag: &str) -> TrustStore {
        let path = std::env::temp_dir().join(format!(
            "beacon-store-{}-{}.redb",
            tag,
            uuid::Uuid::new_v4()
        ));
        TrustStore::new(Arc::new(RedbStore::new(path).expect("open store")))
    }

    fn sample_signal(signal_id: &str, client_id: &str, decision: Decision) -> Signal {
        Signal {
            signal_id: signal_id.to_string(),
            client_id: client_id.to_string(),
            instrument: "BTC-USDT".to_string(),
            side: Side::Buy,
            price: dec!(64000),
            quantity: dec!(0.5),
            leverage: None,
            owner_levels: None,
            decision,
            approval_id: None,
            created_at: Utc::now(),
        }
    }

    fn sample_execution(signal_id: &str, device_id: &str, execution_id: &str) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: execution_id.to_string(),
            approval_id: "apr-1".to_string(),
            signal_id: signal_id.to_string(),
            device_id: device_id.to_string(),
            status: ExecStatus::Placed,
            broker_ticket: Some("T-1".to_string()),
            error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_approved_signal_scan_filters_tenant_and_decision() {
        let store = temp_store("scan");
        store
            .save_signal(&sample_signal("s-1", "client-a", Decision::Approved))
            .unwrap();
        store
            .save_signal(&sample_signal("s-2", "client-b", Decision::Approved))
            .unwrap();
        store
            .save_signal(&sample_signal("s-3", "client-a", Decision::Pending))
            .unwrap();

        let visible = store.load_approved_signals("client-a").unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].signal_id, "s-1");
    }

    #[test]
    fn test_commit_execution_records_pair_once() {
        let store = temp_store("pairs");
        let first = sample_execution("s-1", "dev-1", "exec-1");
        let second = sample_execution("s-1", "dev-1", "exec-2");

        assert!(!store.execution_exists("s-1", "dev-1").unwrap());
        store.commit_execution(&first, None, None).unwrap();
        assert!(store.execution_exists("s-1", "dev-1").unwrap());

        // Duplicate keeps its own execution row but the pair anchor stays on
        // the first execution
        store.commit_execution(&second, None, None).unwrap();
        assert!(store.load_execution("exec-1").unwrap().is_some());
        assert!(store.load_execution("exec-2").unwrap().is_some());

        // A different device is an independent pair
        assert!(!store.execution_exists("s-1", "dev-2").unwrap());
    }

    #[test]
    fn test_execution_and_position_commit_together() {
        let store = temp_store("atomic");
        let execution = sample_execution("s-1", "dev-1", "exec-1");
        let position = OpenPosition {
            position_id: "pos-1".to_string(),
            signal_id: "s-1".to_string(),
            approval_id: "apr-1".to_string(),
            device_id: "dev-1".to_string(),
            execution_id: "exec-1".to_string(),
            client_id: "client-a".to_string(),
            instrument: "BTC-USDT".to_string(),
            side: Side::Buy,
            entry_price: dec!(64000),
            quantity: dec!(0.5),
            levels: None,
            opened_at: Utc::now(),
            closed_at: None,
            close_reason: None,
        };

        store
            .commit_execution(&execution, Some(&position), None)
            .unwrap();

        let loaded = store
            .load_position_for_pair("apr-1", "dev-1")
            .unwrap()
            .expect("position anchored to pair");
        assert_eq!(loaded.position_id, "pos-1");
        assert!(loaded.is_open());
        assert_eq!(store.load_positions().unwrap().len(), 1);
    }

    #[test]
    fn test_key_rows_order_by_version() {
        let store = temp_store("keys");
        let device = Device {
            device_id: "dev-1".to_string(),
            client_id: "client-a".to_string(),
            seed: crate::model::SecretSeed::from_bytes(b"seed"),
            revoked: false,
            created_at: Utc::now(),
            revoked_at: None,
        };
        let key = |version: u32| DeviceKey {
            device_id: "dev-1".to_string(),
            version,
            material_b64: format!("material-{}", version),
            created_at: Utc::now(),
            expires_at: None,
        };

        store.commit_registration(&device, &key(1)).unwrap();
        store.commit_rotation(&key(3), None).unwrap();
        store.commit_rotation(&key(2), None).unwrap();

        let versions: Vec<u32> = store
            .load_device_keys("dev-1")
            .unwrap()
            .iter()
            .map(|k| k.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_purge_removes_only_long_expired_keys() {
        let store = temp_store("purge");
        let now = Utc::now();
        let key = |version: u32, expires_at: Option<DateTime<Utc>>| DeviceKey {
            device_id: "dev-1".to_string(),
            version,
            material_b64: "m".to_string(),
            created_at: now,
            expires_at,
        };

        store
            .commit_rotation(&key(1, Some(now - chrono::Duration::hours(48))), None)
            .unwrap();
        store
            .commit_rotation(&key(2, Some(now - chrono::Duration::minutes(5))), None)
            .unwrap();
        store.commit_rotation(&key(3, None), None).unwrap();

        let cutoff = now - chrono::Duration::hours(24);
        let removed = store.purge_device_keys_expired_before(cutoff).unwrap();
        assert_eq!(removed, 1);

        let versions: Vec<u32> = store
            .load_device_keys("dev-1")
            .unwrap()
            .iter()
            .map(|k| k.version)
            .collect();
        assert_eq!(versions, vec![2, 3]);
    }
}
