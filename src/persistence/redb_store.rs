use redb::{ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Ephemeral replay namespace: `{device_id}:{nonce}` -> expiry epoch millis.
/// Read and written only through [`RedbStore::claim_nonce`] and the sweeper.
const NONCES_TABLE: TableDefinition<&str, i64> = TableDefinition::new("nonce_records");

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redb error: {0}")]
    Redb(#[from] redb::Error),
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Data integrity error: {0}")]
    Integrity(String),
}

pub struct RedbStore {
    db: Arc<redb::Database>,
}

impl RedbStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = redb::Database::create(path)?;
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(NONCES_TABLE)?;
        }
        crate::persistence::store::ensure_tables(&txn)?;
        txn.commit()?;
        info!("📦 Trust database opened");
        Ok(Self { db: Arc::new(db) })
    }

    pub fn begin_write(&self) -> Result<redb::WriteTransaction<'_>, StoreError> {
        Ok(self.db.begin_write()?)
    }

    pub fn begin_read(&self) -> Result<redb::ReadTransaction<'_>, StoreError> {
        Ok(self.db.begin_read()?)
    }

    /// Atomic test-and-set for a replay nonce.
    ///
    /// Returns `true` if the key was unclaimed (or its previous claim had
    /// expired) and is now recorded with a fresh expiry; `false` if a live
    /// claim already exists. Check and insert happen inside one write
    /// transaction, and redb serializes writers, so two concurrent requests
    /// carrying the same key cannot both observe "unclaimed".
    pub fn claim_nonce(&self, key: &str, now_ms: i64, ttl_ms: i64) -> Result<bool, StoreError> {
        let txn = self.begin_write()?;
        let fresh = {
            let mut table = txn.open_table(NONCES_TABLE)?;
            let live = match table.get(key)? {
                Some(expiry) => expiry.value() > now_ms,
                None => false,
            };
            if live {
                false
            } else {
                table.insert(key, now_ms + ttl_ms)?;
                true
            }
        };
        txn.commit()?;
        Ok(fresh)
    }

    /// Drop every nonce record whose expiry has passed. Returns the number
    /// of records removed.
    pub fn purge_nonces(&self, now_ms: i64) -> Result<usize, StoreError> {
        let txn = self.begin_write()?;
        let removed = {
            let mut table = txn.open_table(NONCES_TABLE)?;
            let mut stale = Vec::new();
            for res in table.range::<&str>(..)? {
                let (k, v) = res?;
                if v.value() <= now_ms {
                    stale.push(k.value().to_string());
                }
            }
            for key in &stale {
                table.remove(key.as_str())?;
            }
            stale.len()
        };
        txn.commit()?;
        Ok(removed)
    }
}
