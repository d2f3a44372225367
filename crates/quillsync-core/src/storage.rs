//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Device identity (replica id and signing keypair seed)
//! - Per-document send counters (monotonic, for envelope sealing)
//! - Per-(sender, document) last-seen counters (for replay rejection)
//! - Document snapshots (full-state exports for offline restart)
//!
//! Counter tables survive document deletion on purpose: replay protection
//! must not reset when a document is closed and later re-created.

use crate::crdt::Snapshot;
use crate::error::SyncError;
use crate::identity::DeviceKeypair;
use crate::types::{DocumentId, ReplicaId};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

// Table definitions
const IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");
const SEND_COUNTERS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("send_counters");
const SEEN_COUNTERS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("seen_counters");
const SNAPSHOTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

const REPLICA_ID_KEY: &str = "replica_id";
const DEVICE_SEED_KEY: &str = "device_seed";

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Open/create database
        let db = Database::create(path)?;

        // Initialize all tables
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
            let _ = write_txn.open_table(SEND_COUNTERS_TABLE)?;
            let _ = write_txn.open_table(SEEN_COUNTERS_TABLE)?;
            let _ = write_txn.open_table(SNAPSHOTS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Load the persisted replica id, generating and saving one on first run.
    pub fn load_or_create_replica_id(&self) -> Result<ReplicaId, SyncError> {
        if let Some(existing) = self.load_replica_id()? {
            return Ok(existing);
        }
        let replica = ReplicaId::generate();
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            table.insert(REPLICA_ID_KEY, replica.as_bytes().as_slice())?;
        }
        write_txn.commit()?;
        Ok(replica)
    }

    /// Load the persisted replica id, if any.
    pub fn load_replica_id(&self) -> Result<Option<ReplicaId>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;

        match table.get(REPLICA_ID_KEY)? {
            Some(v) => {
                let bytes: [u8; 16] = v.value().try_into().map_err(|_| {
                    SyncError::Identity("Stored replica id has wrong length".to_string())
                })?;
                Ok(Some(ReplicaId::from_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Load the persisted device keypair, generating and saving one on
    /// first run.
    pub fn load_or_create_device_keypair(&self) -> Result<DeviceKeypair, SyncError> {
        {
            let db = self.db.read();
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(IDENTITY_TABLE)?;
            if let Some(v) = table.get(DEVICE_SEED_KEY)? {
                let seed: [u8; 32] = v.value().try_into().map_err(|_| {
                    SyncError::Identity("Stored device seed has wrong length".to_string())
                })?;
                return Ok(DeviceKeypair::from_seed(&seed));
            }
        }

        let keypair = DeviceKeypair::generate()?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            table.insert(DEVICE_SEED_KEY, keypair.to_seed().as_slice())?;
        }
        write_txn.commit()?;
        Ok(keypair)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Envelope Counter Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Increment and persist the send counter for a document, returning the
    /// new value. The counter is committed before the envelope is sent, so
    /// a crash can skip values but never reuse one.
    pub fn next_send_counter(&self, document: &DocumentId) -> Result<u64, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let next = {
            let mut table = write_txn.open_table(SEND_COUNTERS_TABLE)?;
            let current = table.get(document.as_str())?.map(|v| v.value()).unwrap_or(0);
            let next = current + 1;
            table.insert(document.as_str(), next)?;
            next
        };
        write_txn.commit()?;
        Ok(next)
    }

    /// Highest envelope counter accepted from a sender for a document
    /// (0 if none has been accepted yet).
    pub fn last_seen_counter(
        &self,
        sender: &ReplicaId,
        document: &DocumentId,
    ) -> Result<u64, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SEEN_COUNTERS_TABLE)?;
        let key = Self::seen_key(sender, document);
        Ok(table.get(key.as_str())?.map(|v| v.value()).unwrap_or(0))
    }

    /// Record the highest accepted counter from a sender for a document.
    pub fn set_last_seen_counter(
        &self,
        sender: &ReplicaId,
        document: &DocumentId,
        counter: u64,
    ) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SEEN_COUNTERS_TABLE)?;
            let key = Self::seen_key(sender, document);
            table.insert(key.as_str(), counter)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn seen_key(sender: &ReplicaId, document: &DocumentId) -> String {
        format!("{}:{}", sender.to_base58(), document.as_str())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Snapshot Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a document snapshot, overwriting any previous one.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), SyncError> {
        let data = snapshot.to_bytes()?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS_TABLE)?;
            table.insert(snapshot.document.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the stored snapshot for a document, if any.
    pub fn load_snapshot(&self, document: &DocumentId) -> Result<Option<Snapshot>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;

        match table.get(document.as_str())? {
            Some(v) => Ok(Some(Snapshot::from_bytes(v.value())?)),
            None => Ok(None),
        }
    }

    /// Delete a document's stored snapshot. Counter tables are left alone:
    /// replay protection outlives the document.
    pub fn delete_snapshot(&self, document: &DocumentId) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS_TABLE)?;
            table.remove(document.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// List documents with stored snapshots.
    pub fn list_snapshots(&self) -> Result<Vec<DocumentId>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;

        let mut documents = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            documents.push(DocumentId::new(key.value()));
        }
        Ok(documents)
    }
}
