//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `entries` - Append-only ledger (key: user_id || created_at || entry_id)
//! - `entry_index` - Entry lookup (key: entry_id, value: `entries` key)
//! - `summaries` - Per-user summary projection (key: user_id)
//! - `expiry_index` - Open expiring lots (key: expires_at || user_id || lot_id)
//!
//! Timestamps in keys are big-endian nanoseconds with the sign bit flipped,
//! so byte order matches time order and a user's entries iterate in FIFO
//! order.

use crate::{
    error::{Error, Result},
    types::{LedgerEntry, UserId, UserLoyaltySummary},
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ENTRIES: &str = "entries";
const CF_ENTRY_INDEX: &str = "entry_index";
const CF_SUMMARIES: &str = "summaries";
const CF_EXPIRY_INDEX: &str = "expiry_index";

/// Expiring lot removed from the sweep index once it is closed
#[derive(Debug, Clone, Copy)]
pub struct ClosedLot {
    /// Lot's expiry
    pub expires_at: DateTime<Utc>,
    /// Earn entry id
    pub lot_id: Uuid,
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_entries()),
            ColumnFamilyDescriptor::new(CF_ENTRY_INDEX, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_SUMMARIES, Self::cf_options_summaries()),
            ColumnFamilyDescriptor::new(CF_EXPIRY_INDEX, Self::cf_options_index()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB loyalty store");

        Ok(Self { db: Arc::new(db) })
    }

    // Column family options

    fn cf_options_entries() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_summaries() -> Options {
        let mut opts = Options::default();
        // Summaries are read on every balance lookup
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Entry operations

    /// Append an entry together with the user's refreshed summary (atomic).
    ///
    /// `closed_lots` are expiring lots this entry drew to zero; their sweep
    /// index rows are removed in the same batch.
    pub fn append_entry_atomic(
        &self,
        entry: &LedgerEntry,
        summary: &UserLoyaltySummary,
        closed_lots: &[ClosedLot],
    ) -> Result<()> {
        if entry.user_id != summary.user_id {
            return Err(Error::InvariantViolation(format!(
                "summary for {} written with entry of {}",
                summary.user_id, entry.user_id
            )));
        }

        let mut batch = WriteBatch::default();

        // 1. Entry
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let entry_key = entry_key(&entry.user_id, entry.created_at, &entry.id)?;
        batch.put_cf(cf_entries, &entry_key, bincode::serialize(entry)?);

        // 2. Entry lookup
        let cf_entry_index = self.cf_handle(CF_ENTRY_INDEX)?;
        batch.put_cf(cf_entry_index, entry.id.as_bytes(), &entry_key);

        // 3. Summary
        let cf_summaries = self.cf_handle(CF_SUMMARIES)?;
        batch.put_cf(
            cf_summaries,
            summary.user_id.as_bytes(),
            bincode::serialize(summary)?,
        );

        // 4. Sweep index
        let cf_expiry = self.cf_handle(CF_EXPIRY_INDEX)?;
        if let (true, Some(expires_at)) = (entry.is_credit(), entry.expires_at) {
            batch.put_cf(cf_expiry, expiry_key(expires_at, &entry.user_id, &entry.id)?, b"");
        }
        for closed in closed_lots {
            batch.delete_cf(
                cf_expiry,
                expiry_key(closed.expires_at, &entry.user_id, &closed.lot_id)?,
            );
        }

        self.db.write(batch)?;

        tracing::debug!(
            entry_id = %entry.id,
            user_id = %entry.user_id,
            delta = entry.delta,
            reason = %entry.reason,
            version = summary.version,
            "Entry appended"
        );

        Ok(())
    }

    /// Get entry by ID
    pub fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        let cf_index = self.cf_handle(CF_ENTRY_INDEX)?;
        let key = self
            .db
            .get_cf(cf_index, entry_id.as_bytes())?
            .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))?;

        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let value = self.db.get_cf(cf_entries, &key)?.ok_or_else(|| {
            Error::InvariantViolation(format!("entry {} indexed but missing", entry_id))
        })?;

        Ok(bincode::deserialize(&value)?)
    }

    /// All entries of a user in FIFO order
    pub fn get_user_entries(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        let prefix: &[u8] = user_id.as_bytes();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push(bincode::deserialize(&value)?);
        }

        Ok(entries)
    }

    // Summary operations

    /// Put summary
    pub fn put_summary(&self, summary: &UserLoyaltySummary) -> Result<()> {
        let cf = self.cf_handle(CF_SUMMARIES)?;
        self.db
            .put_cf(cf, summary.user_id.as_bytes(), bincode::serialize(summary)?)?;
        Ok(())
    }

    /// Get summary, `None` for users with no entries
    pub fn get_summary(&self, user_id: &UserId) -> Result<Option<UserLoyaltySummary>> {
        let cf = self.cf_handle(CF_SUMMARIES)?;
        match self.db.get_cf(cf, user_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Every user with a summary
    pub fn list_users(&self) -> Result<Vec<UserId>> {
        let cf = self.cf_handle(CF_SUMMARIES)?;
        let mut users = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            users.push(user_from_bytes(&key)?);
        }
        Ok(users)
    }

    // Sweep index

    /// Users holding at least one indexed lot with `expires_at <= as_of`
    pub fn users_with_expired_lots(&self, as_of: DateTime<Utc>) -> Result<Vec<UserId>> {
        let cf = self.cf_handle(CF_EXPIRY_INDEX)?;
        let cutoff = time_key(as_of)?;

        let mut users = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if key.len() < 24 {
                return Err(Error::Storage("malformed expiry index key".to_string()));
            }
            if key[..8] > cutoff[..] {
                break;
            }
            let user = user_from_bytes(&key[8..24])?;
            if !users.contains(&user) {
                users.push(user);
            }
        }

        Ok(users)
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_entries: self.approximate_count(self.cf_handle(CF_ENTRIES)?)?,
            total_users: self.approximate_count(self.cf_handle(CF_SUMMARIES)?)?,
            pending_expiry_lots: self.approximate_count(self.cf_handle(CF_EXPIRY_INDEX)?)?,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }
}

/// Storage statistics (approximate)
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Ledger entries
    pub total_entries: u64,
    /// Users with a summary
    pub total_users: u64,
    /// Expiring lots still indexed
    pub pending_expiry_lots: u64,
}

// Key helpers

fn time_key(at: DateTime<Utc>) -> Result<[u8; 8]> {
    let nanos = at
        .timestamp_nanos_opt()
        .ok_or_else(|| Error::InvalidEntry(format!("timestamp {} out of range", at)))?;
    Ok(((nanos as u64) ^ (1 << 63)).to_be_bytes())
}

fn entry_key(user_id: &UserId, created_at: DateTime<Utc>, entry_id: &Uuid) -> Result<Vec<u8>> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&time_key(created_at)?);
    key.extend_from_slice(entry_id.as_bytes());
    Ok(key)
}

fn expiry_key(expires_at: DateTime<Utc>, user_id: &UserId, lot_id: &Uuid) -> Result<Vec<u8>> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(&time_key(expires_at)?);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(lot_id.as_bytes());
    Ok(key)
}

fn user_from_bytes(bytes: &[u8]) -> Result<UserId> {
    let raw: [u8; 16] = bytes
        .get(..16)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Storage("malformed user key".to_string()))?;
    Ok(UserId::new(Uuid::from_bytes(raw)))
}
