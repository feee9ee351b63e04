use crate::domain::ports::{StorageBackend, Table, WriteOp};
use crate::error::{MarketError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;

/// A persistent backend using RocksDB.
///
/// Every logical [`Table`] lives in its own Column Family, so prefix scans never
/// cross tables. A committed unit of work becomes one `WriteBatch`, which RocksDB
/// applies atomically.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBBackend {
    db: Arc<DB>,
}

impl RocksDBBackend {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that one column family per table exists.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = Table::ALL
            .iter()
            .map(|table| ColumnFamilyDescriptor::new(table.name(), Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, table: Table) -> Result<&ColumnFamily> {
        self.db.cf_handle(table.name()).ok_or_else(|| {
            MarketError::Storage(format!("column family {} not found", table.name()))
        })
    }
}

#[async_trait]
impl StorageBackend for RocksDBBackend {
    async fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(table)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    async fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(table)?;
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }

        Ok(rows)
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> Result<()> {
        let mut write = WriteBatch::default();
        for op in batch {
            match op {
                WriteOp::Put { table, key, value } => write.put_cf(self.cf(table)?, key, value),
                WriteOp::Delete { table, key } => write.delete_cf(self.cf(table)?, key),
            }
        }
        self.db.write(write)?;
        Ok(())
    }
}
