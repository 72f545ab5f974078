//! RocksDB-based persistent storage

use super::kv::{BatchOp, Column, KvStore, WriteBatch};
use crate::{Error, Result};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, DB};
use std::path::Path;

/// `KvStore` backed by RocksDB, one column family per `Column`
pub struct RocksKv {
    db: DB,
}

impl RocksKv {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Storage(format!("Failed to create database directory: {}", e)))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs: Vec<ColumnFamilyDescriptor> = Column::ALL
            .iter()
            .map(|c| ColumnFamilyDescriptor::new(c.name(), Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, cfs)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        Ok(Self { db })
    }

    fn cf(&self, column: Column) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(column.name())
            .ok_or_else(|| Error::Storage(format!("Missing {} column family", column.name())))
    }
}

impl KvStore for RocksKv {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(column)?;
        self.db
            .get_cf(cf, key)
            .map_err(|e| Error::Storage(format!("Failed to read {}: {}", column.name(), e)))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { column, key, value } => {
                    rocks_batch.put_cf(self.cf(column)?, key, value);
                }
                BatchOp::Delete { column, key } => {
                    rocks_batch.delete_cf(self.cf(column)?, key);
                }
            }
        }
        self.db
            .write(rocks_batch)
            .map_err(|e| Error::Storage(format!("Failed to write batch: {}", e)))
    }

    fn scan(&self, column: Column, start: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(column)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(start, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter.take(limit) {
            let (key, value) =
                item.map_err(|e| Error::Storage(format!("Iterator error: {}", e)))?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn last_key(&self, column: Column) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(column)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item.map_err(|e| Error::Storage(format!("Iterator error: {}", e)))?;
                Ok(Some(key.to_vec()))
            }
            None => Ok(None),
        }
    }
}
