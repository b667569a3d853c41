//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `balances` - Balance records (key: address)
//! - `by_value` - Value index for range queries (key: value key || address)
//! - `meta` - Resume height and other bookkeeping
//!
//! Value keys sort descending: the integral and fractional parts of the
//! balance are written as order-preserving big-endian integers and then
//! bit-inverted, so a forward iteration yields the richest address first.

use crate::{
    config::Config,
    error::{Error, Result},
    store::{BalanceBatch, BalanceStore},
    types::Address,
};
use parking_lot::Mutex;
use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Column family names
const CF_BALANCES: &str = "balances";
const CF_BY_VALUE: &str = "by_value";
const CF_META: &str = "meta";

const KEY_NEXT_HEIGHT: &[u8] = b"next_height";

/// Length of the value prefix of a `by_value` key
const VALUE_KEY_LEN: usize = 32;

/// Fractional digits kept in a value key
const FRACTION_SCALE: u32 = 28;

/// Stored balance of one address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    /// Current balance
    pub value: Decimal,
    /// Height of the last block that changed it
    pub last_height: Option<u64>,
}

/// RocksDB balance store
pub struct RocksStore {
    db: Arc<DB>,
    // Read-modify-write of the value index must not interleave
    writer: Mutex<()>,
}

impl RocksStore {
    /// Open or create database under `config.data_dir`
    pub fn open(config: &Config) -> Result<Self> {
        let path = config.data_dir.join("balances");

        // Create directory if not exists
        std::fs::create_dir_all(&path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_BALANCES, Self::cf_options_balances()),
            ColumnFamilyDescriptor::new(CF_BY_VALUE, Self::cf_options_by_value()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, &path, cf_descriptors)?;

        tracing::info!("Opened RocksDB balance store at {:?}", path);

        Ok(Self {
            db: Arc::new(db),
            writer: Mutex::new(()),
        })
    }

    fn cf_options_balances() -> Options {
        let mut opts = Options::default();
        // Point lookups on every block, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_by_value() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Balance record of `address`
    pub fn get_record(&self, address: &Address) -> Result<Option<BalanceRecord>> {
        let cf = self.cf_handle(CF_BALANCES)?;
        match self.db.get_cf(&cf, address.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Queue the record and index updates for one address
    fn stage(
        &self,
        batch: &mut WriteBatch,
        address: &Address,
        value: Decimal,
        height: Option<u64>,
    ) -> Result<()> {
        let cf_balances = self.cf_handle(CF_BALANCES)?;
        let cf_by_value = self.cf_handle(CF_BY_VALUE)?;

        let previous = self.get_record(address)?;
        if let Some(previous) = &previous {
            batch.delete_cf(&cf_by_value, value_key(previous.value, address));
        }

        let record = BalanceRecord {
            value,
            last_height: height.or(previous.and_then(|p| p.last_height)),
        };
        batch.put_cf(
            &cf_balances,
            address.as_str().as_bytes(),
            bincode::serialize(&record)?,
        );
        batch.put_cf(&cf_by_value, value_key(value, address), value.serialize());

        Ok(())
    }

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        let cf = self.cf_handle(CF_BALANCES)?;
        // RocksDB property for approximate count
        let addresses = self
            .db
            .property_int_value_cf(&cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(StorageStats {
            addresses,
            next_height: self.next_height()?,
        })
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

impl BalanceStore for RocksStore {
    fn get(&self, address: &Address) -> Result<Decimal> {
        Ok(self
            .get_record(address)?
            .map(|r| r.value)
            .unwrap_or(Decimal::ZERO))
    }

    fn set(&self, address: &Address, value: Decimal) -> Result<()> {
        let _guard = self.writer.lock();
        let mut batch = WriteBatch::default();
        self.stage(&mut batch, address, value, None)?;
        self.db.write(batch)?;
        Ok(())
    }

    fn range(
        &self,
        min_value: Decimal,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Address, Decimal)>> {
        let cf = self.cf_handle(CF_BY_VALUE)?;
        let mut entries = Vec::new();
        let mut skipped = 0;

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            if entries.len() >= limit {
                break;
            }

            let (key, raw_value) = item?;
            let value = decode_value(&raw_value)?;
            if value < min_value {
                break;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }

            let address = std::str::from_utf8(&key[VALUE_KEY_LEN..])
                .map_err(|e| Error::Storage(format!("Corrupt value index key: {}", e)))?;
            entries.push((Address::new(address), value));
        }

        Ok(entries)
    }

    fn next_height(&self) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(&cf, KEY_NEXT_HEIGHT)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("Corrupt resume height".to_string()))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn set_next_height(&self, height: u64) -> Result<()> {
        let cf = self.cf_handle(CF_META)?;
        self.db.put_cf(&cf, KEY_NEXT_HEIGHT, height.to_be_bytes())?;
        Ok(())
    }

    /// Balances and resume height land in one atomic `WriteBatch`
    fn commit(&self, balances: &BalanceBatch) -> Result<()> {
        let _guard = self.writer.lock();
        let mut batch = WriteBatch::default();

        for (address, value) in &balances.balances {
            self.stage(&mut batch, address, *value, Some(balances.height))?;
        }

        let cf_meta = self.cf_handle(CF_META)?;
        batch.put_cf(&cf_meta, KEY_NEXT_HEIGHT, (balances.height + 1).to_be_bytes());

        // Atomic commit
        self.db.write(batch)?;

        tracing::debug!(
            height = balances.height,
            addresses = balances.balances.len(),
            "Balances committed"
        );

        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Approximate number of addresses
    pub addresses: u64,
    /// Resume height
    pub next_height: Option<u64>,
}

fn sortable(x: i128) -> [u8; 16] {
    ((x as u128) ^ (1u128 << 127)).to_be_bytes()
}

/// Index key: descending value prefix followed by the address
fn value_key(value: Decimal, address: &Address) -> Vec<u8> {
    let mut integral = value.trunc();
    integral.rescale(0);
    let fraction = value.fract();
    let fraction_digits = fraction.mantissa() * 10i128.pow(FRACTION_SCALE - fraction.scale());

    let mut key = Vec::with_capacity(VALUE_KEY_LEN + address.as_str().len());
    key.extend(sortable(integral.mantissa()).iter().map(|b| !b));
    key.extend(sortable(fraction_digits).iter().map(|b| !b));
    key.extend_from_slice(address.as_str().as_bytes());
    key
}

fn decode_value(raw: &[u8]) -> Result<Decimal> {
    let bytes: [u8; 16] = raw
        .try_into()
        .map_err(|_| Error::Storage("Corrupt value index entry".to_string()))?;
    Ok(Decimal::deserialize(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (config, temp_dir)
    }

    fn addr(s: &str) -> Address {
        Address::new(s)
    }

    #[test]
    fn test_value_key_order() {
        let values = [
            dec!(-1000.5),
            dec!(-3.5),
            dec!(-3.25),
            dec!(-1),
            dec!(-0.9),
            dec!(0),
            dec!(0.000000001),
            dec!(0.25),
            dec!(1),
            dec!(1.5),
            dec!(695099000),
        ];
        let a = addr("x");
        for pair in values.windows(2) {
            // Larger values sort first
            assert!(
                value_key(pair[1], &a) < value_key(pair[0], &a),
                "{} should sort before {}",
                pair[1],
                pair[0]
            );
        }
        assert_eq!(value_key(dec!(2.50), &a), value_key(dec!(2.5), &a));
    }

    #[test]
    fn test_storage_open() {
        let (config, _temp) = test_config();
        let store = RocksStore::open(&config).unwrap();
        assert!(store.db.cf_handle(CF_BALANCES).is_some());
        assert!(store.db.cf_handle(CF_BY_VALUE).is_some());
        assert_eq!(store.next_height().unwrap(), None);
    }

    #[test]
    fn test_set_and_get() {
        let (config, _temp) = test_config();
        let store = RocksStore::open(&config).unwrap();

        assert_eq!(store.get(&addr("a")).unwrap(), Decimal::ZERO);
        store.set(&addr("a"), dec!(12.000000001)).unwrap();
        store.set(&addr("a"), dec!(13)).unwrap();
        assert_eq!(store.get(&addr("a")).unwrap(), dec!(13));
        assert_eq!(store.range(Decimal::MIN, 0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_range() {
        let (config, _temp) = test_config();
        let store = RocksStore::open(&config).unwrap();

        store.set(&addr("a"), dec!(10)).unwrap();
        store.set(&addr("b"), dec!(30)).unwrap();
        store.set(&addr("c"), dec!(20)).unwrap();
        store.set(&addr("d"), dec!(20)).unwrap();
        store.set(&addr("e"), dec!(-4)).unwrap();

        let all = store.range(Decimal::MIN, 0, 100).unwrap();
        let order: Vec<&str> = all.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "d", "a", "e"]);

        let page = store.range(dec!(10), 1, 2).unwrap();
        assert_eq!(page, vec![(addr("c"), dec!(20)), (addr("d"), dec!(20))]);
        assert!(store.range(dec!(100), 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_commit_is_durable() {
        let (config, _temp) = test_config();
        {
            let store = RocksStore::open(&config).unwrap();
            store
                .commit(&BalanceBatch {
                    height: 4,
                    balances: vec![(addr("a"), dec!(60)), (addr("b"), dec!(40))],
                })
                .unwrap();
            store.close().unwrap();
        }

        let store = RocksStore::open(&config).unwrap();
        assert_eq!(store.next_height().unwrap(), Some(5));
        assert_eq!(store.get(&addr("a")).unwrap(), dec!(60));
        assert_eq!(
            store.get_record(&addr("b")).unwrap(),
            Some(BalanceRecord {
                value: dec!(40),
                last_height: Some(4)
            })
        );
        assert_eq!(store.get_stats().unwrap().next_height, Some(5));
    }
}
