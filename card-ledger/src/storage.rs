//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `events` - Ledger events (key: event_id)
//! - `cards` - Card balance snapshots (key: card_id)
//! - `indices` - Card chain index (key: card_id || event_id)
//!
//! Repairs write all corrected events of a card in one `WriteBatch`, so a
//! concurrent reader never observes a half-relinked chain.

use crate::{
    error::{Error, Result},
    store::{check_batch, LedgerReader, LedgerWriter},
    types::{Card, LedgerEvent},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use uuid::Uuid;

/// Column family names
const CF_EVENTS: &str = "events";
const CF_CARDS: &str = "cards";
const CF_INDICES: &str = "indices";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
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
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_EVENTS, Self::cf_options_events()),
            ColumnFamilyDescriptor::new(CF_CARDS, Self::cf_options_cards()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB card ledger");

        Ok(Self { db })
    }

    // Column family options

    fn cf_options_events() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_cards() -> Options {
        let mut opts = Options::default();
        // Cards are read on every audit, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_indices() -> Options {
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

    // Ingestion

    /// Ingest a new event (event row and card index, atomic)
    pub fn append_event(&self, event: &LedgerEvent) -> Result<()> {
        event.validate()?;

        let cf_events = self.cf_handle(CF_EVENTS)?;
        if self.db.get_cf(cf_events, event.id.as_bytes())?.is_some() {
            return Err(Error::InvalidEvent(format!("duplicate event {}", event.id)));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_events, event.id.as_bytes(), bincode::serialize(event)?);

        let cf_indices = self.cf_handle(CF_INDICES)?;
        batch.put_cf(
            cf_indices,
            Self::index_key_card_event(&event.card_id, Some(event.id)),
            b"",
        );

        self.db.write(batch)?;

        tracing::debug!(
            event_id = %event.id,
            card_id = %event.card_id,
            "Event appended"
        );

        Ok(())
    }

    /// Register or update a card snapshot
    pub fn put_card(&self, card: &Card) -> Result<()> {
        let cf = self.cf_handle(CF_CARDS)?;
        self.db.put_cf(cf, card.id.as_bytes(), bincode::serialize(card)?)?;
        Ok(())
    }

    /// Get card by ID
    pub fn get_card(&self, card_id: Uuid) -> Result<Card> {
        let cf = self.cf_handle(CF_CARDS)?;
        let value = self
            .db
            .get_cf(cf, card_id.as_bytes())?
            .ok_or_else(|| Error::CardNotFound(card_id.to_string()))?;
        Ok(bincode::deserialize(&value)?)
    }

    // Index key helpers

    fn index_key_card_event(card_id: &Uuid, event_id: Option<Uuid>) -> Vec<u8> {
        let mut key = card_id.as_bytes().to_vec();
        if let Some(eid) = event_id {
            key.extend_from_slice(eid.as_bytes());
        }
        key
    }

    fn scan_values<T: serde::de::DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf_name)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            values.push(bincode::deserialize(&value)?);
        }
        Ok(values)
    }
}

impl LedgerReader for Storage {
    fn load_events(&self) -> Result<Vec<LedgerEvent>> {
        self.scan_values(CF_EVENTS)
    }

    fn load_card_events(&self, card_id: Uuid) -> Result<Vec<LedgerEvent>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let prefix = Self::index_key_card_event(&card_id, None);

        let iter = self
            .db
            .iterator_cf(cf_indices, IteratorMode::From(&prefix, Direction::Forward));

        let mut events = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }

            let event_id_bytes: [u8; 16] = key[16..]
                .try_into()
                .map_err(|_| Error::Storage(format!("Malformed index key for card {}", card_id)))?;
            let event_id = Uuid::from_bytes(event_id_bytes);

            let event = self
                .get_event(event_id)?
                .ok_or_else(|| Error::EventNotFound(event_id.to_string()))?;
            events.push(event);
        }

        Ok(events)
    }

    fn load_cards(&self) -> Result<Vec<Card>> {
        self.scan_values(CF_CARDS)
    }

    fn get_event(&self, event_id: Uuid) -> Result<Option<LedgerEvent>> {
        let cf = self.cf_handle(CF_EVENTS)?;
        match self.db.get_cf(cf, event_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }
}

impl LedgerWriter for Storage {
    fn persist_card_events(&self, card_id: Uuid, events: &[LedgerEvent]) -> Result<()> {
        check_batch(card_id, events)?;

        let cf_events = self.cf_handle(CF_EVENTS)?;
        let mut batch = WriteBatch::default();

        for event in events {
            if self.db.get_cf(cf_events, event.id.as_bytes())?.is_none() {
                return Err(Error::EventNotFound(event.id.to_string()));
            }
            batch.put_cf(cf_events, event.id.as_bytes(), bincode::serialize(event)?);
        }

        // Atomic commit
        self.db.write(batch)?;

        tracing::debug!(
            card_id = %card_id,
            events = events.len(),
            "Card events persisted"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{card_chain, journey};
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (config, temp_dir)
    }

    #[test]
    fn test_storage_open() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        assert!(storage.db.cf_handle(CF_EVENTS).is_some());
        assert!(storage.db.cf_handle(CF_CARDS).is_some());
        assert!(storage.db.cf_handle(CF_INDICES).is_some());
    }

    #[test]
    fn test_append_and_get_event() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let (_, events) = card_chain(1);

        storage.append_event(&events[0]).unwrap();

        let retrieved = storage.get_event(events[0].id).unwrap().unwrap();
        assert_eq!(retrieved, events[0]);
        assert!(storage.get_event(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_append_rejects_duplicate_and_invalid() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let (_, events) = card_chain(2);

        storage.append_event(&events[0]).unwrap();
        assert!(storage.append_event(&events[0]).is_err());

        let mut no_station = events[1].clone();
        no_station.station = None;
        assert!(matches!(
            storage.append_event(&no_station),
            Err(Error::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_card_round_trip() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let (card, _) = journey(Decimal::new(871, 2));

        storage.put_card(&card).unwrap();
        assert_eq!(storage.get_card(card.id).unwrap(), card);
        assert_eq!(storage.load_cards().unwrap(), vec![card]);
        assert!(matches!(
            storage.get_card(Uuid::new_v4()),
            Err(Error::CardNotFound(_))
        ));
    }

    #[test]
    fn test_load_card_events_stays_within_card() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let (card_a, events_a) = card_chain(3);
        let (_, events_b) = card_chain(2);

        for event in events_a.iter().chain(events_b.iter()) {
            storage.append_event(event).unwrap();
        }

        let loaded = storage.load_card_events(card_a).unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded.iter().all(|e| e.card_id == card_a));
        assert_eq!(storage.load_events().unwrap().len(), 5);
    }

    #[test]
    fn test_persist_card_events() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let (card_id, events) = card_chain(2);
        for event in &events {
            storage.append_event(event).unwrap();
        }

        let mut changed = events.clone();
        for event in &mut changed {
            event.hash = "00".repeat(32);
        }
        storage.persist_card_events(card_id, &changed).unwrap();

        let loaded = storage.get_event(events[1].id).unwrap().unwrap();
        assert_eq!(loaded.hash, "00".repeat(32));
    }

    #[test]
    fn test_persist_is_all_or_nothing() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let (card_id, events) = card_chain(2);
        storage.append_event(&events[0]).unwrap();

        let mut first = events[0].clone();
        first.hash = "00".repeat(32);
        let result = storage.persist_card_events(card_id, &[first, events[1].clone()]);

        assert!(matches!(result, Err(Error::EventNotFound(_))));
        assert_eq!(storage.get_event(events[0].id).unwrap().unwrap(), events[0]);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let (config, _temp) = test_config();
        let (_, events) = card_chain(2);
        {
            let storage = Storage::open(&config).unwrap();
            for event in &events {
                storage.append_event(event).unwrap();
            }
        }

        let storage = Storage::open(&config).unwrap();
        assert_eq!(storage.load_events().unwrap().len(), 2);
    }
}
