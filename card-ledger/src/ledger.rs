//! Card ledger service facade
//!
//! Ties the store, the integrity orchestrator, the branch repairer and the
//! Merkle cache together behind the operations exposed to callers.
//!
//! # Example
//!
//! ```no_run
//! use card_ledger::{CardLedger, Config};
//!
//! #[tokio::main]
//! async fn main() -> card_ledger::Result<()> {
//!     let ledger = CardLedger::open(Config::default())?;
//!
//!     let report = ledger.validate().await?;
//!     if !report.is_clean() {
//!         ledger.fix_all().await?;
//!     }
//!
//!     Ok(())
//! }
//! ```

use crate::{
    merkle::MerkleCache,
    metrics::Metrics,
    orchestrator::{IntegrityOrchestrator, ValidationReport},
    repair::{BranchRepairer, RepairOutcome},
    store::LedgerStore,
    tamper::{TamperRecord, TamperSimulator},
    Config, Error, Result, Storage,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;
use uuid::Uuid;

/// Main card ledger interface
pub struct CardLedger {
    /// Event and card store
    store: Arc<dyn LedgerStore>,

    /// Derived per-card roots
    cache: Arc<MerkleCache>,

    orchestrator: IntegrityOrchestrator,

    repairer: BranchRepairer,

    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for CardLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardLedger")
            .field("config", &self.config)
            .field("cached_cards", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl CardLedger {
    /// Open ledger backed by RocksDB at `config.data_dir`
    pub fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        Self::with_store(storage, config)
    }

    /// Build ledger over any store
    pub fn with_store(store: Arc<dyn LedgerStore>, config: Config) -> Result<Self> {
        let cache = Arc::new(MerkleCache::new());
        let metrics = Metrics::new()?;

        let orchestrator = IntegrityOrchestrator::new(cache.clone(), config.audit.clone())
            .with_metrics(metrics.clone());
        let repairer =
            BranchRepairer::new(store.clone(), cache.clone()).with_metrics(metrics.clone());

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            epsilon = %config.audit.balance_epsilon,
            "Card ledger ready"
        );

        Ok(Self {
            store,
            cache,
            orchestrator,
            repairer,
            metrics,
            config,
        })
    }

    /// Validate every card in the store
    pub async fn validate(&self) -> Result<ValidationReport> {
        self.orchestrator.validate_store(self.store.clone()).await
    }

    /// Repair every card
    pub async fn fix_all(&self) -> Result<Vec<RepairOutcome>> {
        self.repairer.repair_all().await
    }

    /// Repair one card
    pub async fn fix_card(&self, card_id: Uuid) -> Result<Option<RepairOutcome>> {
        self.repairer.repair_card(card_id).await
    }

    /// Repair the card owning an event
    pub async fn fix_event(&self, event_id: Uuid) -> Result<Option<RepairOutcome>> {
        self.repairer.repair_event(event_id).await
    }

    /// Corrupt one random event (demo only)
    pub async fn tamper(&self) -> Result<Option<TamperRecord>> {
        self.tamper_with(&mut StdRng::from_entropy()).await
    }

    /// Corrupt one random event chosen by `rng` and persist it
    pub async fn tamper_with<R: Rng + Send>(&self, rng: &mut R) -> Result<Option<TamperRecord>> {
        let mut events = self.blocking(|store| store.load_events()).await?;

        let record = match TamperSimulator::tamper_random_event(&mut events, rng) {
            Some(record) => record,
            None => return Ok(None),
        };

        let tampered = events
            .into_iter()
            .find(|e| e.id == record.event_id)
            .ok_or_else(|| Error::EventNotFound(record.event_id.to_string()))?;
        let card_id = record.card_id;
        self.blocking(move |store| store.persist_card_events(card_id, &[tampered]))
            .await?;

        self.cache.invalidate(card_id);
        self.metrics.record_tamper();

        Ok(Some(record))
    }

    /// Merkle root of a card, recomputed from the store
    ///
    /// The cache entry is refreshed as a side effect.
    pub async fn merkle_root(&self, card_id: Uuid) -> Result<Option<String>> {
        self.repairer.refresh_root(card_id).await
    }

    /// Get metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Get configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn LedgerStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref())).await?
    }
}
