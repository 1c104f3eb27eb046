//! Branch repair
//!
//! Repair is a compensating action: one forward pass over a card's events in
//! chronological order recomputes every hash and points every `prev_hash`
//! at its predecessor. Only the events that actually changed are written,
//! in one batch, so repairing a consistent chain performs no write.
//!
//! Repairs of the same card are serialized by an advisory per-card lock;
//! different cards repair concurrently.

use crate::crypto::{digests_match, hash_event};
use crate::merkle::{card_merkle_root, CardBranch, MerkleCache};
use crate::metrics::Metrics;
use crate::store::LedgerStore;
use crate::types::{is_genesis_marker, sort_chronologically, LedgerEvent, GENESIS_PREV_HASH};
use crate::{Error, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Result of repairing one card
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairOutcome {
    /// Card repaired
    pub card_id: Uuid,
    /// Events whose hash or link was rewritten (0 when already consistent)
    pub events_rewritten: usize,
    /// Merkle root of the repaired chain
    pub merkle_root: String,
}

/// Relink events (already chronological) in place
///
/// Returns the positions of the events that changed.
pub fn relink_chain(events: &mut [LedgerEvent]) -> Vec<usize> {
    let mut changed = Vec::new();

    for i in 0..events.len() {
        let mut touched = false;

        if i == 0 {
            if !is_genesis_marker(&events[0].prev_hash) {
                events[0].prev_hash = GENESIS_PREV_HASH.to_string();
                touched = true;
            }
        } else if !digests_match(&events[i].prev_hash, &events[i - 1].hash) {
            events[i].prev_hash = events[i - 1].hash.clone();
            touched = true;
        }

        let computed = hash_event(&events[i]);
        if !digests_match(&events[i].hash, &computed) {
            events[i].hash = computed;
            touched = true;
        }

        if touched {
            changed.push(i);
        }
    }

    changed
}

/// Order, link and hash freshly imported events, card by card
///
/// Output is grouped by card, each group in chronological order.
pub fn seal_chains(events: Vec<LedgerEvent>) -> Vec<LedgerEvent> {
    let mut by_card: BTreeMap<Uuid, Vec<LedgerEvent>> = BTreeMap::new();
    for event in events {
        by_card.entry(event.card_id).or_default().push(event);
    }

    let mut sealed = Vec::new();
    for (_, mut events) in by_card {
        sort_chronologically(&mut events);
        relink_chain(&mut events);
        sealed.extend(events);
    }
    sealed
}

/// Recomputes and relinks card chains, persisting the corrections
#[derive(Clone)]
pub struct BranchRepairer {
    store: Arc<dyn LedgerStore>,
    cache: Arc<MerkleCache>,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for BranchRepairer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchRepairer")
            .field("cached_cards", &self.cache.len())
            .field("locked_cards", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl BranchRepairer {
    /// Create repairer over `store`, refreshing roots in `cache`
    pub fn new(store: Arc<dyn LedgerStore>, cache: Arc<MerkleCache>) -> Self {
        Self {
            store,
            cache,
            locks: Arc::new(DashMap::new()),
            metrics: None,
        }
    }

    /// Record repair metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Repair one card; `None` when it has no events
    pub async fn repair_card(&self, card_id: Uuid) -> Result<Option<RepairOutcome>> {
        self.with_card_lock(card_id, self.repair_locked(card_id)).await
    }

    /// Recompute a card's root from the store and cache it
    pub async fn refresh_root(&self, card_id: Uuid) -> Result<Option<String>> {
        self.with_card_lock(card_id, self.refresh_locked(card_id)).await
    }

    async fn refresh_locked(&self, card_id: Uuid) -> Result<Option<String>> {
        let mut events = self
            .blocking(move |store| store.load_card_events(card_id))
            .await?;
        if events.is_empty() {
            self.cache.invalidate(card_id);
            return Ok(None);
        }

        sort_chronologically(&mut events);
        let root = card_merkle_root(&events)?;
        self.cache.store(
            card_id,
            CardBranch {
                root: root.clone(),
                events,
            },
        );
        Ok(Some(root))
    }

    async fn repair_locked(&self, card_id: Uuid) -> Result<Option<RepairOutcome>> {
        let mut events = self
            .blocking(move |store| store.load_card_events(card_id))
            .await?;

        if events.is_empty() {
            self.cache.invalidate(card_id);
            tracing::debug!(card_id = %card_id, "No events to repair");
            return Ok(None);
        }

        sort_chronologically(&mut events);
        let changed = relink_chain(&mut events);

        if !changed.is_empty() {
            let batch: Vec<LedgerEvent> = changed.iter().map(|&i| events[i].clone()).collect();
            self.blocking(move |store| store.persist_card_events(card_id, &batch))
                .await?;

            tracing::warn!(
                card_id = %card_id,
                rewritten = changed.len(),
                first_position = changed[0],
                "Card chain repaired"
            );

            if let Some(metrics) = &self.metrics {
                metrics.record_repair(changed.len());
            }
        }

        let merkle_root = card_merkle_root(&events)?;
        self.cache.store(
            card_id,
            CardBranch {
                root: merkle_root.clone(),
                events,
            },
        );

        Ok(Some(RepairOutcome {
            card_id,
            events_rewritten: changed.len(),
            merkle_root,
        }))
    }

    /// Repair every card that has events
    ///
    /// All cards are attempted; the first failure is returned after the
    /// others have finished.
    pub async fn repair_all(&self) -> Result<Vec<RepairOutcome>> {
        let events = self.blocking(|store| store.load_events()).await?;
        let card_ids: BTreeSet<Uuid> = events.iter().map(|e| e.card_id).collect();

        let mut tasks = JoinSet::new();
        for card_id in card_ids {
            let repairer = self.clone();
            tasks.spawn(async move { repairer.repair_card(card_id).await });
        }

        let mut outcomes = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(Error::from).and_then(|r| r) {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Card repair failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        outcomes.sort_by_key(|o| o.card_id);
        tracing::info!(
            cards = outcomes.len(),
            rewritten = outcomes.iter().map(|o| o.events_rewritten).sum::<usize>(),
            "Repair of all cards complete"
        );

        Ok(outcomes)
    }

    /// Repair the card owning `event_id`
    pub async fn repair_event(&self, event_id: Uuid) -> Result<Option<RepairOutcome>> {
        let event = self
            .blocking(move |store| store.get_event(event_id))
            .await?
            .ok_or_else(|| Error::EventNotFound(event_id.to_string()))?;

        self.repair_card(event.card_id).await
    }

    /// Run `work` holding the card's lock, then drop the lock entry if idle
    async fn with_card_lock<T>(&self, card_id: Uuid, work: impl Future<Output = T>) -> T {
        let lock = self.locks.entry(card_id).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            work.await
        };
        drop(lock);

        // The map holds one reference; any other belongs to a waiting task
        self.locks
            .remove_if(&card_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Run a store call on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn LedgerStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref())).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ChainAuditor;
    use crate::orchestrator::IntegrityOrchestrator;
    use crate::store::{InMemoryStore, LedgerReader, LedgerSnapshot, LedgerWriter};
    use crate::testing::card_chain;
    use crate::types::Card;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts persisted batches
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryStore,
        writes: AtomicUsize,
    }

    impl LedgerReader for CountingStore {
        fn load_events(&self) -> Result<Vec<LedgerEvent>> {
            self.inner.load_events()
        }
        fn load_card_events(&self, card_id: Uuid) -> Result<Vec<LedgerEvent>> {
            self.inner.load_card_events(card_id)
        }
        fn load_cards(&self) -> Result<Vec<Card>> {
            self.inner.load_cards()
        }
        fn get_event(&self, event_id: Uuid) -> Result<Option<LedgerEvent>> {
            self.inner.get_event(event_id)
        }
    }

    impl LedgerWriter for CountingStore {
        fn persist_card_events(&self, card_id: Uuid, events: &[LedgerEvent]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.persist_card_events(card_id, events)
        }
    }

    fn repairer_over(events: Vec<LedgerEvent>) -> (BranchRepairer, Arc<CountingStore>) {
        let store = Arc::new(CountingStore::default());
        for event in events {
            store.inner.append_event(event).unwrap();
        }
        let repairer = BranchRepairer::new(store.clone(), Arc::new(MerkleCache::new()));
        (repairer, store)
    }

    fn chain_issues(store: &CountingStore, card_id: Uuid) -> usize {
        let mut events = store.load_card_events(card_id).unwrap();
        sort_chronologically(&mut events);
        ChainAuditor::audit_chain(card_id, &events).len()
    }

    #[test]
    fn test_relink_valid_chain_changes_nothing() {
        let (_, mut events) = card_chain(4);
        let before = events.clone();
        assert!(relink_chain(&mut events).is_empty());
        assert_eq!(events, before);
    }

    #[test]
    fn test_relink_cascades_after_edit() {
        let (card_id, mut events) = card_chain(4);
        events[1].fare_charged = Decimal::ONE;

        let changed = relink_chain(&mut events);
        assert_eq!(changed, vec![1, 2, 3]);
        assert!(ChainAuditor::audit_chain(card_id, &events).is_empty());
    }

    #[test]
    fn test_relink_first_event_genesis() {
        let (_, mut events) = card_chain(2);
        events[0].prev_hash = "ab".repeat(32);
        relink_chain(&mut events);
        assert_eq!(events[0].prev_hash, GENESIS_PREV_HASH);

        // Any recognized marker is kept as-is
        let (_, mut events) = card_chain(2);
        events[0].prev_hash = "genesis".to_string();
        let changed = relink_chain(&mut events);
        assert_eq!(events[0].prev_hash, "genesis");
        assert_eq!(changed, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_repair_card_fixes_chain() {
        let (card_id, mut events) = card_chain(4);
        events[2].station = Some("Tampered".to_string());
        let (repairer, store) = repairer_over(events);
        assert!(chain_issues(&store, card_id) > 0);

        let outcome = repairer.repair_card(card_id).await.unwrap().unwrap();

        assert_eq!(outcome.events_rewritten, 2);
        assert_eq!(chain_issues(&store, card_id), 0);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(repairer.cache.root(card_id), Some(outcome.merkle_root));
    }

    #[tokio::test]
    async fn test_second_repair_is_a_no_op() {
        let (card_id, mut events) = card_chain(3);
        events[0].hash = "0".repeat(64);
        let (repairer, store) = repairer_over(events);

        let first = repairer.repair_card(card_id).await.unwrap().unwrap();
        let snapshot = store.load_card_events(card_id).unwrap();
        let second = repairer.repair_card(card_id).await.unwrap().unwrap();

        assert_eq!(second.events_rewritten, 0);
        assert_eq!(second.merkle_root, first.merkle_root);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(store.load_card_events(card_id).unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_consistent_chain_is_not_written() {
        let (card_id, events) = card_chain(5);
        let (repairer, store) = repairer_over(events.clone());

        let outcome = repairer.repair_card(card_id).await.unwrap().unwrap();

        assert_eq!(outcome.events_rewritten, 0);
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.merkle_root, card_merkle_root(&events).unwrap());
    }

    #[tokio::test]
    async fn test_repair_card_without_events() {
        let (repairer, store) = repairer_over(vec![]);
        assert_eq!(repairer.repair_card(Uuid::new_v4()).await.unwrap(), None);
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_repair_event_resolves_card() {
        let (card_id, mut events) = card_chain(3);
        events[1].fare_charged += Decimal::ONE;
        let event_id = events[1].id;
        let (repairer, store) = repairer_over(events);

        let outcome = repairer.repair_event(event_id).await.unwrap().unwrap();

        assert_eq!(outcome.card_id, card_id);
        assert_eq!(chain_issues(&store, card_id), 0);
    }

    #[tokio::test]
    async fn test_repair_event_unknown_id() {
        let (repairer, _) = repairer_over(vec![]);
        let result = repairer.repair_event(Uuid::new_v4()).await;
        assert!(matches!(result, Err(Error::EventNotFound(_))));
    }

    #[tokio::test]
    async fn test_repair_all_cards() {
        let (card_a, mut events_a) = card_chain(3);
        let (card_b, events_b) = card_chain(2);
        events_a[0].fare_charged = Decimal::new(2000, 2);

        let mut all = events_a;
        all.extend(events_b);
        let (repairer, store) = repairer_over(all);

        let outcomes = repairer.repair_all().await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(chain_issues(&store, card_a), 0);
        assert_eq!(chain_issues(&store, card_b), 0);
        let rewritten: usize = outcomes.iter().map(|o| o.events_rewritten).sum();
        assert_eq!(rewritten, 3);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_repairs_of_one_card() {
        let (card_id, mut events) = card_chain(6);
        events[1].station = Some("Elsewhere".to_string());
        let (repairer, store) = repairer_over(events);

        let (a, b) = tokio::join!(repairer.repair_card(card_id), repairer.repair_card(card_id));
        let total = a.unwrap().unwrap().events_rewritten + b.unwrap().unwrap().events_rewritten;

        assert_eq!(total, 5);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(chain_issues(&store, card_id), 0);
        assert!(repairer.locks.is_empty());
    }

    #[tokio::test]
    async fn test_lock_entries_are_released() {
        let mut all = Vec::new();
        for _ in 0..5 {
            let (_, mut events) = card_chain(3);
            events[1].hash = "0".repeat(64);
            all.extend(events);
        }
        let (repairer, _) = repairer_over(all);

        assert_eq!(repairer.repair_all().await.unwrap().len(), 5);
        repairer.repair_card(Uuid::new_v4()).await.unwrap();

        assert!(repairer.locks.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_root_follows_the_store() {
        let (card_id, events) = card_chain(3);
        let (repairer, store) = repairer_over(events.clone());
        repairer.cache.store(
            card_id,
            CardBranch {
                root: "stale".to_string(),
                events: vec![],
            },
        );

        let root = repairer.refresh_root(card_id).await.unwrap();
        assert_eq!(root, Some(card_merkle_root(&events).unwrap()));
        assert_eq!(repairer.cache.root(card_id), root);

        let extra = LedgerEvent::new(
            card_id,
            crate::types::EventType::TopUp,
            Decimal::TEN,
            None,
            crate::testing::ts(3600),
        )
        .seal(events[2].hash.clone());
        store.inner.append_event(extra.clone()).unwrap();

        let mut expected = events;
        expected.push(extra);
        let root = repairer.refresh_root(card_id).await.unwrap();
        assert_eq!(root, Some(card_merkle_root(&expected).unwrap()));

        assert_eq!(repairer.refresh_root(Uuid::new_v4()).await.unwrap(), None);
        assert!(repairer.locks.is_empty());
    }

    #[test]
    fn test_seal_chains_groups_and_links() {
        let (card_a, chain_a) = card_chain(4);
        let (card_b, chain_b) = card_chain(3);
        let mut unsealed: Vec<LedgerEvent> = chain_a
            .iter()
            .chain(chain_b.iter())
            .rev()
            .map(|e| LedgerEvent {
                hash: String::new(),
                prev_hash: GENESIS_PREV_HASH.to_string(),
                ..e.clone()
            })
            .collect();
        unsealed.swap(0, 5);

        let sealed = seal_chains(unsealed);

        assert_eq!(sealed.len(), 7);
        for (card_id, chain) in [(card_a, &chain_a), (card_b, &chain_b)] {
            let mine: Vec<LedgerEvent> = sealed
                .iter()
                .filter(|e| e.card_id == card_id)
                .cloned()
                .collect();
            assert_eq!(&mine, chain);
        }
    }

    #[tokio::test]
    async fn test_imported_unsealed_snapshot_validates_clean() {
        let card_id = Uuid::new_v4();
        let json = format!(
            r#"{{
                "cards": [{{ "id": "{card}", "balance": "8.71" }}],
                "events": [
                    {{ "id": "{e3}", "card_id": "{card}", "event_type": "TapOut",
                       "fare_charged": "1.29", "station": "Station B",
                       "timestamp": "2024-04-23T08:30:00Z" }},
                    {{ "id": "{e1}", "card_id": "{card}", "event_type": "TopUp",
                       "fare_charged": "10.00", "station": null,
                       "timestamp": "2024-04-23T08:00:00Z" }},
                    {{ "id": "{e2}", "card_id": "{card}", "event_type": "TapIn",
                       "fare_charged": "0", "station": "Station A",
                       "timestamp": "2024-04-23T08:15:00Z" }}
                ]
            }}"#,
            card = card_id,
            e1 = Uuid::new_v4(),
            e2 = Uuid::new_v4(),
            e3 = Uuid::new_v4(),
        );
        let snapshot: LedgerSnapshot = serde_json::from_str(&json).unwrap();
        assert!(snapshot.events.iter().all(|e| e.hash.is_empty()));

        let events = seal_chains(snapshot.events);
        let report = IntegrityOrchestrator::new(Arc::new(MerkleCache::new()), Default::default())
            .validate(events, snapshot.cards)
            .await
            .unwrap();

        assert!(report.is_clean(), "unexpected issues: {:?}", report.issues);
        assert_eq!(report.events_checked, 3);
    }
}
