//! Store boundary for the integrity core
//!
//! The core reads events and cards through [`LedgerReader`] and writes
//! repaired (or, for demos, tampered) events through [`LedgerWriter`]. A
//! batch passed to `persist_card_events` belongs to one card and must become
//! visible all at once.

use crate::types::{Card, LedgerEvent};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Bulk load of cards and events, as exchanged in JSON files
///
/// Unsealed events may omit `hash` and `prev_hash`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Card balances
    #[serde(default)]
    pub cards: Vec<Card>,
    /// Events of any card, in any order
    #[serde(default)]
    pub events: Vec<LedgerEvent>,
}

/// Read boundary: events and card snapshots
pub trait LedgerReader: Send + Sync {
    /// All events of all cards (any order)
    fn load_events(&self) -> Result<Vec<LedgerEvent>>;

    /// All events of one card (any order)
    fn load_card_events(&self, card_id: Uuid) -> Result<Vec<LedgerEvent>>;

    /// All registered cards
    fn load_cards(&self) -> Result<Vec<Card>>;

    /// Single event by ID
    fn get_event(&self, event_id: Uuid) -> Result<Option<LedgerEvent>>;
}

/// Write boundary: corrected events of one card, applied atomically
pub trait LedgerWriter: Send + Sync {
    /// Overwrite `events` (all belonging to `card_id`) in one batch
    fn persist_card_events(&self, card_id: Uuid, events: &[LedgerEvent]) -> Result<()>;
}

/// Full store capability set used by the service facade
pub trait LedgerStore: LedgerReader + LedgerWriter {}

impl<T: LedgerReader + LedgerWriter> LedgerStore for T {}

/// Reject a batch that mixes cards
pub(crate) fn check_batch(card_id: Uuid, events: &[LedgerEvent]) -> Result<()> {
    match events.iter().find(|e| e.card_id != card_id) {
        Some(stray) => Err(Error::InvalidEvent(format!(
            "event {} belongs to card {}, not {}",
            stray.id, stray.card_id, card_id
        ))),
        None => Ok(()),
    }
}

/// In-memory store for tests, demos and embedding
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    events: HashMap<Uuid, LedgerEvent>,
    card_index: HashMap<Uuid, Vec<Uuid>>,
    cards: BTreeMap<Uuid, Card>,
}

impl InMemoryStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create store preloaded with cards and events (ingestion checks apply)
    pub fn with_data(
        cards: impl IntoIterator<Item = Card>,
        events: impl IntoIterator<Item = LedgerEvent>,
    ) -> Result<Self> {
        let store = Self::new();
        for card in cards {
            store.put_card(card);
        }
        for event in events {
            store.append_event(event)?;
        }
        Ok(store)
    }

    /// Register or update a card snapshot
    pub fn put_card(&self, card: Card) {
        self.inner.write().cards.insert(card.id, card);
    }

    /// Ingest a new event
    pub fn append_event(&self, event: LedgerEvent) -> Result<()> {
        event.validate()?;

        let mut state = self.inner.write();
        if state.events.contains_key(&event.id) {
            return Err(Error::InvalidEvent(format!("duplicate event {}", event.id)));
        }
        state
            .card_index
            .entry(event.card_id)
            .or_default()
            .push(event.id);
        state.events.insert(event.id, event);
        Ok(())
    }

    /// Number of stored events
    pub fn event_count(&self) -> usize {
        self.inner.read().events.len()
    }
}

impl LedgerReader for InMemoryStore {
    fn load_events(&self) -> Result<Vec<LedgerEvent>> {
        Ok(self.inner.read().events.values().cloned().collect())
    }

    fn load_card_events(&self, card_id: Uuid) -> Result<Vec<LedgerEvent>> {
        let state = self.inner.read();
        Ok(state
            .card_index
            .get(&card_id)
            .map(|ids| ids.iter().filter_map(|id| state.events.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    fn load_cards(&self) -> Result<Vec<Card>> {
        Ok(self.inner.read().cards.values().cloned().collect())
    }

    fn get_event(&self, event_id: Uuid) -> Result<Option<LedgerEvent>> {
        Ok(self.inner.read().events.get(&event_id).cloned())
    }
}

impl LedgerWriter for InMemoryStore {
    fn persist_card_events(&self, card_id: Uuid, events: &[LedgerEvent]) -> Result<()> {
        check_batch(card_id, events)?;

        let mut state = self.inner.write();
        if let Some(missing) = events.iter().find(|e| !state.events.contains_key(&e.id)) {
            return Err(Error::EventNotFound(missing.id.to_string()));
        }
        for event in events {
            state.events.insert(event.id, event.clone());
        }
        Ok(())
    }
}
