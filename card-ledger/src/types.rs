//! Core types for the card ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode on disk, JSON at the boundary)
//! - Exact arithmetic (Decimal for money)
//! - A single chronological order per card (timestamp, then event id)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Marker stored in `prev_hash` of the first event of every card chain
pub const GENESIS_PREV_HASH: &str = "Genesis";

/// Whether `prev_hash` marks the start of a chain.
///
/// Rows written by older ingestion paths carry an empty string or an
/// upper-case `GENESIS`; all of them are accepted.
pub fn is_genesis_marker(prev_hash: &str) -> bool {
    prev_hash.is_empty() || prev_hash.eq_ignore_ascii_case(GENESIS_PREV_HASH)
}

fn genesis_prev_hash() -> String {
    GENESIS_PREV_HASH.to_string()
}

/// Stored-value fare card (snapshot read at audit time)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    /// Card ID
    pub id: Uuid,

    /// Balance recorded by the persistence layer
    pub balance: Decimal,
}

impl Card {
    /// Create new card snapshot
    pub fn new(id: Uuid, balance: Decimal) -> Self {
        Self { id, balance }
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "card {} (balance {:.2})", self.id, self.balance)
    }
}

/// Ledger event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Value loaded onto the card; `fare_charged` is the top-up amount
    TopUp,
    /// Entry gate tap; normally zero-cost
    TapIn,
    /// Exit gate tap; `fare_charged` is the journey fare
    TapOut,
}

impl EventType {
    /// Canonical name (part of the hash contract)
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TopUp => "TopUp",
            EventType::TapIn => "TapIn",
            EventType::TapOut => "TapOut",
        }
    }

    /// Whether the event is a gate tap that must name a station
    pub fn requires_station(&self) -> bool {
        matches!(self, EventType::TapIn | EventType::TapOut)
    }

    /// Signed effect of `fare` on the card balance
    pub fn balance_delta(&self, fare: Decimal) -> Decimal {
        match self {
            EventType::TopUp => fare,
            EventType::TapIn | EventType::TapOut => -fare,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hash-chained ledger event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Unique event ID
    pub id: Uuid,

    /// Card this event belongs to
    pub card_id: Uuid,

    /// Type of event
    pub event_type: EventType,

    /// Top-up value or fare (exact decimal, non-negative)
    pub fare_charged: Decimal,

    /// Station name (absent for top-ups)
    pub station: Option<String>,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Hex digest of this event
    #[serde(default)]
    pub hash: String,

    /// Hex digest of the chronologically previous event, or the genesis marker
    #[serde(default = "genesis_prev_hash")]
    pub prev_hash: String,
}

impl LedgerEvent {
    /// Create an unsealed event; `hash` is empty and `prev_hash` is genesis
    /// until [`LedgerEvent::seal`] links it into a chain.
    pub fn new(
        card_id: Uuid,
        event_type: EventType,
        fare_charged: Decimal,
        station: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            card_id,
            event_type,
            fare_charged,
            station,
            timestamp,
            hash: String::new(),
            prev_hash: GENESIS_PREV_HASH.to_string(),
        }
    }

    /// Link this event after `prev_hash` and compute its hash
    pub fn seal(mut self, prev_hash: impl Into<String>) -> Self {
        self.prev_hash = prev_hash.into();
        self.hash = crate::crypto::hash_event(&self);
        self
    }

    /// Station with absence canonicalized to the empty string
    pub fn station_or_empty(&self) -> &str {
        self.station.as_deref().unwrap_or("")
    }

    /// Total chronological order within a card: timestamp, then event id
    pub fn chronological_cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Ingestion preconditions
    pub fn validate(&self) -> crate::Result<()> {
        if self.fare_charged < Decimal::ZERO {
            return Err(crate::Error::InvalidEvent(format!(
                "event {}: fare must not be negative",
                self.id
            )));
        }

        if self.event_type.requires_station()
            && self.station.as_deref().map_or(true, |s| s.trim().is_empty())
        {
            return Err(crate::Error::InvalidEvent(format!(
                "event {}: {} requires a station",
                self.id, self.event_type
            )));
        }

        Ok(())
    }
}

impl fmt::Display for LedgerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {:.2} @ {} [{}]",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.card_id,
            self.event_type,
            self.fare_charged,
            self.station.as_deref().unwrap_or("N/A"),
            short_hash(&self.hash),
        )
    }
}

/// First 8 characters of a digest, for log lines
pub fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

/// Sort events into the canonical chronological order
pub fn sort_chronologically(events: &mut [LedgerEvent]) {
    events.sort_by(LedgerEvent::chronological_cmp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_713_859_200 + secs, 0).unwrap()
    }

    #[test]
    fn test_genesis_marker_variants() {
        assert!(is_genesis_marker("Genesis"));
        assert!(is_genesis_marker("GENESIS"));
        assert!(is_genesis_marker(""));
        assert!(!is_genesis_marker("ab12"));
    }

    #[test]
    fn test_event_type_names_match_serde() {
        for ty in [EventType::TopUp, EventType::TapIn, EventType::TapOut] {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }

    #[test]
    fn test_balance_delta() {
        let fare = Decimal::new(129, 2);
        assert_eq!(EventType::TopUp.balance_delta(fare), fare);
        assert_eq!(EventType::TapOut.balance_delta(fare), -fare);
        assert_eq!(EventType::TapIn.balance_delta(Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_chronological_tie_break_by_id() {
        let card = Uuid::new_v4();
        let mut a = LedgerEvent::new(card, EventType::TopUp, Decimal::TEN, None, at(0));
        let mut b = a.clone();
        a.id = Uuid::from_u128(2);
        b.id = Uuid::from_u128(1);

        let mut events = vec![a.clone(), b.clone()];
        sort_chronologically(&mut events);
        assert_eq!(events[0].id, b.id);
        assert_eq!(events[1].id, a.id);
    }

    #[test]
    fn test_validate_requires_station_for_taps() {
        let card = Uuid::new_v4();
        let tap = LedgerEvent::new(card, EventType::TapIn, Decimal::ZERO, None, at(0));
        assert!(matches!(tap.validate(), Err(crate::Error::InvalidEvent(_))));

        let top_up = LedgerEvent::new(card, EventType::TopUp, Decimal::TEN, None, at(0));
        assert!(top_up.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_negative_fare() {
        let event = LedgerEvent::new(
            Uuid::new_v4(),
            EventType::TapOut,
            Decimal::new(-100, 2),
            Some("Bishan".to_string()),
            at(0),
        );
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_seal_sets_links() {
        let event = LedgerEvent::new(Uuid::new_v4(), EventType::TopUp, Decimal::TEN, None, at(0))
            .seal(GENESIS_PREV_HASH);
        assert_eq!(event.prev_hash, GENESIS_PREV_HASH);
        assert_eq!(event.hash.len(), 64);
    }
}
