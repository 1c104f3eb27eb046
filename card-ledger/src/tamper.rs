//! Tamper simulation for demos and tests
//!
//! Corrupts one event's content without touching its stored hash, so the
//! next validation reports a `HashMismatch` for it.

use crate::types::LedgerEvent;
use chrono::Duration;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Marker appended to a tampered station
const STATION_MARKER: &str = "-Tampered";

/// Field a tamper modified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TamperField {
    /// Fare perturbed by a non-zero amount
    Fare,
    /// Station renamed (or set on a top-up)
    Station,
    /// Timestamp moved forward
    Timestamp,
}

impl fmt::Display for TamperField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TamperField::Fare => write!(f, "fare"),
            TamperField::Station => write!(f, "station"),
            TamperField::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// Which event was tampered and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TamperRecord {
    /// Tampered event
    pub event_id: Uuid,
    /// Card owning the event
    pub card_id: Uuid,
    /// Field modified
    pub field: TamperField,
}

/// Corrupts events in place
#[derive(Debug, Clone, Copy, Default)]
pub struct TamperSimulator;

impl TamperSimulator {
    /// Pick one event uniformly at random and modify a content field
    ///
    /// The stored `hash` is left untouched. Returns `None` for an empty slice.
    pub fn tamper_random_event<R: Rng>(
        events: &mut [LedgerEvent],
        rng: &mut R,
    ) -> Option<TamperRecord> {
        if events.is_empty() {
            return None;
        }

        let index = rng.gen_range(0..events.len());
        let event = &mut events[index];

        let field = match rng.gen_range(0..3) {
            0 => {
                let cents: i64 = rng.gen_range(1..=5000);
                event.fare_charged += Decimal::new(cents, 2);
                TamperField::Fare
            }
            1 => {
                event.station = Some(match event.station.take() {
                    Some(station) => format!("{}{}", station, STATION_MARKER),
                    None => STATION_MARKER.trim_start_matches('-').to_string(),
                });
                TamperField::Station
            }
            _ => {
                let secs: i64 = rng.gen_range(1..=3600);
                event.timestamp += Duration::seconds(secs);
                TamperField::Timestamp
            }
        };

        tracing::warn!(
            event_id = %event.id,
            card_id = %event.card_id,
            field = %field,
            "Event tampered"
        );

        Some(TamperRecord {
            event_id: event.id,
            card_id: event.card_id,
            field,
        })
    }
}
