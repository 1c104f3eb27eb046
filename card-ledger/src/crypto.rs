//! Canonical hashing for ledger events
//!
//! This module provides:
//! - SHA-256 hashing of an event's immutable fields
//! - SHA-256 hashing of hex digest pairs (Merkle internal nodes)
//! - Case-insensitive digest comparison
//!
//! # Canonical form
//!
//! ```text
//! id | card_id | event_type | fare_charged | station | timestamp | prev_hash
//! ```
//!
//! Ids are hyphenated lowercase UUIDs, the fare is the normalized decimal
//! (`1.290` → `1.29`), an absent station is the empty string and the
//! timestamp is RFC 3339 UTC with nanoseconds (`2024-04-23T08:00:00.000000000Z`).
//! Every stored hash depends on this layout; changing it invalidates all of
//! them.

use crate::types::LedgerEvent;
use chrono::SecondsFormat;
use sha2::{Digest, Sha256};

/// Field separator in the canonical byte string
const FIELD_SEPARATOR: u8 = b'|';

/// Canonical byte string of an event's immutable fields
pub fn canonical_bytes(event: &LedgerEvent) -> Vec<u8> {
    let id = event.id.hyphenated().to_string();
    let card_id = event.card_id.hyphenated().to_string();
    let fare = event.fare_charged.normalize().to_string();
    let timestamp = event.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);

    let fields: [&str; 7] = [
        id.as_str(),
        card_id.as_str(),
        event.event_type.as_str(),
        fare.as_str(),
        event.station_or_empty(),
        timestamp.as_str(),
        event.prev_hash.as_str(),
    ];

    let mut bytes = Vec::with_capacity(fields.iter().map(|f| f.len() + 1).sum());
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            bytes.push(FIELD_SEPARATOR);
        }
        bytes.extend_from_slice(field.as_bytes());
    }
    bytes
}

/// Hash an event
///
/// Returns the lowercase hex SHA-256 of [`canonical_bytes`]. The stored
/// `hash` field itself is never an input.
pub fn hash_event(event: &LedgerEvent) -> String {
    hex::encode(hash_bytes(&canonical_bytes(event)))
}

/// Hash the concatenation `left || right` of two hex digests (no separator)
pub fn hash_pair(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compare two hex digests, ignoring ASCII case
pub fn digests_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Whether the stored hash of `event` matches its recomputed hash
pub fn verify_event_hash(event: &LedgerEvent) -> bool {
    digests_match(&event.hash, &hash_event(event))
}
