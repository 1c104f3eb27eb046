//! Fixtures shared by unit tests

use crate::types::{Card, EventType, LedgerEvent, GENESIS_PREV_HASH};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Fixed instant offset by `secs`
pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 23, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

/// Seal `(type, fare, station)` rows into a valid chain, one minute apart
pub(crate) fn chain_of(
    card_id: Uuid,
    rows: &[(EventType, Decimal, Option<&str>)],
) -> Vec<LedgerEvent> {
    let mut prev = GENESIS_PREV_HASH.to_string();
    rows
        .iter()
        .enumerate()
        .map(|(i, (ty, fare, station))| {
            let event = LedgerEvent::new(
                card_id,
                *ty,
                *fare,
                station.map(str::to_string),
                ts(60 * i as i64),
            )
            .seal(prev.clone());
            prev = event.hash.clone();
            event
        })
        .collect()
}

/// Valid chain of `n` events: a top-up followed by alternating taps
pub(crate) fn card_chain(n: usize) -> (Uuid, Vec<LedgerEvent>) {
    let card_id = Uuid::new_v4();
    let rows: Vec<(EventType, Decimal, Option<&str>)> = (0..n)
        .map(|i| match i {
            0 => (EventType::TopUp, Decimal::new(5000, 2), None),
            i if i % 2 == 1 => (EventType::TapIn, Decimal::ZERO, Some("Jurong East")),
            _ => (EventType::TapOut, Decimal::new(110, 2), Some("Bishan")),
        })
        .collect();
    (card_id, chain_of(card_id, &rows))
}

/// `[TopUp 10, TapIn A, TapOut B 1.29]` with the card recording `balance`
pub(crate) fn journey(balance: Decimal) -> (Card, Vec<LedgerEvent>) {
    let card = Card::new(Uuid::new_v4(), balance);
    let events = chain_of(
        card.id,
        &[
            (EventType::TopUp, Decimal::TEN, None),
            (EventType::TapIn, Decimal::ZERO, Some("Station A")),
            (EventType::TapOut, Decimal::new(129, 2), Some("Station B")),
        ],
    );
    (card, events)
}
