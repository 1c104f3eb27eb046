//! Chain auditing for a single card
//!
//! The auditor walks one card's events in chronological order and checks:
//!
//! 1. **Hash integrity** - the stored hash equals the recomputed hash.
//! 2. **Link integrity** - `prev_hash` equals the predecessor's *stored* hash,
//!    or the genesis marker for the first event.
//! 3. **Balance reconciliation** - replaying the events reproduces the
//!    card's recorded balance within a tolerance.
//!
//! Findings are returned as [`Issue`] values, never as errors. A tampered
//! event breaks every link after it; those cascading issues are reported
//! as-is.

use crate::crypto::{digests_match, hash_event};
use crate::merkle::{card_merkle_root, CardBranch};
use crate::types::{
    is_genesis_marker, short_hash, sort_chronologically, Card, EventType, LedgerEvent,
    GENESIS_PREV_HASH,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Kind of integrity finding, with the values that disagreed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind")]
pub enum IssueKind {
    /// Stored hash differs from the recomputed hash
    HashMismatch {
        /// Hash stored on the event
        stored: String,
        /// Hash recomputed from the event's fields
        computed: String,
    },
    /// `prev_hash` does not point at the predecessor (or genesis)
    LinkMismatch {
        /// `prev_hash` stored on the event
        stored: String,
        /// Predecessor's stored hash, or the genesis marker
        expected: String,
    },
    /// Replayed balance differs from the card's recorded balance
    BalanceMismatch {
        /// Balance reconstructed from the ledger
        ledger: Decimal,
        /// Balance recorded on the card
        recorded: Decimal,
    },
    /// A registered card has no events at all
    NoEventsForCard,
}

impl IssueKind {
    /// Short name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            IssueKind::HashMismatch { .. } => "HashMismatch",
            IssueKind::LinkMismatch { .. } => "LinkMismatch",
            IssueKind::BalanceMismatch { .. } => "BalanceMismatch",
            IssueKind::NoEventsForCard => "NoEventsForCard",
        }
    }

    /// Whether the finding concerns the hash chain (as opposed to balances)
    pub fn is_chain_issue(&self) -> bool {
        matches!(
            self,
            IssueKind::HashMismatch { .. } | IssueKind::LinkMismatch { .. }
        )
    }

    fn suggested_fix(&self) -> String {
        match self {
            IssueKind::HashMismatch { .. } => "recompute and persist hash".to_string(),
            IssueKind::LinkMismatch { expected, .. } if is_genesis_marker(expected) => {
                format!("reset prevHash to the {} marker", GENESIS_PREV_HASH)
            }
            IssueKind::LinkMismatch { expected, .. } => format!(
                "set prevHash to predecessor's hash ({})",
                short_hash(expected)
            ),
            IssueKind::BalanceMismatch { .. } => {
                "reconcile stored card balance with ledger".to_string()
            }
            IssueKind::NoEventsForCard => {
                "verify ingestion for card; no ledger events recorded".to_string()
            }
        }
    }
}

/// A single integrity finding
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Issue {
    /// Card the finding belongs to
    pub card_id: Uuid,
    /// Offending event (absent for `NoEventsForCard`)
    pub event_id: Option<Uuid>,
    /// What disagreed
    #[serde(flatten)]
    pub kind: IssueKind,
    /// Human-readable remediation
    pub suggested_fix: String,
}

impl Issue {
    /// Create issue with the default remediation for its kind
    pub fn new(card_id: Uuid, event_id: Option<Uuid>, kind: IssueKind) -> Self {
        let suggested_fix = kind.suggested_fix();
        Self {
            card_id,
            event_id,
            kind,
            suggested_fix,
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.event_id {
            Some(event_id) => write!(
                f,
                "[{}] card {} event {}: {}",
                self.kind.name(),
                self.card_id,
                event_id,
                self.suggested_fix
            ),
            None => write!(
                f,
                "[{}] card {}: {}",
                self.kind.name(),
                self.card_id,
                self.suggested_fix
            ),
        }
    }
}

/// One step of a balance replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceStep {
    /// Event applied
    pub event_id: Uuid,
    /// Type of event applied
    pub event_type: EventType,
    /// Amount of the event
    pub fare_charged: Decimal,
    /// Running balance after the event
    pub balance_after: Decimal,
}

/// Running balances of a card, reconstructed from its events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BalanceReplay {
    /// One step per event, chronological
    pub steps: Vec<BalanceStep>,
}

impl BalanceReplay {
    /// Replay events (already chronological) starting from a zero balance
    pub fn replay(events: &[LedgerEvent]) -> Self {
        let mut balance = Decimal::ZERO;
        let steps = events
            .iter()
            .map(|event| {
                balance += event.event_type.balance_delta(event.fare_charged);
                BalanceStep {
                    event_id: event.id,
                    event_type: event.event_type,
                    fare_charged: event.fare_charged,
                    balance_after: balance,
                }
            })
            .collect();

        Self { steps }
    }

    /// Balance after the chronologically-last event
    pub fn final_balance(&self) -> Option<Decimal> {
        self.steps.last().map(|s| s.balance_after)
    }
}

/// Audit result for one card's chain
#[derive(Debug, Clone)]
pub struct CardAudit {
    /// Card audited
    pub card_id: Uuid,
    /// Chain issues in chronological discovery order
    pub issues: Vec<Issue>,
    /// Root and history for the Merkle cache (absent for an empty chain)
    pub branch: Option<CardBranch>,
}

/// Hash and link auditor for one card's chain
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainAuditor;

impl ChainAuditor {
    /// Check hash and link integrity of events in chronological order
    pub fn audit_chain(card_id: Uuid, events: &[LedgerEvent]) -> Vec<Issue> {
        let mut issues = Vec::new();

        for (i, event) in events.iter().enumerate() {
            let computed = hash_event(event);
            if !digests_match(&event.hash, &computed) {
                tracing::warn!(
                    card_id = %card_id,
                    event_id = %event.id,
                    position = i,
                    stored = %short_hash(&event.hash),
                    computed = %short_hash(&computed),
                    "Event hash mismatch"
                );
                issues.push(Issue::new(
                    card_id,
                    Some(event.id),
                    IssueKind::HashMismatch {
                        stored: event.hash.clone(),
                        computed,
                    },
                ));
            }

            let link_ok = match i {
                0 => is_genesis_marker(&event.prev_hash),
                _ => digests_match(&event.prev_hash, &events[i - 1].hash),
            };
            if !link_ok {
                let expected = match i {
                    0 => GENESIS_PREV_HASH.to_string(),
                    _ => events[i - 1].hash.clone(),
                };
                tracing::warn!(
                    card_id = %card_id,
                    event_id = %event.id,
                    position = i,
                    "Previous-hash link mismatch"
                );
                issues.push(Issue::new(
                    card_id,
                    Some(event.id),
                    IssueKind::LinkMismatch {
                        stored: event.prev_hash.clone(),
                        expected,
                    },
                ));
            }
        }

        issues
    }

    /// Order one card's events, audit the chain and build its Merkle branch
    pub fn audit_card(card_id: Uuid, mut events: Vec<LedgerEvent>) -> CardAudit {
        sort_chronologically(&mut events);
        let issues = Self::audit_chain(card_id, &events);

        let branch = card_merkle_root(&events)
            .ok()
            .map(|root| CardBranch { root, events });

        tracing::debug!(
            card_id = %card_id,
            issues = issues.len(),
            "Card chain audited"
        );

        CardAudit {
            card_id,
            issues,
            branch,
        }
    }

    /// Compare the replayed balance of `events` (chronological) with the card
    pub fn reconcile_balance(
        card: &Card,
        events: &[LedgerEvent],
        epsilon: Decimal,
    ) -> Option<Issue> {
        let last = match events.last() {
            Some(last) => last,
            None => return Some(Issue::new(card.id, None, IssueKind::NoEventsForCard)),
        };

        let ledger = BalanceReplay::replay(events).final_balance()?;
        if (ledger - card.balance).abs() > epsilon {
            tracing::warn!(
                card_id = %card.id,
                ledger = %ledger,
                recorded = %card.balance,
                "Balance mismatch"
            );
            return Some(Issue::new(
                card.id,
                Some(last.id),
                IssueKind::BalanceMismatch {
                    ledger,
                    recorded: card.balance,
                },
            ));
        }

        None
    }
}
