//! Ledger-wide validation
//!
//! Events are grouped by card and each group is audited on the blocking
//! pool, at most `max_parallel_cards` at a time. Finished audits flow back
//! through a channel; a card whose task fails is listed in
//! [`ValidationReport::failed_cards`] and the rest of the pass carries on.
//!
//! Validation never writes to the store. It refreshes the Merkle cache as a
//! byproduct, without clobbering roots that a repair stored after the
//! validated data was loaded.

use crate::audit::{CardAudit, ChainAuditor, Issue};
use crate::config::AuditConfig;
use crate::merkle::{CardBranch, MerkleCache};
use crate::metrics::Metrics;
use crate::store::LedgerReader;
use crate::types::{Card, LedgerEvent};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Outcome of one validation pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    /// Chain issues first, then balance issues
    pub issues: Vec<Issue>,
    /// Distinct cards seen (with events or registered)
    pub cards_checked: usize,
    /// Events audited
    pub events_checked: usize,
    /// Cards whose audit task failed
    pub failed_cards: Vec<Uuid>,
}

impl ValidationReport {
    /// No issues and no failed audits
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty() && self.failed_cards.is_empty()
    }

    /// Issues of one card, in discovery order
    pub fn issues_for(&self, card_id: Uuid) -> Vec<&Issue> {
        self.issues.iter().filter(|i| i.card_id == card_id).collect()
    }

    /// Number of hash and link issues
    pub fn chain_issue_count(&self) -> usize {
        self.issues.iter().filter(|i| i.kind.is_chain_issue()).count()
    }
}

/// Audit of one card's events
type CardAuditFn = fn(Uuid, Vec<LedgerEvent>) -> CardAudit;

/// Fans the chain auditor out across cards and aggregates the findings
#[derive(Debug, Clone)]
pub struct IntegrityOrchestrator {
    cache: Arc<MerkleCache>,
    config: AuditConfig,
    metrics: Option<Metrics>,
    audit_card: CardAuditFn,
}

impl IntegrityOrchestrator {
    /// Create orchestrator writing roots into `cache`
    pub fn new(cache: Arc<MerkleCache>, config: AuditConfig) -> Self {
        Self {
            cache,
            config,
            metrics: None,
            audit_card: ChainAuditor::audit_card,
        }
    }

    #[cfg(test)]
    fn with_auditor(mut self, audit_card: CardAuditFn) -> Self {
        self.audit_card = audit_card;
        self
    }

    /// Record validation metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Merkle cache refreshed by each pass
    pub fn cache(&self) -> &Arc<MerkleCache> {
        &self.cache
    }

    /// Validate every card found in `events` or `cards`
    ///
    /// The data may have been loaded at any earlier point, so roots stored
    /// by repairs are left in the cache.
    pub async fn validate(
        &self,
        events: Vec<LedgerEvent>,
        cards: Vec<Card>,
    ) -> Result<ValidationReport> {
        self.validate_loaded(events, cards, None).await
    }

    /// Load everything from `store` and validate it
    pub async fn validate_store<S>(&self, store: Arc<S>) -> Result<ValidationReport>
    where
        S: LedgerReader + ?Sized + 'static,
    {
        let generation = self.cache.generation();
        let (events, cards) = tokio::task::spawn_blocking(move || -> Result<_> {
            Ok((store.load_events()?, store.load_cards()?))
        })
        .await??;

        self.validate_loaded(events, cards, Some(generation)).await
    }

    /// `generation` is the cache generation captured before the load
    async fn validate_loaded(
        &self,
        events: Vec<LedgerEvent>,
        cards: Vec<Card>,
        generation: Option<u64>,
    ) -> Result<ValidationReport> {
        let started = Instant::now();

        // An event delivered twice is audited once
        let mut seen_events = HashSet::with_capacity(events.len());
        let mut groups: HashMap<Uuid, Vec<LedgerEvent>> = HashMap::new();
        for event in events {
            if seen_events.insert(event.id) {
                groups.entry(event.card_id).or_default().push(event);
            }
        }
        let events_checked = seen_events.len();

        let card_ids: HashSet<Uuid> = groups
            .keys()
            .copied()
            .chain(cards.iter().map(|c| c.id))
            .collect();
        let audited_cards: Vec<Uuid> = groups.keys().copied().collect();

        let audits = self.audit_groups(groups).await?;

        let mut issues = Vec::new();
        let mut branches: HashMap<Uuid, CardBranch> = HashMap::with_capacity(audits.len());
        for audit in audits {
            issues.extend(audit.issues);
            if let Some(branch) = audit.branch {
                branches.insert(audit.card_id, branch);
            }
        }

        let mut failed_cards: Vec<Uuid> = audited_cards
            .into_iter()
            .filter(|id| !branches.contains_key(id))
            .collect();
        failed_cards.sort();

        for card in &cards {
            if failed_cards.contains(&card.id) {
                continue;
            }
            let history = branches
                .get(&card.id)
                .map(|b| b.events.as_slice())
                .unwrap_or(&[]);
            if let Some(issue) =
                ChainAuditor::reconcile_balance(card, history, self.config.balance_epsilon)
            {
                issues.push(issue);
            }
        }

        let mut seen_issues = HashSet::with_capacity(issues.len());
        issues.retain(|issue| seen_issues.insert(issue.clone()));

        self.cache.merge_scan(generation, branches);

        let report = ValidationReport {
            issues,
            cards_checked: card_ids.len(),
            events_checked,
            failed_cards,
        };

        let elapsed = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_validation(&report.issues, elapsed.as_secs_f64());
        }

        tracing::info!(
            cards = report.cards_checked,
            events = report.events_checked,
            issues = report.issues.len(),
            failed = report.failed_cards.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Validation complete"
        );

        Ok(report)
    }

    /// Audit each card's events on the blocking pool and collect the results
    async fn audit_groups(&self, groups: HashMap<Uuid, Vec<LedgerEvent>>) -> Result<Vec<CardAudit>> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_cards.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<CardAudit>();
        let mut tasks = JoinSet::new();
        let audit_card = self.audit_card;

        for (card_id, card_events) in groups {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Concurrency(e.to_string()))?;
            let tx = tx.clone();

            tasks.spawn_blocking(move || {
                let _permit = permit;
                let audit = audit_card(card_id, card_events);
                // Receiver outlives every task
                let _ = tx.send(audit);
            });
        }
        drop(tx);

        // A panicking audit only loses its own card
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Card audit task failed");
            }
        }

        let mut audits = Vec::new();
        while let Some(audit) = rx.recv().await {
            audits.push(audit);
        }

        Ok(audits)
    }
}
