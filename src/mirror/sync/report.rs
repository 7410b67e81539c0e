//! Per-kind and per-pass outcome reporting.
//!
//! An `EntityReport` is filled in by the reconciler while it walks one kind's records; a
//! `PassReport` collects the reports of every kind visited by one pass, plus the kinds that
//! failed outright. Both are published on the coordinator's event channel and logged.

use crate::ledger::EntityKind;
use crate::mirror::sync::coordinator::TriggerSource;

use chrono::{DateTime, Utc};

/// What happened to a single ledger record during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Counters and collected errors for one kind in one pass
#[derive(Debug, Clone, PartialEq)]
pub struct EntityReport {
    pub kind: EntityKind,
    /// Distinct records in the ledger's authoritative set
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Orphaned mirror records removed
    pub deleted: usize,
    /// Surplus copies of a record removed by dedup
    pub duplicates_removed: usize,
    /// Blob slots left without content because the fetch failed
    pub enrichment_failures: usize,
    /// Whether orphan cleanup ran for this kind
    pub orphans_checked: bool,
    /// Per-record store errors; the affected records were skipped
    pub errors: Vec<String>,
}

impl EntityReport {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            fetched: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            deleted: 0,
            duplicates_removed: 0,
            enrichment_failures: 0,
            orphans_checked: false,
            errors: Vec::new(),
        }
    }

    pub fn record_outcome(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Created => self.created += 1,
            RecordOutcome::Updated => self.updated += 1,
            RecordOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Number of store writes this kind caused
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted + self.duplicates_removed
    }

    /// Get a human-readable summary of the kind's outcome
    pub fn summary(&self) -> String {
        format!(
            "{}: {} fetched, {} created, {} updated, {} unchanged, {} deleted, {} duplicates removed{}{}{}",
            self.kind,
            self.fetched,
            self.created,
            self.updated,
            self.unchanged,
            self.deleted,
            self.duplicates_removed,
            if self.orphans_checked {
                ""
            } else {
                ", orphan cleanup skipped"
            },
            if self.enrichment_failures == 0 {
                String::new()
            } else {
                format!(", {} blobs unresolved", self.enrichment_failures)
            },
            if self.errors.is_empty() {
                String::new()
            } else {
                format!(" ({} errors)", self.errors.len())
            }
        )
    }
}

/// Outcome of one full pass over every kind
#[derive(Debug, Clone)]
pub struct PassReport {
    /// Sequence number of the pass within this coordinator
    pub pass: u64,
    pub trigger: TriggerSource,
    pub entities: Vec<EntityReport>,
    /// Kinds whose pass failed before any write, with the reason
    pub failures: Vec<(EntityKind, String)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PassReport {
    pub fn new(pass: u64, trigger: TriggerSource) -> Self {
        Self {
            pass,
            trigger,
            entities: Vec::new(),
            failures: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.entities.iter().all(|e| e.errors.is_empty())
    }

    pub fn summary(&self) -> String {
        let elapsed_ms = self
            .finished_at
            .map(|finished| (finished - self.started_at).num_milliseconds())
            .unwrap_or_default();

        format!(
            "Pass {} ({}) finished in {} ms: {} kinds synced, {} failed, {} writes",
            self.pass,
            self.trigger,
            elapsed_ms,
            self.entities.len(),
            self.failures.len(),
            self.entities.iter().map(EntityReport::writes).sum::<usize>()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_mentions_unresolved_blobs_only_when_present() {
        let mut report = EntityReport::new(EntityKind::Product);
        report.fetched = 2;
        report.orphans_checked = true;
        report.record_outcome(RecordOutcome::Created);
        report.record_outcome(RecordOutcome::Unchanged);
        assert!(!report.summary().contains("unresolved"));

        report.enrichment_failures = 1;
        report.record_error("store down");
        let summary = report.summary();
        assert!(summary.contains("1 blobs unresolved"));
        assert!(summary.contains("(1 errors)"));
        assert_eq!(report.writes(), 1);
    }

    #[test]
    fn pass_is_clean_without_failures_or_errors() {
        let mut pass = PassReport::new(1, TriggerSource::Poll);
        pass.entities.push(EntityReport::new(EntityKind::Profile));
        assert!(pass.is_clean());

        pass.failures.push((EntityKind::Donation, "ledger down".into()));
        pass.finish();
        assert!(!pass.is_clean());
        assert!(pass.summary().starts_with("Pass 1 (poll)"));
    }
}
