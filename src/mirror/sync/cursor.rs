use chrono::{DateTime, Utc};

/// Per-kind sync bookkeeping.
///
/// Besides the success and failure history, the cursor carries the fetch gate for orphan
/// deletion: a pass may only delete mirror records for a kind after its own ledger fetch for
/// that kind succeeded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncCursor {
    first_full_pass_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    passes_completed: u64,
    consecutive_failures: u32,
    fetched_this_pass: bool,
}

impl SyncCursor {
    /// Reset the per-pass fetch gate
    pub fn begin_pass(&mut self) {
        self.fetched_this_pass = false;
    }

    /// Record that the authoritative set for this pass was fetched
    pub fn record_fetch(&mut self) {
        self.fetched_this_pass = true;
    }

    pub fn may_delete_orphans(&self) -> bool {
        self.fetched_this_pass
    }

    pub fn record_success(&mut self) {
        let now = Utc::now();
        self.first_full_pass_at.get_or_insert(now);
        self.last_success_at = Some(now);
        self.passes_completed += 1;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.fetched_this_pass = false;
        self.last_failure_at = Some(Utc::now());
        self.last_error = Some(error.into());
        self.consecutive_failures += 1;
    }

    /// When a pass first completed for this kind
    pub fn first_full_pass_at(&self) -> Option<DateTime<Utc>> {
        self.first_full_pass_at
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn passes_completed(&self) -> u64 {
        self.passes_completed
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
