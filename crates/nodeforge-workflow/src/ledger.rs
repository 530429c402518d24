//! Step lifecycle tracking
//!
//! Every step owns one [`Ledger`]. It holds the step's [`Lifecycle`] and the
//! record of what the current run did, and it is the only place those two
//! are allowed to change.

use crate::report::Report;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

/// Lifecycle of a step within one process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    NotStarted,
    Executing,
    Completed,
    Failed,
    RolledBack,
}

impl Lifecycle {
    /// Whether an execution has finished and rollback is still possible
    pub fn can_roll_back(&self) -> bool {
        matches!(self, Lifecycle::Completed | Lifecycle::Failed)
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Lifecycle::NotStarted => "not started",
            Lifecycle::Executing => "executing",
            Lifecycle::Completed => "completed",
            Lifecycle::Failed => "failed",
            Lifecycle::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Entry<R> {
    lifecycle: Lifecycle,
    record: R,
}

/// Lifecycle state plus the per-run record `R`
#[derive(Debug)]
pub struct Ledger<R> {
    inner: Mutex<Entry<R>>,
}

impl<R: Default + Clone> Default for Ledger<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Default + Clone> Ledger<R> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Entry {
                lifecycle: Lifecycle::NotStarted,
                record: R::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entry<R>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a new run: reset the record and enter `Executing`
    pub fn begin(&self) {
        let mut entry = self.lock();
        entry.lifecycle = Lifecycle::Executing;
        entry.record = R::default();
    }

    /// Update the current run's record
    pub fn record(&self, f: impl FnOnce(&mut R)) {
        f(&mut self.lock().record);
    }

    /// End the run according to the report it produced
    pub fn finish(&self, report: &Report) {
        self.lock().lifecycle = if report.is_failed() {
            Lifecycle::Failed
        } else {
            Lifecycle::Completed
        };
    }

    /// Hand out the record for rollback, at most once per run
    ///
    /// Returns `None` unless the run is `Completed` or `Failed`. The record
    /// itself stays readable through [`Ledger::snapshot`].
    pub fn take_for_rollback(&self) -> Option<R> {
        let mut entry = self.lock();
        if !entry.lifecycle.can_roll_back() {
            return None;
        }
        entry.lifecycle = Lifecycle::RolledBack;
        Some(entry.record.clone())
    }

    /// Mark the run as already rolled back
    pub fn mark_rolled_back(&self) {
        self.lock().lifecycle = Lifecycle::RolledBack;
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lock().lifecycle
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> R {
        self.lock().record.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Flags {
        created: bool,
    }

    #[test]
    fn test_rollback_from_not_started_is_none() {
        let ledger: Ledger<Flags> = Ledger::new();
        assert_eq!(ledger.lifecycle(), Lifecycle::NotStarted);
        assert!(ledger.take_for_rollback().is_none());
    }

    #[test]
    fn test_rollback_while_executing_is_none() {
        let ledger: Ledger<Flags> = Ledger::new();
        ledger.begin();
        assert!(ledger.take_for_rollback().is_none());
    }

    #[test]
    fn test_second_rollback_is_none() {
        let ledger: Ledger<Flags> = Ledger::new();
        ledger.begin();
        ledger.record(|r| r.created = true);
        ledger.finish(&Report::success("s"));

        assert_eq!(ledger.take_for_rollback(), Some(Flags { created: true }));
        assert_eq!(ledger.lifecycle(), Lifecycle::RolledBack);
        assert!(ledger.take_for_rollback().is_none());
    }

    #[test]
    fn test_failed_run_can_roll_back() {
        let ledger: Ledger<Flags> = Ledger::new();
        ledger.begin();
        ledger.finish(&Report::failed("s", StepError::internal("x")));

        assert_eq!(ledger.lifecycle(), Lifecycle::Failed);
        assert!(ledger.take_for_rollback().is_some());
    }

    #[test]
    fn test_begin_resets_record() {
        let ledger: Ledger<Flags> = Ledger::new();
        ledger.begin();
        ledger.record(|r| r.created = true);
        ledger.finish(&Report::success("s"));

        ledger.begin();
        assert_eq!(ledger.snapshot(), Flags::default());
        assert_eq!(ledger.lifecycle(), Lifecycle::Executing);
    }

    #[test]
    fn test_mark_rolled_back() {
        let ledger: Ledger<Flags> = Ledger::new();
        ledger.begin();
        ledger.finish(&Report::success("s"));
        ledger.mark_rolled_back();
        assert!(ledger.take_for_rollback().is_none());
    }
}
