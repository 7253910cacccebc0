//! Derivation listener trait
//!
//! The service layer implements this trait to learn how each derivation task ended. The
//! worker calls it once per dequeued task, after any repository write for that task.

use lumen_core::models::MediaRecord;
use std::sync::Arc;

use crate::queue::DerivationTask;

/// How a dequeued task ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// Derivatives were committed and the record is `ready`.
    Ready(MediaRecord),
    /// The record was moved to `failed` with `reason`.
    Failed { reason: String },
    /// Another worker owns the record, or it left the claimable states.
    Skipped,
    /// The record was deleted while the task ran; derivative writes were discarded.
    Discarded,
    /// Nothing was committed; the janitor will pick the record up again.
    Deferred { reason: String },
}

/// Receives task outcomes.
pub trait DerivationListener: Send + Sync {
    fn derivation_finished(&self, task: &DerivationTask, outcome: &TaskOutcome);
}

/// Listener that ignores every outcome.
struct NoopListener;

impl DerivationListener for NoopListener {
    fn derivation_finished(&self, _task: &DerivationTask, _outcome: &TaskOutcome) {}
}

/// Listener to use when nobody is interested in outcomes.
pub fn noop_listener() -> Arc<dyn DerivationListener> {
    Arc::new(NoopListener)
}
