//! Lumen Worker
//!
//! Derivation queue: a bounded channel feeding a fixed pool of workers that claim a media
//! record, run its deriver, store the derivatives and commit the result.

pub mod context;
pub mod queue;

pub use context::{noop_listener, DerivationListener, TaskOutcome};
pub use queue::{DerivationQueue, DerivationQueueConfig, DerivationTask, EnqueueError};
