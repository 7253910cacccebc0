//! Background janitor.

mod service;

pub use service::{CleanupReport, CleanupService};
