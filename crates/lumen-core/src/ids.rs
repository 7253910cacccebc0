//! Media and session identifier generation.
//!
//! Identifiers are opaque, URL-safe strings. The generator is injected so tests can produce
//! deterministic ids while production uses random v4 UUIDs (122 bits of entropy).

use std::sync::atomic::{AtomicU64, Ordering};

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs in hyphenated form.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Deterministic `{prefix}-{n}` ids, starting at 1.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{:06}", self.prefix, n)
    }
}

/// Whether `id` is safe to embed in a URL path segment or storage key.
pub fn is_url_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_ids_are_unique_and_url_safe() {
        let gen = UuidIdGenerator;
        let a = gen.next_id();
        let b = gen.next_id();
        assert_ne!(a, b);
        assert!(is_url_safe_id(&a));
        assert_eq!(uuid::Uuid::parse_str(&a).unwrap().get_version_num(), 4);
    }

    #[test]
    fn test_sequential_ids() {
        let gen = SequentialIdGenerator::new("media");
        assert_eq!(gen.next_id(), "media-000001");
        assert_eq!(gen.next_id(), "media-000002");
    }

    #[test]
    fn test_url_safety() {
        assert!(is_url_safe_id("abc_DEF-123"));
        assert!(!is_url_safe_id(""));
        assert!(!is_url_safe_id("../etc"));
        assert!(!is_url_safe_id("a/b"));
        assert!(!is_url_safe_id(&"x".repeat(129)));
    }
}
