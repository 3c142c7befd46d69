use std::time::Duration;

/// When the store writes through to its persistence backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// After every successful `put` or `delete` that changed something.
    OnWrite,
    /// Periodically, when something changed since the last flush.
    Interval(Duration),
    /// Only when `flush` is called.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Live entries allowed per namespace.
    pub max_entries_per_namespace: usize,
    /// TTL applied when `put` is called without one.
    pub default_ttl: Option<Duration>,
    pub flush_policy: FlushPolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries_per_namespace: 1000,
            default_ttl: None,
            flush_policy: FlushPolicy::OnWrite,
        }
    }
}
