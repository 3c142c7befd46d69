use keel_core::Namespace;
use std::time::Duration;

/// Engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Upper bound for a single call attempt. The request deadline wins when
    /// it is closer.
    pub call_timeout: Duration,
    /// Additional attempts after a transient failure.
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_backoff: Duration,
    /// Namespace for `store_as` writes when the request names none.
    pub default_namespace: Namespace,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_millis(100),
            default_namespace: Namespace::new_unchecked("results"),
        }
    }
}
