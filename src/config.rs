//! Engine configuration
//!
//! The engine is configured by whatever loads it (agent startup, tests); the
//! loading itself is out of scope here, so the struct only needs to be
//! deserializable and carry sane defaults.

use serde::{Deserialize, Serialize};

/// Tunables of the tracing core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Assign per-class unique ids to observed objects.
    ///
    /// Disabling trades traceability for lower overhead and bounded registry
    /// growth: every `identify` returns the sentinel and every `probe` comes
    /// back empty.
    pub identify: bool,

    /// Flush non-final trees to the processor pipeline at shutdown.
    ///
    /// Best effort: a flushed tree is handed over exactly as built so far,
    /// possibly with an open root.
    pub flush_on_shutdown: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            identify: true,
            flush_on_shutdown: true,
        }
    }
}
