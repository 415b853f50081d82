use serde::{Deserialize, Serialize};

/// Largest priority a trust condition may carry unless configured otherwise
pub const DEFAULT_MAX_PRIORITY: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Trust priorities must lie in `1..=max_priority`; the peer's own transactions get `max_priority + 1`
    pub max_priority: u32,

    /// Whether replay-on-reconnect compares recomputed decisions with the recorded ones
    pub verify_replay: bool,

    /// When two accepted updates on the same initial fact cannot be ordered, defer the later chain instead of
    /// failing the round
    pub defer_on_undetermined_precedence: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self { Self::strict() }
}

impl ReconcilerConfig {
    pub fn new(max_priority: u32) -> Self { Self { max_priority, ..Self::strict() } }

    /// Every consistency fault aborts the operation
    pub fn strict() -> Self { Self { max_priority: DEFAULT_MAX_PRIORITY, verify_replay: true, defer_on_undetermined_precedence: false } }

    /// Precedence failures defer rather than abort
    pub fn lenient() -> Self { Self { defer_on_undetermined_precedence: true, ..Self::strict() } }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> { serde_json::from_str(json) }

    pub fn own_priority(&self) -> u32 { self.max_priority.saturating_add(1) }
}
