//! Engine configuration

use std::time::Duration;

/// Tunables for one engine instance.
///
/// Defaults match production behavior; tests shrink the debounce window
/// so coalescing can be observed without waiting.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How long per-user update broadcasts are coalesced before firing
    pub debounce_window: Duration,
    /// When set, wiring rules that name a missing target or an input the
    /// target never registered become validation errors instead of
    /// warnings
    pub strict_wiring: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(2),
            strict_wiring: false,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    pub fn with_strict_wiring(mut self, strict: bool) -> Self {
        self.strict_wiring = strict;
        self
    }
}
