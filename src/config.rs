/// Simulation configuration.
///
/// Plain data with a few named presets. Nothing here changes the order in
/// which events fire; it only decides how strictly misuse is treated and
/// how much is recorded.

/// Default per-resume cap on transitions that do not suspend.
pub const DEFAULT_MAX_TRANSITIONS: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// Tearing down a resource with outstanding requests is an error when
    /// set, a logged leak otherwise.
    pub strict_resources: bool,
    /// Record a [`TraceLog`](crate::trace::TraceLog) of kernel actions.
    pub trace: bool,
    /// How many transitions one process may make in a row without
    /// suspending before it is failed with `TransitionLimit`.
    pub max_transitions: u32,
}

impl SimConfig {
    /// Debug builds are strict, release builds lenient. No tracing.
    pub fn new() -> Self {
        SimConfig {
            strict_resources: cfg!(debug_assertions),
            trace: false,
            max_transitions: DEFAULT_MAX_TRANSITIONS,
        }
    }

    /// Leaked requests are errors.
    pub fn strict() -> Self {
        SimConfig {
            strict_resources: true,
            ..Self::new()
        }
    }

    /// Leaked requests are only logged.
    pub fn lenient() -> Self {
        SimConfig {
            strict_resources: false,
            ..Self::new()
        }
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_max_transitions(mut self, limit: u32) -> Self {
        self.max_transitions = limit;
        self
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert!(SimConfig::strict().strict_resources);
        assert!(!SimConfig::lenient().strict_resources);
        assert_eq!(SimConfig::new(), SimConfig::default());
        assert_eq!(SimConfig::new().max_transitions, DEFAULT_MAX_TRANSITIONS);
    }

    #[test]
    fn test_builders() {
        let cfg = SimConfig::lenient().with_trace(true).with_max_transitions(3);
        assert!(cfg.trace);
        assert_eq!(cfg.max_transitions, 3);
        assert!(!cfg.strict_resources);
    }
}
