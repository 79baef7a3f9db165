//! Configuration for the heritage and merge pipelines.
//!
//! [`HeritageConfig`] gathers the tunables that the driver may want to adjust per function:
//! solver bounds for guard analysis, default space delays, and merge behavior. The defaults
//! mirror what a typical decompilation run uses.
//!
//! # Example
//!
//! ```rust,ignore
//! use heritage::HeritageConfig;
//!
//! let config = HeritageConfig::new()
//!     .with_max_solver_iterations(2_000)
//!     .with_speculative_merges(false);
//! ```

/// Tunables for a heritage and merge run over one function.
#[derive(Debug, Clone)]
pub struct HeritageConfig {
    /// Step budget for one value-set solve during guard analysis (default: 10,000).
    ///
    /// Running out of steps is not an error; unsettled values are widened to the full range.
    pub max_solver_iterations: usize,

    /// Number of times a value may change before widening is applied in the wide pass
    /// (default: 2).
    pub widen_after: usize,

    /// Passes to wait before an address space is first linked, unless the space overrides
    /// it (default: 0).
    pub default_delay: u32,

    /// Passes to wait before dead-code removal may touch a space (default: 0).
    pub default_deadcode_delay: u32,

    /// Whether the 1-3/3-1 byte partition heuristic runs during refinement (default: true).
    pub refinement_heuristic: bool,

    /// Whether speculative merges run after the required ones (default: true).
    pub speculative_merges: bool,

    /// Maximum length of a pointer chain followed when looking for the stack base
    /// (default: 32).
    pub max_trace_depth: usize,
}

impl Default for HeritageConfig {
    fn default() -> Self {
        Self {
            max_solver_iterations: 10_000,
            widen_after: 2,
            default_delay: 0,
            default_deadcode_delay: 0,
            refinement_heuristic: true,
            speculative_merges: true,
            max_trace_depth: 32,
        }
    }
}

impl HeritageConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value-set solver step budget.
    #[must_use]
    pub fn with_max_solver_iterations(mut self, iterations: usize) -> Self {
        self.max_solver_iterations = iterations;
        self
    }

    /// Sets how many changes a value may see before it is widened.
    #[must_use]
    pub fn with_widen_after(mut self, count: usize) -> Self {
        self.widen_after = count;
        self
    }

    /// Sets the default linking delay for spaces.
    #[must_use]
    pub fn with_default_delay(mut self, delay: u32) -> Self {
        self.default_delay = delay;
        self
    }

    /// Sets the default dead-code delay for spaces.
    #[must_use]
    pub fn with_default_deadcode_delay(mut self, delay: u32) -> Self {
        self.default_deadcode_delay = delay;
        self
    }

    /// Enables or disables the 1-3/3-1 refinement heuristic.
    #[must_use]
    pub fn with_refinement_heuristic(mut self, enabled: bool) -> Self {
        self.refinement_heuristic = enabled;
        self
    }

    /// Enables or disables speculative merging.
    #[must_use]
    pub fn with_speculative_merges(mut self, enabled: bool) -> Self {
        self.speculative_merges = enabled;
        self
    }

    /// Sets the pointer trace depth limit.
    #[must_use]
    pub fn with_max_trace_depth(mut self, depth: usize) -> Self {
        self.max_trace_depth = depth;
        self
    }
}
