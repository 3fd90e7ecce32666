//! Heap configuration

/// Default accounted-bytes limit (64 MiB)
pub const DEFAULT_MAX_BYTES: usize = 64 * 1024 * 1024;

/// Default number of string lookaside cache entries
pub const DEFAULT_STRING_CACHE_SIZE: usize = 4;

/// Default value stack limit (in slots)
pub const DEFAULT_VALSTACK_MAX: usize = 1_000_000;

/// Default call stack limit (in activations)
pub const DEFAULT_CALLSTACK_MAX: usize = 10_000;

/// Default catch stack limit (in catchers)
pub const DEFAULT_CATCHSTACK_MAX: usize = 10_000;

/// Tuning knobs for a [`Heap`](crate::gc::Heap).
///
/// The mark-and-sweep trigger counter starts at `trigger_initial`, is
/// decremented by the number of cells freed in each refzero drain, and runs a
/// voluntary pass when it reaches zero. After every pass it is reset to
/// `live_composites * trigger_mult + trigger_add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    pub max_bytes: usize,
    pub trigger_initial: i64,
    pub trigger_mult: i64,
    pub trigger_add: i64,
    pub string_cache_size: usize,
    pub valstack_max: usize,
    pub callstack_max: usize,
    pub catchstack_max: usize,
    /// Whether drains may start a voluntary mark-and-sweep
    pub voluntary_gc: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            max_bytes: DEFAULT_MAX_BYTES,
            trigger_initial: 10_000,
            trigger_mult: 2,
            trigger_add: 1024,
            string_cache_size: DEFAULT_STRING_CACHE_SIZE,
            valstack_max: DEFAULT_VALSTACK_MAX,
            callstack_max: DEFAULT_CALLSTACK_MAX,
            catchstack_max: DEFAULT_CATCHSTACK_MAX,
            voluntary_gc: true,
        }
    }
}

impl HeapConfig {
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_trigger(mut self, initial: i64, mult: i64, add: i64) -> Self {
        self.trigger_initial = initial;
        self.trigger_mult = mult;
        self.trigger_add = add;
        self
    }

    pub fn with_string_cache_size(mut self, size: usize) -> Self {
        self.string_cache_size = size;
        self
    }

    pub fn with_stack_limits(mut self, valstack: usize, callstack: usize, catchstack: usize) -> Self {
        self.valstack_max = valstack;
        self.callstack_max = callstack;
        self.catchstack_max = catchstack;
        self
    }

    /// Disable drain-driven mark-and-sweep; passes then only run on request
    /// or under allocation pressure.
    pub fn without_voluntary_gc(mut self) -> Self {
        self.voluntary_gc = false;
        self
    }

    /// Trigger counter value after a pass that left `live` composite cells.
    pub fn next_trigger(&self, live: usize) -> i64 {
        (live as i64)
            .saturating_mul(self.trigger_mult)
            .saturating_add(self.trigger_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HeapConfig::default();
        assert!(config.voluntary_gc);
        assert_eq!(config.string_cache_size, DEFAULT_STRING_CACHE_SIZE);
        assert!(config.trigger_initial > 0);
    }

    #[test]
    fn test_next_trigger() {
        let config = HeapConfig::default().with_trigger(10, 3, 7);
        assert_eq!(config.next_trigger(0), 7);
        assert_eq!(config.next_trigger(5), 22);
    }

    #[test]
    fn test_builders() {
        let config = HeapConfig::default()
            .with_max_bytes(4096)
            .with_stack_limits(10, 2, 1)
            .without_voluntary_gc();
        assert_eq!(config.max_bytes, 4096);
        assert_eq!(config.valstack_max, 10);
        assert_eq!(config.callstack_max, 2);
        assert_eq!(config.catchstack_max, 1);
        assert!(!config.voluntary_gc);
    }
}
