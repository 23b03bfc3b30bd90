// Tunables for the interpreter. Defaults mirror the `#define` constants
// the reference implementation uses for pool/stack/GC sizing.

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Strings shorter than this many bytes are interned in the string pool.
    pub pool_threshold: usize,
    /// Initial value-stack capacity for a fresh context.
    pub init_stack: usize,
    /// Hard ceiling on value-stack growth; exceeding it is a panic.
    pub max_stack: usize,
    /// Bytes allocated since the last cycle before a new GC cycle is scheduled.
    pub gc_threshold: usize,
    /// Objects swept per `Sweep` step.
    pub sweep_step: usize,
    /// Hash buckets swept per `SweepString` step.
    pub sweep_string_step: usize,
    /// Maximum level for skip-list nodes.
    pub skip_list_max_level: usize,
    /// Bounded stack/backtrace window printed on an uncaught panic.
    pub panic_window: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            pool_threshold: 40,
            init_stack: 128,
            max_stack: 102_400,
            gc_threshold: 10_240,
            sweep_step: 64,
            sweep_string_step: 8,
            skip_list_max_level: 16,
            panic_window: 6,
        }
    }
}
