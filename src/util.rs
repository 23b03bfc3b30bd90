// Trace output used by the GC and VM dispatch loop during tests. Kept
// silent in release builds so the hot paths never pay for formatting.
#[macro_export]
macro_rules! trace(
    ( $($thing:expr),* ) => { if cfg!(test) { println! { $($thing),* } } };
);
