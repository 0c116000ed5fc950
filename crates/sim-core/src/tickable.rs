//! Trait for components that can be advanced by bus ticks.

use crate::Ticks;

/// A component that can be advanced by bus ticks.
///
/// This is the core abstraction for cycle-accurate emulation. Every
/// component (drive, control unit, channel) implements this trait.
pub trait Tickable {
    /// Advance the component by one bus tick.
    ///
    /// Components track their own phase relative to the bus clock and
    /// perform work when appropriate (e.g. a drive that transfers one byte
    /// every thirteen ticks only produces data on the thirteenth).
    fn tick(&mut self);

    /// Advance the component by multiple ticks.
    ///
    /// Default implementation calls `tick()` in a loop. Components may
    /// override for efficiency, but must produce identical results.
    fn tick_n(&mut self, count: Ticks) {
        for _ in 0..count.get() {
            self.tick();
        }
    }
}
