//! Shared in-memory state: the per-topic tick store and the bar cache.

pub mod bars;
pub mod ticks;

pub use bars::BarStore;
pub use ticks::TickStore;
