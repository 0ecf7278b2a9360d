//! Storage backends for rate limit counters

pub mod counter_store;

pub use counter_store::{CounterSnapshot, CounterStore, MemoryCounterStore};
