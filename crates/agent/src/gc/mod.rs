//! Garbage collection: a periodic executor fanning out to collectors.

pub mod executor;

pub use executor::{Collector, GcExecutor, GcHandle};
