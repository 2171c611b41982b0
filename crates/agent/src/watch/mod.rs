//! Log-readiness watching for containers coming up.

pub mod ready;

pub use ready::{ReadyWatcher, WatchError};
