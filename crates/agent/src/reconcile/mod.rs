//! Reconciliation: desired instances in, observed status out.

pub mod reconciler;

pub use reconciler::{ReconcileError, Reconciler, ReconcilerHandle};
