//! Instance workloads: composed pod+container lifecycle.

pub mod service;

pub use service::{Health, Workload, WorkloadService};
