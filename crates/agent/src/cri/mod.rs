//! CRI façade — thin composite operations over the raw runtime client.

pub mod facade;
pub mod labels;

pub use facade::Cri;
