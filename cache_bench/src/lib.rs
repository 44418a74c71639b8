//! Microbenchmarks that recover the cache geometry of the machine they run on,
//! plus the offline analysis of the CSV files they produce.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod analysis;
pub mod associativity;
pub mod cli;
pub mod error;
pub mod geometry;
pub mod line_size;
pub mod working_set;
