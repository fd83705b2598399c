//! IR-level rewrites that run between construction and lowering.
pub mod tco;
