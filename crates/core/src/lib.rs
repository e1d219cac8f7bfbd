//! Domain layer for the overlay alert pipeline.
//!
//! Everything here is free of I/O: provider payload normalization, webhook signature checks,
//! tier resolution, the per-streamer alert queue state machine and the security primitives used
//! by the overlay gate.

pub mod normalizer;
pub mod queue;
pub mod retry;
pub mod security;
pub mod signature;
pub mod tier;
pub mod types;
