//! Fuzzing harnesses for the pktq rx queue.
//!
//! The models replay reservations, commits, swaps and region lifecycle
//! transitions against the real index word and region, checking the
//! queue's invariants after every step.

pub mod index_model;
pub mod mpdb_model;
pub mod region_model;
