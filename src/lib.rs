//! Parallel minimal-residual iteration for dense linear systems `A·x = b`.
//!
//! Matrix rows are split into contiguous blocks across a fixed group of
//! workers; vectors are replicated and kept consistent with collective
//! operations behind [`solver::comm::CommunicationBackend`].

pub mod config;
pub mod error;
pub mod output;
pub mod problem;
pub mod solver;
pub mod stats;
