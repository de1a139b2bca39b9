//! Monotonic read/write controllers and alignment-aware criteria for
//! sequence-to-sequence training with candle.
//!
//! - [`models::hmm_controls`]: an HMM over source positions whose transitions
//!   are predicted by a small gate network, with a forward-backward E-step that
//!   turns alignment scores into soft read/write labels.
//! - [`criterions`]: label-smoothed cross-entropy plus an alignment
//!   regulariser, and the cross-worker reduction of its logging statistics.

pub mod config;
pub mod criterions;
pub mod models;
pub mod utils;

pub use config::{Config, ControlsConfig, CriterionConfig};
