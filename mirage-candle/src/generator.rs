//! Autoregressive generation of synthetic episodes.
mod base;
mod config;
pub use base::{binarize_availability, is_terminal, EpisodeStatus, RolloutGenerator};
pub use config::{GeneratorConfig, AVAIL_THRESHOLD, FALLBACK_ACTION, TERM_THRESHOLD};
